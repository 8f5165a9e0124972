//! End-to-end runs of the agent loop against the mock device, with both
//! backend wire formats served from canned responses.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use droid_pilot::action::{ActionDescriptor, DeviceCommand};
use droid_pilot::agent::{MemoryRecorder, Outcome, RunRecorder, TurnController};
use droid_pilot::backend::{ClaudeBackend, OpenAiBackend, ReplayTransport};
use droid_pilot::config::{AgentSettings, EndpointSettings};
use droid_pilot::device::{DeviceError, MockDevice};
use droid_pilot::runner::RunResult;
use droid_pilot::session::{Session, SessionRecorder};
use droid_pilot::spec::{TestSpec, parse_spec};

const PACKAGE: &str = "com.example.notes";

fn endpoint(url: &str) -> EndpointSettings {
    EndpointSettings {
        endpoint: url.to_string(),
        model: "test-model".to_string(),
        api_key: Some("test-key".to_string()),
    }
}

fn settings(max_turns: u32) -> AgentSettings {
    AgentSettings::defaults()
        .max_turns(max_turns)
        .action_delay(Duration::ZERO)
}

fn device() -> MockDevice {
    MockDevice::new(200, 400).with_installed(PACKAGE)
}

fn single_step_spec() -> TestSpec {
    parse_spec(
        &format!(
            r#"{{"package": "{}", "skip_install": true, "goal": "Create a note named {{timestamp}}",
                "success_criteria": "Home screen visible"}}"#,
            PACKAGE
        ),
        "1700000000",
    )
    .unwrap()
}

fn two_step_spec() -> TestSpec {
    parse_spec(
        &format!(
            r#"{{"package": "{}", "skip_install": true, "steps": [
                {{"goal": "Open the menu", "success_criteria": "Menu is open"}},
                {{"goal": "Open settings", "success_criteria": "Settings visible"}}
            ]}}"#,
            PACKAGE
        ),
        "0",
    )
    .unwrap()
}

fn openai_click(x: u32, y: u32) -> Value {
    json!({"output": [
        {"type": "reasoning", "summary": [{"type": "summary_text", "text": "Tap the button."}]},
        {"type": "computer_call", "call_id": "call_1", "action": {"type": "click", "button": "left", "x": x, "y": y}},
    ]})
}

fn openai_end(success: bool, reason: &str) -> Value {
    let arguments = json!({"success": success, "reason": reason}).to_string();
    json!({"output": [{"type": "function_call", "name": "end_test", "call_id": "fc_1", "arguments": arguments}]})
}

fn claude_click(id: &str, x: u32, y: u32) -> Value {
    json!({"content": [
        {"type": "text", "text": "Clicking."},
        {"type": "tool_use", "id": id, "name": "computer", "input": {"action": "left_click", "coordinate": [x, y]}},
    ]})
}

fn claude_end(id: &str, reason: &str) -> Value {
    json!({"content": [
        {"type": "tool_use", "id": id, "name": "end_test", "input": {"success": true, "reason": reason}},
    ]})
}

fn user_text(request_body: &Value) -> String {
    request_body["input"][1]["content"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_stateless_backend_run_succeeds() {
    let transport = ReplayTransport::new();
    transport.push(openai_click(100, 200)).push(openai_end(true, "note saved"));
    let observer = transport.clone();
    let backend = OpenAiBackend::new(endpoint("https://openai.test/v1/responses"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), MemoryRecorder::new(), settings(10));
    let result = controller.run(&single_step_spec());

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.reason.as_deref(), Some("note saved"));
    assert_eq!(result.total_turns, 2);
    assert_eq!(observer.remaining(), 0);

    let requests = observer.requests();
    let first = user_text(&requests[0].body);
    assert!(first.contains("Goal: Create a note named 1700000000"));
    assert!(first.contains("Success criteria: Home screen visible"));
    assert!(!first.contains("Recent turns"));

    // Every stateless request carries the recent turns again
    let second = user_text(&requests[1].body);
    assert!(second.contains("turn 1: tap(100, 200) -> ok"));
    assert_eq!(requests[1].body["tools"][0]["display_width"], 200);

    let recorder = controller.recorder();
    assert_eq!(recorder.turns[0].rationale.as_deref(), Some("Tap the button."));
    assert_eq!(recorder.turns[0].command, Some(DeviceCommand::Tap { x: 100, y: 200 }));
    assert_eq!(recorder.result.as_ref().map(|r| r.outcome), Some(Outcome::Succeeded));
}

#[test]
fn test_loop_guard_substitutes_back_on_turn_ten() {
    let transport = ReplayTransport::new();
    for _ in 0..10 {
        transport.push(openai_click(50, 50));
    }
    let backend = OpenAiBackend::new(endpoint("https://openai.test/v1/responses"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), MemoryRecorder::new(), settings(10));
    let result = controller.run(&single_step_spec());

    assert_eq!(result.outcome, Outcome::TimedOut);
    assert_eq!(result.total_turns, 10);

    let turns = &controller.recorder().turns;
    assert!(turns[9].substituted);
    assert_eq!(turns[9].proposed, Some(ActionDescriptor::Tap { x: 50.0, y: 50.0 }));
    assert_ne!(turns[9].action, turns[9].proposed);

    let executed = controller.device().executed();
    let taps = executed
        .iter()
        .filter(|c| matches!(c, DeviceCommand::Tap { .. }))
        .count();
    assert_eq!(taps, 9);
    assert_eq!(executed.last(), Some(&DeviceCommand::Keyevent { code: 4 }));
}

#[test]
fn test_stateful_backend_acknowledges_and_restarts_per_step() {
    let transport = ReplayTransport::new();
    transport
        .push(claude_click("toolu_1", 10, 20))
        .push(claude_click("toolu_2", 30, 40))
        .push(claude_end("toolu_3", "menu open"))
        .push(claude_end("toolu_4", "settings open"));
    let observer = transport.clone();
    let backend = ClaudeBackend::new(endpoint("https://anthropic.test/v1/messages"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), MemoryRecorder::new(), settings(10));
    let result = controller.run(&two_step_spec());

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].turns, 3);
    assert_eq!(result.steps[1].turns, 1);

    let requests = observer.requests();
    assert_eq!(requests.len(), 4);

    // Turn 2 is only requested after turn 1's tool call got its result
    let messages = requests[1].body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
    assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
    assert_eq!(messages[2]["content"][0]["is_error"], false);

    // Step 2 starts a fresh transcript with its own success criteria
    let messages = requests[3].body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    let context = messages[0]["content"][0]["text"].as_str().unwrap();
    assert!(context.contains("Success criteria: Settings visible"));
    assert!(!context.contains("Menu is open"));

    let turns = &controller.recorder().turns;
    assert_eq!(turns.len(), 4);
    assert_eq!((turns[3].turn, turns[3].step, turns[3].step_turn), (4, 2, 1));
}

#[test]
fn test_failed_step_prevents_later_steps() {
    let transport = ReplayTransport::new();
    transport.push(openai_end(false, "menu missing"));
    let observer = transport.clone();
    let backend = OpenAiBackend::new(endpoint("https://openai.test/v1/responses"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), MemoryRecorder::new(), settings(10));
    let result = controller.run(&two_step_spec());

    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.total_turns, 1);
    assert_eq!(observer.requests().len(), 1);
}

#[test]
fn test_transport_failures_are_no_op_turns() {
    let transport = ReplayTransport::new();
    transport
        .push(json!({"unexpected": true}))
        .push(json!({"output": [{"type": "message", "content": [{"type": "output_text", "text": "Thinking..."}]}]}))
        .push(openai_end(true, "fine"));
    let backend = OpenAiBackend::new(endpoint("https://openai.test/v1/responses"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), MemoryRecorder::new(), settings(10));
    let result = controller.run(&single_step_spec());

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.total_turns, 3);
    let turns = &controller.recorder().turns;
    assert!(turns[0].error.is_some());
    assert!(turns[1].raw_response.is_some());
    assert!(turns[..2].iter().all(|t| t.command.is_none()));
}

#[test]
fn test_session_recorder_writes_run_artifacts() {
    let tmp = TempDir::new().unwrap();
    let session = Session::in_dir(tmp.path().join("notes_run"));
    let recorder = SessionRecorder::create(session, json!({"package": PACKAGE})).unwrap();

    let transport = ReplayTransport::new();
    transport.push(openai_click(20, 30)).push(openai_end(true, "done"));
    let backend = OpenAiBackend::new(endpoint("https://openai.test/v1/responses"), 512, Box::new(transport));

    let mut controller = TurnController::new(device(), Box::new(backend), recorder, settings(10));
    let result = controller.run(&single_step_spec());
    assert_eq!(result.outcome, Outcome::Succeeded);

    let session = controller.recorder().session();
    let turns = fs::read_to_string(session.turns_path()).unwrap();
    assert_eq!(turns.lines().count(), 2);
    let first: Value = serde_json::from_str(turns.lines().next().unwrap()).unwrap();
    assert_eq!(first["command"], json!({"cmd": "tap", "x": 20, "y": 30}));

    assert!(session.screenshots_dir().join("turn_001.png").exists());
    assert!(session.responses_dir().join("turn_002.json").exists());
    let summary: Value = serde_json::from_str(&fs::read_to_string(session.summary_path()).unwrap()).unwrap();
    assert_eq!(summary["outcome"], "succeeded");
    assert_eq!(summary["total_turns"], 2);
}

#[test]
fn test_unreachable_device_still_writes_a_failed_summary() {
    let tmp = TempDir::new().unwrap();
    let session = Session::in_dir(tmp.path().join("offline_run"));
    let mut recorder = SessionRecorder::create(session, json!({"package": PACKAGE})).unwrap();

    let error = DeviceError::Unreachable("no devices attached".to_string());
    let result = RunResult::setup_failed(PACKAGE, None, &error);
    recorder.finish(&result).unwrap();

    assert_eq!(result.exit_code(), 1);
    let summary: Value =
        serde_json::from_str(&fs::read_to_string(recorder.session().summary_path()).unwrap()).unwrap();
    assert_eq!(summary["outcome"], "failed");
    assert_eq!(summary["total_turns"], 0);
    assert_eq!(summary["reason"], "setup failed: device unreachable: no devices attached");
    assert!(!recorder.session().turns_path().exists());
}
