//! Stateful backend over the Anthropic Messages API (`computer` tool).
//!
//! The conversation lives in a [`Transcript`]. The API rejects a request
//! while any earlier `tool_use` block lacks a matching `tool_result`, so
//! the loop has to [`acknowledge`](DecisionBackend::acknowledge) every
//! decision before asking for the next one. The following screenshot is
//! attached to the acknowledged computer call's result.

use serde_json::{Value, json};
use tracing::debug;

use super::image::encode_for_canvas;
use super::prompt::{CONTINUE_NOTE, END_TEST_DESCRIPTION, END_TEST_TOOL, SYSTEM_PROMPT};
use super::transport::HttpTransport;
use super::{
    Acknowledgement, BackendError, BackendResult, Decision, DecisionBackend, DecisionRequest, NormalizeError,
    ProviderKind, ProviderSession, coordinate, number,
};
use crate::action::{ActionDescriptor, DEFAULT_SWIPE_MS, Resolution, keycode};
use crate::config::EndpointSettings;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Canvas pixels per scroll "click"
const SCROLL_STEP: f64 = 100.0;
const DEFAULT_SCROLL_AMOUNT: f64 = 3.0;
const COMPUTER_TOOL: &str = "computer";
const SKIPPED_RESULT: &str = "Not executed: only one action is performed per turn.";
const UNKNOWN_TOOL_RESULT: &str = "Unknown tool. Use the computer or end_test tool.";

/// A `tool_use` block still waiting for its `tool_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolUse {
    pub id: String,
    pub name: String,
}

/// Ordered message history for one step of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Step context the transcript was started with
    context: Option<String>,
    messages: Vec<Value>,
    pending: Vec<PendingToolUse>,
    /// Tool call whose result the decision was taken from
    acted_on: Option<String>,
    /// Computer tool result that receives the next screenshot
    screenshot_slot: Option<String>,
}

/// State to roll back to when a request fails.
struct Checkpoint {
    len: usize,
    last: Option<Value>,
    screenshot_slot: Option<String>,
}

impl Transcript {
    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    pub fn pending(&self) -> &[PendingToolUse] {
        &self.pending
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    fn restart(&mut self, context: String) {
        *self = Transcript {
            context: Some(context),
            ..Default::default()
        };
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.messages.len(),
            last: self.messages.last().cloned(),
            screenshot_slot: self.screenshot_slot.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.messages.truncate(checkpoint.len);
        if let (Some(last), Some(slot)) = (checkpoint.last, self.messages.last_mut()) {
            *slot = last;
        }
        self.screenshot_slot = checkpoint.screenshot_slot;
    }

    /// Add the new observation where the API expects it.
    fn stage_observation(&mut self, context: &str, image: Value) {
        let last_is_user = self
            .messages
            .last()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            == Some("user");

        if self.messages.is_empty() {
            self.messages.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": context}, image],
            }));
        } else if last_is_user {
            let slot = self.screenshot_slot.take();
            let Some(content) = self
                .messages
                .last_mut()
                .and_then(|m| m.get_mut("content"))
                .and_then(Value::as_array_mut)
            else {
                return;
            };
            let result = slot.and_then(|id| {
                content
                    .iter_mut()
                    .find(|block| block.get("tool_use_id").and_then(Value::as_str) == Some(id.as_str()))
            });
            match result.and_then(|block| block.get_mut("content")).and_then(Value::as_array_mut) {
                Some(result_content) => result_content.push(image),
                None => content.push(image),
            }
        } else {
            self.messages.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": CONTINUE_NOTE}, image],
            }));
        }
    }

    /// Answer every pending tool call. The one acted on gets `ack`.
    fn acknowledge(&mut self, ack: &Acknowledgement) {
        let acted_on = self.acted_on.take();
        let mut results = Vec::with_capacity(self.pending.len());
        for tool_use in &self.pending {
            if acted_on.as_deref() == Some(tool_use.id.as_str()) {
                if tool_use.name == COMPUTER_TOOL {
                    self.screenshot_slot = Some(tool_use.id.clone());
                }
                results.push(tool_result(&tool_use.id, !ack.success, &ack.message));
            } else {
                results.push(tool_result(&tool_use.id, false, SKIPPED_RESULT));
            }
        }
        self.push_results(results);
    }

    /// Answer every pending tool call with the same error.
    fn reject_pending(&mut self, message: &str) {
        self.acted_on = None;
        let results = self
            .pending
            .iter()
            .map(|tool_use| tool_result(&tool_use.id, true, message))
            .collect();
        self.push_results(results);
    }

    fn push_results(&mut self, results: Vec<Value>) {
        self.pending.clear();
        if !results.is_empty() {
            self.messages.push(json!({"role": "user", "content": results}));
        }
    }
}

fn tool_result(tool_use_id: &str, is_error: bool, text: &str) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "is_error": is_error,
        "content": [{"type": "text", "text": text}],
    })
}

pub struct ClaudeBackend {
    settings: EndpointSettings,
    max_tokens: u32,
    transport: Box<dyn HttpTransport>,
}

impl ClaudeBackend {
    pub fn new(settings: EndpointSettings, max_tokens: u32, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            settings,
            max_tokens,
            transport,
        }
    }

    /// Computer tool type and beta flag for the configured model.
    pub fn tool_version(&self) -> (&'static str, &'static str) {
        let model = self.settings.model.as_str();
        if model.contains("opus-4-5") || model.contains("opus-4-6") {
            ("computer_20251124", "computer-use-2025-11-24")
        } else {
            ("computer_20250124", "computer-use-2025-01-24")
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let (_, beta) = self.tool_version();
        let mut headers = vec![
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("anthropic-beta".to_string(), beta.to_string()),
        ];
        if let Some(key) = &self.settings.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        headers
    }

    fn build_request(&self, transcript: &Transcript, canvas: Resolution) -> Value {
        let (tool_type, _) = self.tool_version();
        json!({
            "model": self.settings.model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": transcript.messages,
            "tools": [
                {
                    "type": tool_type,
                    "name": COMPUTER_TOOL,
                    "display_width_px": canvas.width,
                    "display_height_px": canvas.height,
                },
                {
                    "name": END_TEST_TOOL,
                    "description": END_TEST_DESCRIPTION,
                    "input_schema": {
                        "type": "object",
                        "properties": {
                            "success": {"type": "boolean", "description": "Whether the step succeeded."},
                            "reason": {"type": "string", "description": "Short justification."},
                        },
                        "required": ["success"],
                    },
                },
            ],
        })
    }
}

impl DecisionBackend for ClaudeBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn open_session(&self) -> ProviderSession {
        ProviderSession::Stateful(Transcript::default())
    }

    fn decide(&self, request: &DecisionRequest<'_>, session: &mut ProviderSession) -> BackendResult<Decision> {
        let ProviderSession::Stateful(transcript) = session else {
            return Err(BackendError::SessionMismatch(ProviderKind::Claude));
        };

        let context = request.context.render();
        if transcript.context() != Some(context.as_str()) {
            if transcript.context().is_some() {
                debug!("Step context changed, restarting transcript");
            }
            transcript.restart(context.clone());
        }
        if !transcript.pending.is_empty() {
            return Err(BackendError::Unacknowledged(transcript.pending.len()));
        }

        let image = json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": "image/png",
                "data": encode_for_canvas(request.screenshot, request.canvas)?,
            },
        });
        let checkpoint = transcript.checkpoint();
        transcript.stage_observation(&context, image);

        let body = self.build_request(transcript, request.canvas);
        let response = match self.transport.post_json(&self.settings.endpoint, &self.headers(), &body) {
            Ok(response) => response,
            Err(e) => {
                transcript.restore(checkpoint);
                return Err(e);
            }
        };
        let Some(content) = response.get("content").and_then(Value::as_array).cloned() else {
            transcript.restore(checkpoint);
            return Err(BackendError::InvalidResponse("missing 'content' array".to_string()));
        };

        // Assistant blocks are kept verbatim, thinking signatures included
        transcript.messages.push(json!({"role": "assistant", "content": content}));
        transcript.pending = content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter_map(|block| {
                Some(PendingToolUse {
                    id: block.get("id")?.as_str()?.to_string(),
                    name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                })
            })
            .collect();

        match interpret(&content, request.canvas) {
            Ok((tool_use_id, action, rationale)) => {
                transcript.acted_on = Some(tool_use_id);
                Ok(Decision {
                    action,
                    canvas: request.canvas,
                    rationale,
                    raw: response,
                })
            }
            Err(Interpretation::NoToolCall) => {
                if !transcript.pending.is_empty() {
                    transcript.reject_pending(UNKNOWN_TOOL_RESULT);
                }
                Err(BackendError::NoAction { raw: response })
            }
            Err(Interpretation::Invalid(e)) => {
                // Unusable tool calls are answered now so the transcript stays valid
                let message = match &e {
                    NormalizeError::Unsupported(name) => format!("Unsupported action {}. Use another action.", name),
                    NormalizeError::Malformed(reason) => format!("Malformed action: {}", reason),
                };
                transcript.reject_pending(&message);
                Err(e.into_backend_error(response))
            }
        }
    }

    fn acknowledge(&self, session: &mut ProviderSession, ack: &Acknowledgement) -> BackendResult<()> {
        let ProviderSession::Stateful(transcript) = session else {
            return Err(BackendError::SessionMismatch(ProviderKind::Claude));
        };
        transcript.acknowledge(ack);
        Ok(())
    }
}

#[derive(Debug)]
enum Interpretation {
    NoToolCall,
    Invalid(NormalizeError),
}

/// Pick the action out of the assistant content: `end_test` first, then the
/// first computer call. Returns the tool call id it came from.
fn interpret(
    content: &[Value],
    canvas: Resolution,
) -> Result<(String, ActionDescriptor, Option<String>), Interpretation> {
    let texts: Vec<&str> = content
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block.get("text").and_then(Value::as_str),
            Some("thinking") => block.get("thinking").and_then(Value::as_str),
            _ => None,
        })
        .filter(|text| !text.is_empty())
        .collect();
    let rationale = (!texts.is_empty()).then(|| texts.join("\n"));

    let tool_uses: Vec<&Value> = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .collect();
    let named = |name: &str| {
        tool_uses
            .iter()
            .find(|block| block.get("name").and_then(Value::as_str) == Some(name))
            .copied()
    };
    let id_of = |block: &Value| block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();

    if let Some(block) = named(END_TEST_TOOL) {
        let input = block.get("input").cloned().unwrap_or(Value::Null);
        let success = input.get("success").and_then(Value::as_bool).unwrap_or(false);
        let reason = input
            .get("reason")
            .and_then(Value::as_str)
            .filter(|r| !r.trim().is_empty())
            .map(str::to_string)
            .or_else(|| rationale.clone())
            .unwrap_or_else(|| "model invoked end_test".to_string());
        return Ok((id_of(block), ActionDescriptor::EndTest { success, reason }, rationale));
    }

    let block = named(COMPUTER_TOOL).ok_or(Interpretation::NoToolCall)?;
    let input = block.get("input").cloned().unwrap_or(Value::Null);
    let action = normalize_action(&input, canvas).map_err(Interpretation::Invalid)?;
    Ok((id_of(block), action, rationale))
}

fn coordinate_of(input: &Value, key: &str, action: &str) -> Result<(f64, f64), NormalizeError> {
    coordinate(input.get(key)).ok_or_else(|| NormalizeError::Malformed(format!("{} without {}", action, key)))
}

/// Map a native `computer` tool input onto the shared vocabulary.
pub(crate) fn normalize_action(input: &Value, canvas: Resolution) -> Result<ActionDescriptor, NormalizeError> {
    let action = input.get("action").and_then(Value::as_str).unwrap_or_default();
    match action {
        "left_click" | "right_click" | "middle_click" | "double_click" | "triple_click" => {
            let (x, y) = coordinate_of(input, "coordinate", action)?;
            Ok(ActionDescriptor::Tap { x, y })
        }
        "type" => {
            let text = input
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| NormalizeError::Malformed("type without text".to_string()))?;
            Ok(ActionDescriptor::TypeText { text: text.to_string() })
        }
        "key" => {
            let combo = input.get("text").and_then(Value::as_str).unwrap_or_default();
            combo
                .split('+')
                .rev()
                .find_map(keycode::from_name)
                .map(|code| ActionDescriptor::KeyEvent { code })
                .ok_or_else(|| NormalizeError::Unsupported(format!("key '{}'", combo)))
        }
        "scroll" => {
            let (x, y) = coordinate_of(input, "coordinate", action)?;
            let amount = number(input.get("scroll_amount")).unwrap_or(DEFAULT_SCROLL_AMOUNT) * SCROLL_STEP;
            let (dx, dy) = match input.get("scroll_direction").and_then(Value::as_str).unwrap_or("down") {
                "up" => (0.0, -amount),
                "left" => (-amount, 0.0),
                "right" => (amount, 0.0),
                _ => (0.0, amount),
            };
            Ok(ActionDescriptor::Swipe {
                x1: x,
                y1: y,
                x2: (x + dx).clamp(0.0, canvas.width as f64),
                y2: (y + dy).clamp(0.0, canvas.height as f64),
                duration_ms: DEFAULT_SWIPE_MS,
            })
        }
        "left_click_drag" => {
            let (x1, y1) = coordinate_of(input, "start_coordinate", action)?;
            let (x2, y2) = coordinate_of(input, "coordinate", action)?;
            Ok(ActionDescriptor::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms: DEFAULT_SWIPE_MS,
            })
        }
        "wait" => Ok(ActionDescriptor::Wait {
            seconds: number(input.get("duration")).unwrap_or(1.0),
        }),
        "screenshot" | "mouse_move" | "cursor_position" => Ok(ActionDescriptor::Wait { seconds: 0.0 }),
        other => Err(NormalizeError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::prompt::TaskContext;
    use crate::backend::transport::ReplayTransport;
    use crate::device::{MockFramebuffer, Screenshot};
    use pretty_assertions::assert_eq;

    const CANVAS: Resolution = Resolution::new(1280, 800);

    fn settings(model: &str) -> EndpointSettings {
        EndpointSettings {
            endpoint: "https://example.test/v1/messages".to_string(),
            model: model.to_string(),
            api_key: Some("sk-ant-test".to_string()),
        }
    }

    fn tool_use(id: &str, input: Value) -> Value {
        json!({"content": [
            {"type": "text", "text": "Tapping the button."},
            {"type": "tool_use", "id": id, "name": "computer", "input": input},
        ]})
    }

    fn screenshot() -> Screenshot {
        Screenshot::from_png(MockFramebuffer::new(64, 40).to_png().unwrap()).unwrap()
    }

    fn user_blocks(message: &Value) -> Vec<String> {
        message["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_normalize_click_variants() {
        for action in ["left_click", "double_click", "triple_click", "right_click"] {
            let input = json!({"action": action, "coordinate": [100, 200]});
            assert_eq!(
                normalize_action(&input, CANVAS).unwrap(),
                ActionDescriptor::Tap { x: 100.0, y: 200.0 }
            );
        }
    }

    #[test]
    fn test_normalize_scroll_amount() {
        let input = json!({"action": "scroll", "coordinate": [600, 400], "scroll_direction": "up", "scroll_amount": 2});
        assert_eq!(
            normalize_action(&input, CANVAS).unwrap(),
            ActionDescriptor::Swipe {
                x1: 600.0,
                y1: 400.0,
                x2: 600.0,
                y2: 200.0,
                duration_ms: DEFAULT_SWIPE_MS
            }
        );
    }

    #[test]
    fn test_normalize_key_combo_uses_last_mappable() {
        let input = json!({"action": "key", "text": "ctrl+Return"});
        assert_eq!(
            normalize_action(&input, CANVAS).unwrap(),
            ActionDescriptor::KeyEvent { code: keycode::ENTER }
        );
        let input = json!({"action": "key", "text": "super"});
        assert!(matches!(normalize_action(&input, CANVAS), Err(NormalizeError::Unsupported(_))));
    }

    #[test]
    fn test_normalize_drag_and_wait() {
        let input = json!({"action": "left_click_drag", "start_coordinate": [1, 2], "coordinate": [3, 4]});
        assert_eq!(
            normalize_action(&input, CANVAS).unwrap(),
            ActionDescriptor::Swipe {
                x1: 1.0,
                y1: 2.0,
                x2: 3.0,
                y2: 4.0,
                duration_ms: DEFAULT_SWIPE_MS
            }
        );
        let input = json!({"action": "wait", "duration": 2});
        assert_eq!(normalize_action(&input, CANVAS).unwrap(), ActionDescriptor::Wait { seconds: 2.0 });
    }

    #[test]
    fn test_tool_version_by_model() {
        let transport = Box::new(ReplayTransport::new());
        let backend = ClaudeBackend::new(settings("claude-opus-4-5"), 1024, transport);
        assert_eq!(backend.tool_version().0, "computer_20251124");
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(ReplayTransport::new()));
        assert_eq!(backend.tool_version().1, "computer-use-2025-01-24");
    }

    #[test]
    fn test_decide_requires_acknowledgement() {
        let transport = ReplayTransport::new();
        transport
            .push(tool_use("toolu_1", json!({"action": "left_click", "coordinate": [10, 20]})))
            .push(tool_use("toolu_2", json!({"action": "left_click", "coordinate": [30, 40]})));
        let observer = transport.clone();
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));

        let shot = screenshot();
        let context = TaskContext::new("Open the menu");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &context,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let mut session = backend.open_session();

        let first = backend.decide(&request, &mut session).unwrap();
        assert_eq!(first.action, ActionDescriptor::Tap { x: 10.0, y: 20.0 });
        assert_eq!(first.rationale.as_deref(), Some("Tapping the button."));
        assert_eq!(session.pending_acknowledgements(), 1);

        // A second decision without a result is refused and sends nothing
        assert!(matches!(
            backend.decide(&request, &mut session),
            Err(BackendError::Unacknowledged(1))
        ));
        assert_eq!(observer.requests().len(), 1);

        backend.acknowledge(&mut session, &Acknowledgement::ok("tap executed")).unwrap();
        assert_eq!(session.pending_acknowledgements(), 0);
        let second = backend.decide(&request, &mut session).unwrap();
        assert_eq!(second.action, ActionDescriptor::Tap { x: 30.0, y: 40.0 });

        let sent = observer.requests();
        assert_eq!(sent.len(), 2);
        let messages = sent[1].body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(user_blocks(&messages[0]), vec!["text", "image"]);
        assert_eq!(messages[1]["role"], "assistant");
        let result = &messages[2]["content"][0];
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "toolu_1");
        assert_eq!(result["content"][0]["text"], "tap executed");
        assert_eq!(result["content"][1]["type"], "image");
        assert!(sent[1].headers.contains(&("x-api-key".to_string(), "sk-ant-test".to_string())));
    }

    #[test]
    fn test_context_change_restarts_transcript() {
        let transport = ReplayTransport::new();
        transport
            .push(json!({"content": [{"type": "tool_use", "id": "t1", "name": "end_test", "input": {"success": true}}]}))
            .push(tool_use("t2", json!({"action": "screenshot"})));
        let observer = transport.clone();
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));
        let shot = screenshot();
        let mut session = backend.open_session();

        let step1 = TaskContext::new("Step one");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &step1,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let decision = backend.decide(&request, &mut session).unwrap();
        assert!(matches!(decision.action, ActionDescriptor::EndTest { success: true, .. }));

        let step2 = TaskContext::new("Step two");
        let request = DecisionRequest {
            context: &step2,
            ..request
        };
        backend.decide(&request, &mut session).unwrap();
        let messages = observer.requests()[1].body["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0]["content"][0]["text"].as_str().unwrap().starts_with("Goal: Step two"));
    }

    #[test]
    fn test_failed_request_rolls_back() {
        let transport = ReplayTransport::new();
        transport
            .push_error(BackendError::Transport("boom".to_string()))
            .push(tool_use("t1", json!({"action": "left_click", "coordinate": [1, 1]})));
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));
        let shot = screenshot();
        let context = TaskContext::new("Goal");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &context,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let mut session = backend.open_session();
        assert!(backend.decide(&request, &mut session).is_err());
        assert_eq!(session.transcript().unwrap().messages().len(), 0);
        backend.decide(&request, &mut session).unwrap();
        assert_eq!(session.transcript().unwrap().messages().len(), 2);
    }

    #[test]
    fn test_text_only_reply_is_no_action_and_continues() {
        let transport = ReplayTransport::new();
        transport
            .push(json!({"content": [{"type": "text", "text": "Thinking about it."}]}))
            .push(tool_use("t1", json!({"action": "left_click", "coordinate": [2, 2]})));
        let observer = transport.clone();
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));
        let shot = screenshot();
        let context = TaskContext::new("Goal");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &context,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let mut session = backend.open_session();
        assert!(matches!(
            backend.decide(&request, &mut session),
            Err(BackendError::NoAction { .. })
        ));
        backend.decide(&request, &mut session).unwrap();
        let messages = observer.requests()[1].body["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"][0]["text"], CONTINUE_NOTE);
    }

    #[test]
    fn test_unsupported_tool_call_is_answered() {
        let transport = ReplayTransport::new();
        transport.push(tool_use("t1", json!({"action": "zoom"})));
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));
        let shot = screenshot();
        let context = TaskContext::new("Goal");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &context,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let mut session = backend.open_session();
        assert!(matches!(
            backend.decide(&request, &mut session),
            Err(BackendError::UnsupportedAction { .. })
        ));
        assert_eq!(session.pending_acknowledgements(), 0);
        let last = session.transcript().unwrap().messages().last().unwrap().clone();
        assert_eq!(last["content"][0]["is_error"], true);
    }

    #[test]
    fn test_unknown_tool_is_answered_and_next_turn_proceeds() {
        let transport = ReplayTransport::new();
        transport
            .push(json!({"content": [{"type": "tool_use", "id": "t1", "name": "str_replace_editor", "input": {}}]}))
            .push(json!({"content": [{"type": "tool_use", "id": "t2", "name": "end_test", "input": {"success": true}}]}));
        let observer = transport.clone();
        let backend = ClaudeBackend::new(settings("claude-sonnet-4-5"), 1024, Box::new(transport));
        let shot = screenshot();
        let context = TaskContext::new("Goal");
        let request = DecisionRequest {
            screenshot: &shot,
            context: &context,
            canvas: Resolution::new(64, 40),
            recent_turns: &[],
        };
        let mut session = backend.open_session();
        assert!(matches!(
            backend.decide(&request, &mut session),
            Err(BackendError::NoAction { .. })
        ));
        assert_eq!(session.pending_acknowledgements(), 0);

        let decision = backend.decide(&request, &mut session).unwrap();
        assert!(matches!(decision.action, ActionDescriptor::EndTest { success: true, .. }));
        assert_eq!(observer.requests().len(), 2);
        let messages = observer.requests()[1].body["messages"].as_array().unwrap().clone();
        let result = &messages[2]["content"][0];
        assert_eq!(result["tool_use_id"], "t1");
        assert_eq!(result["is_error"], true);
        assert_eq!(result["content"][0]["text"], UNKNOWN_TOOL_RESULT);
    }
}
