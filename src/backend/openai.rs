//! Stateless backend over the OpenAI Responses API (`computer_use_preview`).
//!
//! Every request is self-contained: system prompt, step context, a summary
//! of recent turns, and the current screenshot.

use serde_json::{Value, json};
use tracing::debug;

use super::image::{data_url, encode_for_canvas};
use super::prompt::{END_TEST_DESCRIPTION, END_TEST_TOOL, SYSTEM_PROMPT, recent_turns_block};
use super::transport::HttpTransport;
use super::{
    Acknowledgement, BackendError, BackendResult, Decision, DecisionBackend, DecisionRequest, ProviderKind,
    NormalizeError, ProviderSession, number,
};
use crate::action::{ActionDescriptor, DEFAULT_SWIPE_MS, Resolution, keycode};
use crate::config::EndpointSettings;

/// Seconds waited when the model asks for a plain `wait`
const WAIT_SECONDS: f64 = 1.0;

pub struct OpenAiBackend {
    settings: EndpointSettings,
    max_tokens: u32,
    transport: Box<dyn HttpTransport>,
}

impl OpenAiBackend {
    pub fn new(settings: EndpointSettings, max_tokens: u32, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            settings,
            max_tokens,
            transport,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        match &self.settings.api_key {
            Some(key) => vec![("Authorization".to_string(), format!("Bearer {}", key))],
            None => Vec::new(),
        }
    }

    /// Build the Responses API request body.
    pub fn build_request(&self, request: &DecisionRequest<'_>) -> BackendResult<Value> {
        let screenshot = encode_for_canvas(request.screenshot, request.canvas)?;

        let mut content = vec![json!({"type": "input_text", "text": request.context.render()})];
        if let Some(recent) = recent_turns_block(request.recent_turns) {
            content.push(json!({"type": "input_text", "text": recent}));
            content.push(json!({"type": "input_text", "text": "State updated after actions. Continue toward the goal."}));
        }
        content.push(json!({"type": "input_image", "image_url": data_url(&screenshot)}));

        Ok(json!({
            "model": self.settings.model,
            "input": [
                {"role": "system", "content": [{"type": "input_text", "text": SYSTEM_PROMPT}]},
                {"role": "user", "content": content},
            ],
            "tools": [
                {
                    "type": "computer_use_preview",
                    "display_width": request.canvas.width,
                    "display_height": request.canvas.height,
                    "environment": "browser",
                },
                {
                    "type": "function",
                    "name": END_TEST_TOOL,
                    "description": END_TEST_DESCRIPTION,
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "success": {"type": "boolean", "description": "Whether the step succeeded."},
                            "reason": {"type": "string", "description": "Short justification."},
                        },
                        "required": ["success", "reason"],
                        "additionalProperties": false,
                    },
                    "strict": true,
                },
            ],
            "reasoning": {"summary": "concise"},
            "truncation": "auto",
            "max_output_tokens": self.max_tokens,
        }))
    }
}

impl DecisionBackend for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn open_session(&self) -> ProviderSession {
        ProviderSession::Stateless
    }

    fn decide(&self, request: &DecisionRequest<'_>, session: &mut ProviderSession) -> BackendResult<Decision> {
        if session.is_stateful() {
            return Err(BackendError::SessionMismatch(ProviderKind::OpenAi));
        }
        let body = self.build_request(request)?;
        let response = self.transport.post_json(&self.settings.endpoint, &self.headers(), &body)?;
        parse_response(response, request.canvas)
    }

    fn acknowledge(&self, _session: &mut ProviderSession, _ack: &Acknowledgement) -> BackendResult<()> {
        // Context is resent in full with every request
        Ok(())
    }
}

/// Interpret a Responses API body. An `end_test` call wins over computer calls.
pub fn parse_response(response: Value, canvas: Resolution) -> BackendResult<Decision> {
    let outputs = response
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidResponse("missing 'output' array".to_string()))?;

    let mut reasoning = Vec::new();
    let mut end_test = None;
    let mut computer_action = None;
    let mut computer_calls = 0usize;

    for item in outputs {
        match item.get("type").and_then(Value::as_str) {
            Some("reasoning") => {
                let summaries = item.get("summary").and_then(Value::as_array).into_iter().flatten();
                reasoning.extend(
                    summaries
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .filter(|text| !text.is_empty())
                        .map(str::to_string),
                );
            }
            Some("message") => {
                let parts = item.get("content").and_then(Value::as_array).into_iter().flatten();
                reasoning.extend(
                    parts
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .filter(|text| !text.is_empty())
                        .map(str::to_string),
                );
            }
            Some("computer_call") => {
                computer_calls += 1;
                if computer_action.is_none() {
                    computer_action = item.get("action").cloned();
                }
            }
            Some("function_call") | Some("tool_call") => {
                if end_test.is_none() {
                    end_test = parse_end_test(item);
                }
            }
            _ => {}
        }
    }
    if computer_calls > 1 {
        debug!(dropped = computer_calls - 1, "Only the first computer call is executed");
    }

    let rationale = (!reasoning.is_empty()).then(|| reasoning.join("\n"));

    let action = if let Some((success, reason)) = end_test {
        let reason = reason
            .or_else(|| rationale.clone())
            .unwrap_or_else(|| "model invoked end_test".to_string());
        ActionDescriptor::EndTest { success, reason }
    } else {
        let Some(first) = computer_action else {
            return Err(BackendError::NoAction { raw: response });
        };
        match normalize_action(&first, canvas) {
            Ok(action) => action,
            Err(e) => return Err(e.into_backend_error(response)),
        }
    };

    Ok(Decision {
        action,
        canvas,
        rationale,
        raw: response,
    })
}

/// `(success, reason)` of an `end_test` function call, if this is one.
fn parse_end_test(item: &Value) -> Option<(bool, Option<String>)> {
    let name = item
        .get("name")
        .or_else(|| item.pointer("/function/name"))
        .and_then(Value::as_str)?;
    if !name.trim().eq_ignore_ascii_case(END_TEST_TOOL) {
        return None;
    }
    let args = match item.get("arguments") {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or(Value::Null),
        Some(value @ Value::Object(_)) => value.clone(),
        _ => Value::Null,
    };
    let success = args.get("success").and_then(Value::as_bool).unwrap_or(false);
    let reason = args
        .get("reason")
        .and_then(Value::as_str)
        .filter(|r| !r.trim().is_empty())
        .map(str::to_string);
    Some((success, reason))
}

fn point(action: &Value, kind: &str) -> Result<(f64, f64), NormalizeError> {
    match (number(action.get("x")), number(action.get("y"))) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(NormalizeError::Malformed(format!("{} without coordinates", kind))),
    }
}

/// Map a native `computer_call` action onto the shared vocabulary.
pub(crate) fn normalize_action(action: &Value, canvas: Resolution) -> Result<ActionDescriptor, NormalizeError> {
    let kind = action.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "click" | "double_click" => {
            let (x, y) = point(action, kind)?;
            Ok(ActionDescriptor::Tap { x, y })
        }
        "scroll" => {
            let (x, y) = point(action, kind)?;
            let dx = number(action.get("scroll_x")).unwrap_or(0.0);
            let dy = number(action.get("scroll_y")).unwrap_or(0.0);
            Ok(ActionDescriptor::Swipe {
                x1: x,
                y1: y,
                x2: (x + dx).clamp(0.0, canvas.width as f64),
                y2: (y + dy).clamp(0.0, canvas.height as f64),
                duration_ms: DEFAULT_SWIPE_MS,
            })
        }
        "drag" => {
            let path = action.get("path").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
            let (Some(start), Some(end)) = (path.first(), path.last()) else {
                return Err(NormalizeError::Malformed("drag without a path".to_string()));
            };
            if path.len() < 2 {
                return Err(NormalizeError::Malformed("drag path needs two points".to_string()));
            }
            let (x1, y1) = point(start, kind)?;
            let (x2, y2) = point(end, kind)?;
            Ok(ActionDescriptor::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms: DEFAULT_SWIPE_MS,
            })
        }
        "type" => {
            let text = action
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| NormalizeError::Malformed("type without text".to_string()))?;
            Ok(ActionDescriptor::TypeText { text: text.to_string() })
        }
        "keypress" => {
            let keys: Vec<&str> = match action.get("keys") {
                Some(Value::Array(keys)) => keys.iter().filter_map(Value::as_str).collect(),
                Some(Value::String(key)) => vec![key.as_str()],
                _ => Vec::new(),
            };
            keys.iter()
                .find_map(|key| keycode::from_name(key))
                .map(|code| ActionDescriptor::KeyEvent { code })
                .ok_or_else(|| NormalizeError::Unsupported(format!("keypress {:?}", keys)))
        }
        "wait" => Ok(ActionDescriptor::Wait { seconds: WAIT_SECONDS }),
        "screenshot" | "move" => Ok(ActionDescriptor::Wait { seconds: 0.0 }),
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

    const CANVAS: Resolution = Resolution::new(1000, 2000);

    fn computer_call(action: Value) -> Value {
        json!({"output": [{"type": "computer_call", "call_id": "c1", "action": action}]})
    }

    fn settings() -> EndpointSettings {
        EndpointSettings {
            endpoint: "https://example.test/v1/responses".to_string(),
            model: "computer-use-preview".to_string(),
            api_key: Some("sk-test".to_string()),
        }
    }

    #[test]
    fn test_click_and_double_click_are_taps() {
        for kind in ["click", "double_click"] {
            let decision = parse_response(computer_call(json!({"type": kind, "x": 10, "y": 20})), CANVAS).unwrap();
            assert_eq!(decision.action, ActionDescriptor::Tap { x: 10.0, y: 20.0 });
            assert_eq!(decision.canvas, CANVAS);
        }
    }

    #[test]
    fn test_scroll_is_clamped_swipe() {
        let action = json!({"type": "scroll", "x": 500, "y": 1900, "scroll_x": 0, "scroll_y": 400});
        let decision = parse_response(computer_call(action), CANVAS).unwrap();
        assert_eq!(
            decision.action,
            ActionDescriptor::Swipe {
                x1: 500.0,
                y1: 1900.0,
                x2: 500.0,
                y2: 2000.0,
                duration_ms: DEFAULT_SWIPE_MS
            }
        );
    }

    #[test]
    fn test_drag_uses_path_ends() {
        let action = json!({"type": "drag", "path": [{"x": 1, "y": 2}, {"x": 5, "y": 5}, {"x": 9, "y": 8}]});
        let decision = parse_response(computer_call(action), CANVAS).unwrap();
        assert_eq!(
            decision.action,
            ActionDescriptor::Swipe {
                x1: 1.0,
                y1: 2.0,
                x2: 9.0,
                y2: 8.0,
                duration_ms: DEFAULT_SWIPE_MS
            }
        );
    }

    #[test]
    fn test_keypress_first_mappable_key() {
        let action = json!({"type": "keypress", "keys": ["CTRL", "ENTER"]});
        let decision = parse_response(computer_call(action), CANVAS).unwrap();
        assert_eq!(decision.action, ActionDescriptor::KeyEvent { code: keycode::ENTER });
    }

    #[test]
    fn test_observe_only_actions_become_zero_wait() {
        for kind in ["screenshot", "move"] {
            let decision = parse_response(computer_call(json!({"type": kind, "x": 1, "y": 1})), CANVAS).unwrap();
            assert_eq!(decision.action, ActionDescriptor::Wait { seconds: 0.0 });
        }
    }

    #[test]
    fn test_end_test_wins_and_keeps_reasoning() {
        let response = json!({"output": [
            {"type": "reasoning", "summary": [{"type": "summary_text", "text": "Home screen is visible."}]},
            {"type": "computer_call", "action": {"type": "click", "x": 1, "y": 1}},
            {"type": "function_call", "name": "end_test", "arguments": "{\"success\": true, \"reason\": \"done\"}"},
        ]});
        let decision = parse_response(response, CANVAS).unwrap();
        assert_eq!(
            decision.action,
            ActionDescriptor::EndTest {
                success: true,
                reason: "done".to_string()
            }
        );
        assert_eq!(decision.rationale.as_deref(), Some("Home screen is visible."));
    }

    #[test]
    fn test_end_test_without_reason_falls_back_to_rationale() {
        let response = json!({"output": [
            {"type": "message", "content": [{"type": "output_text", "text": "Cannot log in."}]},
            {"type": "function_call", "name": "end_test", "arguments": {"success": false}},
        ]});
        let decision = parse_response(response, CANVAS).unwrap();
        assert_eq!(
            decision.action,
            ActionDescriptor::EndTest {
                success: false,
                reason: "Cannot log in.".to_string()
            }
        );
    }

    #[test]
    fn test_decision_errors() {
        assert!(matches!(parse_response(json!({}), CANVAS), Err(BackendError::InvalidResponse(_))));
        assert!(matches!(parse_response(json!({"output": []}), CANVAS), Err(BackendError::NoAction { .. })));
        assert!(matches!(
            parse_response(computer_call(json!({"type": "triple_jump"})), CANVAS),
            Err(BackendError::UnsupportedAction { .. })
        ));
        assert!(matches!(
            parse_response(computer_call(json!({"type": "click"})), CANVAS),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_is_self_contained() {
        let transport = ReplayTransport::new();
        transport.push(computer_call(json!({"type": "click", "x": 5, "y": 6})));
        let observer = transport.clone();
        let backend = OpenAiBackend::new(settings(), 512, Box::new(transport));

        let screenshot = Screenshot::from_png(MockFramebuffer::new(100, 200).to_png().unwrap()).unwrap();
        let context = TaskContext::new("Open settings");
        let recent = vec!["turn 1: tap(5, 6) -> ok".to_string()];
        let request = DecisionRequest {
            screenshot: &screenshot,
            context: &context,
            canvas: Resolution::new(100, 200),
            recent_turns: &recent,
        };
        let mut session = backend.open_session();
        let decision = backend.decide(&request, &mut session).unwrap();
        assert_eq!(decision.action, ActionDescriptor::Tap { x: 5.0, y: 6.0 });

        let sent = observer.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers, vec![("Authorization".to_string(), "Bearer sk-test".to_string())]);
        let body = &sent[0].body;
        assert_eq!(body["tools"][0]["display_width"], 100);
        assert_eq!(body["tools"][1]["name"], "end_test");
        let user = body["input"][1]["content"].as_array().unwrap();
        assert!(user[0]["text"].as_str().unwrap().starts_with("Goal: Open settings"));
        assert!(user[1]["text"].as_str().unwrap().contains("turn 1: tap(5, 6)"));
        assert!(user.last().unwrap()["image_url"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_rejects_stateful_session() {
        let backend = OpenAiBackend::new(settings(), 512, Box::new(ReplayTransport::new()));
        let screenshot = Screenshot::from_png(MockFramebuffer::new(10, 10).to_png().unwrap()).unwrap();
        let context = TaskContext::new("x");
        let request = DecisionRequest {
            screenshot: &screenshot,
            context: &context,
            canvas: Resolution::new(10, 10),
            recent_turns: &[],
        };
        let mut session = ProviderSession::Stateful(Default::default());
        assert!(matches!(
            backend.decide(&request, &mut session),
            Err(BackendError::SessionMismatch(ProviderKind::OpenAi))
        ));
    }
}
