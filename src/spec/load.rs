use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::action::{DEFAULT_SWIPE_MS, DeviceCommand, keycode};
use crate::spec::types::{InstallConfig, SpecError, SpecResult, StepSpec, TestSpec};

/// Placeholder replaced with a run-unique value in every string field
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Load a test spec from disk, substituting `{timestamp}` with the current
/// unix time in seconds.
pub fn load_spec(path: &Path) -> SpecResult<TestSpec> {
    let text = fs::read_to_string(path).map_err(|source| SpecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let timestamp = chrono::Utc::now().timestamp().to_string();
    debug!(path = %path.display(), %timestamp, "loading test spec");
    parse_spec(&text, &timestamp)
}

/// Parse a test spec document with an explicit `{timestamp}` value.
pub fn parse_spec(text: &str, timestamp: &str) -> SpecResult<TestSpec> {
    let mut doc: Value = serde_json::from_str(text)?;
    substitute_placeholders(&mut doc, timestamp);

    let obj = doc.as_object().ok_or_else(|| SpecError::InvalidField {
        field: "<root>".to_string(),
        reason: "expected a JSON object".to_string(),
    })?;

    let package = string_field(obj, "package")?.ok_or_else(|| SpecError::MissingField("package".to_string()))?;
    if package.is_empty() {
        return Err(SpecError::MissingField("package".to_string()));
    }
    let activity = string_field(obj, "activity")?.filter(|s| !s.is_empty());
    let apk = string_field(obj, "apk")?.filter(|s| !s.is_empty()).map(PathBuf::from);

    let goal = string_field(obj, "goal")?.unwrap_or_default();
    let suggestions = string_field(obj, "suggestions")?.unwrap_or_default();
    let negative_prompt = string_field(obj, "negative_prompt")?.unwrap_or_default();
    let success_criteria = string_field(obj, "success_criteria")?.unwrap_or_default();

    let hints = match obj.get("hints") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_text).collect(),
        Some(other) => vec![value_to_text(other)],
    };

    let install = parse_install_config(obj);

    let pre_steps = match obj.get("pre_steps") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| parse_command(item, &package))
            .collect::<SpecResult<Vec<_>>>()?,
        Some(_) => {
            return Err(SpecError::InvalidField {
                field: "pre_steps".to_string(),
                reason: "expected an array".to_string(),
            });
        }
    };

    let mut steps = Vec::new();
    let mut script = Vec::new();
    match obj.get("steps") {
        Some(Value::Array(items)) if !items.is_empty() => {
            if items.iter().all(is_goal_step) {
                steps = items
                    .iter()
                    .map(|item| serde_json::from_value::<StepSpec>(item.clone()).map(trim_step))
                    .collect::<Result<Vec<_>, _>>()?;
            } else {
                script = items
                    .iter()
                    .map(|item| parse_command(item, &package))
                    .collect::<SpecResult<Vec<_>>>()?;
            }
        }
        None | Some(Value::Null) | Some(Value::Array(_)) => {}
        Some(_) => {
            return Err(SpecError::InvalidField {
                field: "steps".to_string(),
                reason: "expected an array".to_string(),
            });
        }
    }

    if steps.is_empty() && script.is_empty() {
        steps.push(StepSpec {
            goal: goal.clone(),
            suggestions: suggestions.clone(),
            negative_prompt: negative_prompt.clone(),
            success_criteria: success_criteria.clone(),
        });
    }

    Ok(TestSpec {
        apk,
        package,
        activity,
        goal,
        suggestions,
        negative_prompt,
        success_criteria,
        hints,
        steps,
        pre_steps,
        script,
        install,
    })
}

/// Check the spec is runnable by the agent loop.
pub fn validate_for_agent(spec: &TestSpec) -> SpecResult<()> {
    if !spec.install.skip_install && spec.apk.is_none() {
        return Err(SpecError::MissingApk);
    }
    if spec.is_script() {
        return Err(SpecError::InvalidField {
            field: "steps".to_string(),
            reason: "contains device commands; use the script runner".to_string(),
        });
    }
    for (idx, step) in spec.steps.iter().enumerate() {
        if step.goal.trim().is_empty() {
            return Err(SpecError::EmptyGoal(idx + 1));
        }
    }
    Ok(())
}

/// Parse `skip_install` / `skip_stall` / `uninstall_after`.
///
/// `skip_stall` behaves like `skip_install` and also keeps the app installed.
pub fn parse_install_config(obj: &Map<String, Value>) -> InstallConfig {
    let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
    let skip_stall = flag("skip_stall");
    let skip_install = flag("skip_install") || skip_stall;
    let uninstall_after = if skip_stall {
        false
    } else {
        obj.get("uninstall_after").and_then(Value::as_bool).unwrap_or(!skip_install)
    };
    InstallConfig {
        skip_install,
        uninstall_after,
    }
}

/// Parse one deterministic command (`{"cmd": "tap", "x": .., "y": ..}`).
///
/// Coordinates are device pixels. Numeric fields accept numbers or numeric
/// strings; `launch`/`stop` default to the spec's package.
pub fn parse_command(value: &Value, package: &str) -> SpecResult<DeviceCommand> {
    let obj = value.as_object().ok_or_else(|| SpecError::InvalidField {
        field: "cmd".to_string(),
        reason: format!("expected an object, got {}", value),
    })?;
    let cmd = obj
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| SpecError::MissingField("cmd".to_string()))?;

    let command = match cmd {
        "wait" => DeviceCommand::Wait {
            seconds: number_field(obj, "seconds")?.unwrap_or(1.0),
        },
        "tap" => DeviceCommand::Tap {
            x: pixel_field(obj, "x")?,
            y: pixel_field(obj, "y")?,
        },
        "swipe" => DeviceCommand::Swipe {
            x1: pixel_field(obj, "x1")?,
            y1: pixel_field(obj, "y1")?,
            x2: pixel_field(obj, "x2")?,
            y2: pixel_field(obj, "y2")?,
            duration_ms: number_field(obj, "duration_ms")?
                .map(|ms| ms.max(0.0) as u32)
                .unwrap_or(DEFAULT_SWIPE_MS),
        },
        "input_text" => DeviceCommand::InputText {
            text: obj
                .get("text")
                .map(value_to_text)
                .ok_or_else(|| SpecError::MissingField("text".to_string()))?,
        },
        "keyevent" => {
            let key = obj
                .get("code")
                .or_else(|| obj.get("name"))
                .map(value_to_text)
                .ok_or_else(|| SpecError::MissingField("code".to_string()))?;
            let code = keycode::from_name(&key).ok_or_else(|| SpecError::InvalidField {
                field: "code".to_string(),
                reason: format!("unknown key '{}'", key),
            })?;
            DeviceCommand::Keyevent { code }
        }
        "back" => DeviceCommand::Back,
        "home" => DeviceCommand::Home,
        "screenshot" => DeviceCommand::Screenshot,
        "launch" => DeviceCommand::Launch {
            package: string_field(obj, "package")?.unwrap_or_else(|| package.to_string()),
            activity: string_field(obj, "activity")?,
        },
        "stop" => DeviceCommand::Stop {
            package: string_field(obj, "package")?.unwrap_or_else(|| package.to_string()),
        },
        other => return Err(SpecError::UnknownCommand(other.to_string())),
    };
    Ok(command)
}

fn is_goal_step(value: &Value) -> bool {
    value.as_object().map(|o| o.contains_key("goal")).unwrap_or(false)
}

fn trim_step(step: StepSpec) -> StepSpec {
    StepSpec {
        goal: step.goal.trim().to_string(),
        suggestions: step.suggestions.trim().to_string(),
        negative_prompt: step.negative_prompt.trim().to_string(),
        success_criteria: step.success_criteria.trim().to_string(),
    }
}

fn substitute_placeholders(value: &mut Value, timestamp: &str) {
    match value {
        Value::String(s) if s.contains(TIMESTAMP_PLACEHOLDER) => {
            *s = s.replace(TIMESTAMP_PLACEHOLDER, timestamp);
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_placeholders(v, timestamp)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_placeholders(v, timestamp)),
        _ => {}
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> SpecResult<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(SpecError::InvalidField {
            field: key.to_string(),
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> SpecResult<Option<f64>> {
    let invalid = |v: &Value| SpecError::InvalidField {
        field: key.to_string(),
        reason: format!("expected a number, got {}", v),
    };
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(v)),
        Some(v @ Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| invalid(v)),
        Some(v) => Err(invalid(v)),
    }
}

fn pixel_field(obj: &Map<String, Value>, key: &str) -> SpecResult<u32> {
    let value = number_field(obj, key)?.ok_or_else(|| SpecError::MissingField(key.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(SpecError::InvalidField {
            field: key.to_string(),
            reason: format!("pixel coordinate must be non-negative, got {}", value),
        });
    }
    Ok(value as u32)
}
