//! Deterministic command runner.
//!
//! Replays a spec's command list on a device with no decision backend,
//! capturing a screenshot after every command. The first failing command
//! ends the run as failed.

use chrono::Utc;
use std::time::Instant;
use tracing::{info, warn};

use crate::agent::{CancelToken, Outcome, RunRecorder, TurnError, TurnRecord};
use crate::device::DevicePort;
use crate::runner::{RunResult, StepResult};
use crate::spec::TestSpec;

/// Run `spec.pre_steps` followed by `spec.script`.
pub fn run_script<D, R>(device: &mut D, spec: &TestSpec, recorder: &mut R, cancel: &CancelToken) -> RunResult
where
    D: DevicePort + ?Sized,
    R: RunRecorder + ?Sized,
{
    let started_at = Utc::now();
    let clock = Instant::now();
    info!(package = %spec.package, commands = spec.script.len(), "script started");

    let commands = spec.pre_steps.iter().chain(spec.script.iter());
    let mut turns = 0;
    let mut outcome = Outcome::Succeeded;
    let mut reason = format!("{} command(s) executed", spec.pre_steps.len() + spec.script.len());

    for command in commands {
        if cancel.is_cancelled() {
            outcome = Outcome::Failed;
            reason = "cancelled".to_string();
            break;
        }
        turns += 1;
        let mut record = TurnRecord::new(turns, 1, turns);
        record.command = Some(command.clone());
        info!(turn = turns, command = command.name(), "executing");

        let failure = device.execute(command).err().map(|e| e.to_string());
        if let Some(message) = &failure {
            warn!(turn = turns, error = %message, "command failed");
            record.error = Some(TurnError::Execution(message.clone()));
        }

        match device.capture_screenshot() {
            Ok(shot) => {
                if let Err(e) = recorder.record_turn(&record, &shot) {
                    warn!(turn = turns, error = %e, "failed to record turn");
                }
            }
            Err(e) => warn!(turn = turns, error = %e, "no screenshot after command"),
        }

        if let Some(message) = failure {
            outcome = Outcome::Failed;
            reason = format!("command {} ({}) failed: {}", turns, command.name(), message);
            break;
        }
    }

    let result = RunResult {
        package: spec.package.clone(),
        provider: None,
        outcome,
        reason: Some(reason.clone()),
        steps: vec![StepResult {
            index: 1,
            goal: spec.goal.clone(),
            success_criteria: spec.success_criteria.clone(),
            outcome,
            turns,
            reason: Some(reason),
        }],
        total_turns: turns,
        started_at,
        finished_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
    };
    info!(outcome = %result.outcome, turns, "script finished");
    if let Err(e) = recorder.finish(&result) {
        warn!(error = %e, "failed to record run result");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::DeviceCommand;
    use crate::agent::MemoryRecorder;
    use crate::device::MockDevice;
    use crate::spec::parse_spec;

    fn script_spec(steps: &str) -> TestSpec {
        parse_spec(
            &format!(r#"{{"package": "com.example", "skip_install": true, "steps": {}}}"#, steps),
            "0",
        )
        .unwrap()
    }

    #[test]
    fn test_script_runs_every_command() {
        let spec = script_spec(r#"[{"cmd": "tap", "x": 5, "y": 5}, {"cmd": "back"}, {"cmd": "screenshot"}]"#);
        let mut device = MockDevice::new(100, 100);
        let mut recorder = MemoryRecorder::new();
        let result = run_script(&mut device, &spec, &mut recorder, &CancelToken::new());

        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.total_turns, 3);
        assert_eq!(recorder.turns.len(), 3);
        assert_eq!(device.capture_count(), 3);
        assert_eq!(device.executed()[1], DeviceCommand::Back);
    }

    #[test]
    fn test_script_stops_at_first_failure() {
        let spec = script_spec(r#"[{"cmd": "tap", "x": 500, "y": 5}, {"cmd": "back"}]"#);
        let mut device = MockDevice::new(100, 100);
        let mut recorder = MemoryRecorder::new();
        let result = run_script(&mut device, &spec, &mut recorder, &CancelToken::new());

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.total_turns, 1);
        assert!(device.executed().is_empty());
        assert!(matches!(recorder.turns[0].error, Some(TurnError::Execution(_))));
        assert!(recorder.result.is_some());
    }
}
