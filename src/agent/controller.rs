//! The turn controller: observe, decide, guard, translate, execute, repeat.

use chrono::Utc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::record::{RunRecorder, TurnError, TurnRecord};
use super::state::{AgentState, Outcome};
use super::{AgentError, AgentResult, CancelToken};
use crate::action::{ActionDescriptor, DeviceCommand, Resolution, ScreenGeometry};
use crate::backend::{Acknowledgement, DecisionBackend, DecisionRequest, ProviderSession, TaskContext};
use crate::config::AgentSettings;
use crate::device::{DevicePort, Screenshot};
use crate::guard::GuardDecision;
use crate::runner::{RunResult, StepResult};
use crate::spec::{StepSpec, TestSpec};
use crate::translate::translate;

/// How a step ended
#[derive(Debug, Clone, PartialEq)]
struct StepEnd {
    outcome: Outcome,
    reason: String,
}

impl StepEnd {
    fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// Drives one test spec against one device with one backend.
///
/// A controller owns its device port, backend and recorder exclusively.
/// Concurrent runs use independent controllers.
pub struct TurnController<D: DevicePort, R: RunRecorder> {
    device: D,
    backend: Box<dyn DecisionBackend>,
    recorder: R,
    settings: AgentSettings,
    canvas: Option<Resolution>,
    cancel: CancelToken,
}

impl<D: DevicePort, R: RunRecorder> TurnController<D, R> {
    pub fn new(device: D, backend: Box<dyn DecisionBackend>, recorder: R, settings: AgentSettings) -> Self {
        Self {
            device,
            backend,
            recorder,
            settings,
            canvas: None,
            cancel: CancelToken::new(),
        }
    }

    /// Declare a virtual canvas to the backend (device resolution otherwise).
    pub fn with_canvas(mut self, canvas: Option<Resolution>) -> Self {
        self.canvas = canvas;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next turn boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn into_parts(self) -> (D, R) {
        (self.device, self.recorder)
    }

    /// Run a test spec to a terminal outcome.
    ///
    /// Always yields a result: setup failures and step failures are
    /// reported through the outcome, never as a panic or early error.
    pub fn run(&mut self, spec: &TestSpec) -> RunResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = AgentState::new(self.settings.repetition_window);
        info!(
            package = %spec.package,
            provider = %self.backend.kind(),
            device = self.device.source_type(),
            steps = spec.steps.len(),
            "run started"
        );

        let mut steps = Vec::new();
        match self.prepare(spec) {
            Ok(geometry) => {
                let mut session = self.backend.open_session();
                let end = self.run_steps(spec, geometry, &mut state, &mut session, &mut steps);
                state.conclude(end.outcome, Some(end.reason));
            }
            Err(e) => {
                error!(error = %e, "setup failed");
                state.conclude(Outcome::Failed, Some(format!("setup failed: {}", e)));
            }
        }

        self.teardown(spec);

        let result = RunResult {
            package: spec.package.clone(),
            provider: Some(self.backend.kind()),
            outcome: state.outcome(),
            reason: state.reason().map(str::to_string),
            steps,
            total_turns: state.total_turns(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        info!(
            outcome = %result.outcome,
            turns = result.total_turns,
            duration_ms = result.duration_ms,
            "run finished"
        );
        if let Err(e) = self.recorder.finish(&result) {
            warn!(error = %e, "failed to record run result");
        }
        result
    }

    /// Resolve geometry, bring the app up and execute pre-steps.
    fn prepare(&mut self, spec: &TestSpec) -> AgentResult<ScreenGeometry> {
        let device_size = self.device.screen_size()?;
        let canvas = self.canvas.unwrap_or(device_size);
        if canvas.is_degenerate() || device_size.is_degenerate() {
            return Err(AgentError::InvalidGeometry { canvas, device: device_size });
        }
        let geometry = ScreenGeometry::new(canvas, device_size);
        debug!(canvas = %canvas, device = %device_size, "screen geometry");

        self.install_app(spec)?;
        self.launch_app(spec)?;

        for (i, command) in spec.pre_steps.iter().enumerate() {
            let index = i + 1;
            info!(index, command = command.name(), "pre-step");
            self.device.execute(command).map_err(|source| AgentError::PreStep {
                index,
                command: command.name().to_string(),
                source,
            })?;
            let screenshot = match self.device.capture_screenshot() {
                Ok(shot) => Some(shot),
                Err(e) => {
                    warn!(index, error = %e, "no screenshot after pre-step");
                    None
                }
            };
            if let Err(e) = self.recorder.record_pre_step(index, command, screenshot.as_ref()) {
                warn!(index, error = %e, "failed to record pre-step");
            }
        }
        Ok(geometry)
    }

    fn install_app(&mut self, spec: &TestSpec) -> AgentResult<()> {
        if spec.install.skip_install {
            if !self.device.is_installed(&spec.package)? {
                return Err(AgentError::NotInstalled(spec.package.clone()));
            }
            return Ok(());
        }

        let apk = spec
            .apk
            .clone()
            .ok_or_else(|| AgentError::MissingApk(spec.package.clone()))?;
        if self.device.is_installed(&spec.package)? {
            info!(package = %spec.package, "removing existing install");
            self.lifecycle("uninstall", &DeviceCommand::Uninstall {
                package: spec.package.clone(),
            })?;
        }
        info!(apk = %apk.display(), "installing");
        self.lifecycle("install", &DeviceCommand::Install { apk })
    }

    fn launch_app(&mut self, spec: &TestSpec) -> AgentResult<()> {
        self.lifecycle("stop", &DeviceCommand::Stop {
            package: spec.package.clone(),
        })?;
        info!(package = %spec.package, activity = ?spec.activity, "launching");
        self.lifecycle("launch", &DeviceCommand::Launch {
            package: spec.package.clone(),
            activity: spec.activity.clone(),
        })
    }

    fn lifecycle(&mut self, stage: &'static str, command: &DeviceCommand) -> AgentResult<()> {
        self.device
            .execute(command)
            .map_err(|source| AgentError::Lifecycle { stage, source })
    }

    fn teardown(&mut self, spec: &TestSpec) {
        if !spec.install.uninstall_after || spec.package.is_empty() {
            return;
        }
        let command = DeviceCommand::Uninstall {
            package: spec.package.clone(),
        };
        if let Err(e) = self.device.execute(&command) {
            warn!(package = %spec.package, error = %e, "uninstall after run failed");
        }
    }

    /// Execute the steps as an AND-sequence.
    fn run_steps(
        &mut self,
        spec: &TestSpec,
        geometry: ScreenGeometry,
        state: &mut AgentState,
        session: &mut ProviderSession,
        results: &mut Vec<StepResult>,
    ) -> StepEnd {
        for (index, step) in spec.steps.iter().enumerate() {
            let before = state.total_turns();
            state.begin_step(index);
            info!(step = index + 1, goal = %step.goal, "step started");

            let end = self.run_step(spec, step, geometry, state, session);
            info!(step = index + 1, outcome = %end.outcome, reason = %end.reason, "step finished");
            results.push(StepResult {
                index: index + 1,
                goal: step.goal.clone(),
                success_criteria: step.success_criteria.clone(),
                outcome: end.outcome,
                turns: state.total_turns() - before,
                reason: Some(end.reason.clone()),
            });

            if end.outcome != Outcome::Succeeded {
                let reason = if spec.steps.len() > 1 {
                    format!("step {}: {}", index + 1, end.reason)
                } else {
                    end.reason
                };
                return StepEnd::new(end.outcome, reason);
            }
        }

        match results.last() {
            Some(last) => StepEnd::new(
                Outcome::Succeeded,
                last.reason.clone().unwrap_or_else(|| "all steps succeeded".to_string()),
            ),
            None => StepEnd::new(Outcome::Failed, "no steps to run"),
        }
    }

    /// Turn loop of a single step.
    fn run_step(
        &mut self,
        spec: &TestSpec,
        step: &StepSpec,
        geometry: ScreenGeometry,
        state: &mut AgentState,
        session: &mut ProviderSession,
    ) -> StepEnd {
        let context = TaskContext::for_step(spec, step);
        loop {
            if self.cancel.is_cancelled() {
                warn!(turn = state.total_turns(), "run cancelled");
                return StepEnd::new(Outcome::Failed, "cancelled");
            }

            if let Some(end) = self.play_turn(&context, geometry, state, session) {
                return end;
            }

            if state.step_turns() >= self.settings.max_turns {
                return StepEnd::new(
                    Outcome::TimedOut,
                    format!("turn budget of {} exhausted", self.settings.max_turns),
                );
            }
            if let Some(ceiling) = self.settings.max_total_turns {
                if state.total_turns() >= ceiling {
                    return StepEnd::new(Outcome::TimedOut, format!("run turn ceiling of {} exhausted", ceiling));
                }
            }

            // Paces no-op turns as well as executed ones
            if !self.settings.action_delay.is_zero() {
                thread::sleep(self.settings.action_delay);
            }
        }
    }

    /// One observe-decide-act cycle. Returns `Some` when the step is over.
    fn play_turn(
        &mut self,
        context: &TaskContext,
        geometry: ScreenGeometry,
        state: &mut AgentState,
        session: &mut ProviderSession,
    ) -> Option<StepEnd> {
        let screenshot = match self.capture() {
            Ok(shot) => shot,
            Err(e) => return Some(StepEnd::new(Outcome::Failed, format!("screenshot capture failed: {}", e))),
        };

        let turn = state.begin_turn();
        let mut record = TurnRecord::new(turn, state.step_index() + 1, state.step_turns());

        let request = DecisionRequest {
            screenshot: &screenshot,
            context,
            canvas: geometry.canvas,
            recent_turns: state.recent_turns(),
        };
        let decision = match self.backend.decide(&request, session) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(turn, error = %e, "decision error, turn skipped");
                record.raw_response = e.raw_response().cloned();
                record.error = Some(TurnError::Decision(e.to_string()));
                state.push_recent(format!("turn {}: no action ({})", turn, e));
                self.record(&record, &screenshot);
                return None;
            }
        };
        record.raw_response = Some(decision.raw);
        record.rationale = decision.rationale;
        record.proposed = Some(decision.action.clone());
        if let Some(rationale) = &record.rationale {
            debug!(turn, %rationale, "backend rationale");
        }

        if let ActionDescriptor::EndTest { success, reason } = &decision.action {
            info!(turn, success, %reason, "backend ended the step");
            record.action = Some(decision.action.clone());
            self.acknowledge(session, Acknowledgement::ok("Step ended."));
            self.record(&record, &screenshot);
            let outcome = if *success { Outcome::Succeeded } else { Outcome::Failed };
            return Some(StepEnd::new(outcome, reason.clone()));
        }

        let verdict = state.guard().inspect(&decision.action);
        let action = match &verdict {
            GuardDecision::Allow => decision.action,
            GuardDecision::Substitute(recovery) => {
                record.substituted = true;
                recovery.clone()
            }
        };
        record.action = Some(action.clone());
        state.guard_mut().record(&action, &verdict);

        let command = match translate(&action, &geometry) {
            Ok(command) => command,
            Err(e) => {
                warn!(turn, action = %action, error = %e, "translation error, turn skipped");
                record.error = Some(TurnError::Translation(e.to_string()));
                self.acknowledge(session, Acknowledgement::error(format!("Action not executed: {}", e)));
                state.push_recent(format!("turn {}: {} -> not executed ({})", turn, action, e));
                self.record(&record, &screenshot);
                return None;
            }
        };
        record.command = Some(command.clone());

        info!(turn, step_turn = record.step_turn, action = %action, command = command.name(), "executing");
        let mut end = None;
        let (ack, summary) = match self.device.execute(&command) {
            Ok(()) => {
                state.clear_exec_errors();
                if record.substituted {
                    (
                        Acknowledgement::ok("Action replaced by BACK: repeated action detected."),
                        format!("turn {}: {} -> replaced by back (repeated action)", turn, proposed_label(&record)),
                    )
                } else {
                    (Acknowledgement::ok("Action executed."), format!("turn {}: {} -> ok", turn, action))
                }
            }
            Err(e) => {
                let streak = state.note_exec_error();
                warn!(turn, error = %e, streak, "execution error");
                record.error = Some(TurnError::Execution(e.to_string()));
                if streak >= self.settings.max_exec_errors {
                    end = Some(StepEnd::new(
                        Outcome::Failed,
                        format!("{} consecutive execution errors, last: {}", streak, e),
                    ));
                }
                (
                    Acknowledgement::error(format!("Action failed: {}", e)),
                    format!("turn {}: {} -> error ({})", turn, action, e),
                )
            }
        };
        self.acknowledge(session, ack);
        state.push_recent(summary);
        self.record(&record, &screenshot);
        end
    }

    /// Screenshot with retries; capture is side-effect free.
    fn capture(&mut self) -> crate::device::DeviceResult<Screenshot> {
        let attempts = self.settings.max_exec_errors.max(1);
        let mut attempt = 1;
        loop {
            match self.device.capture_screenshot() {
                Ok(shot) => return Ok(shot),
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "screenshot failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn acknowledge(&self, session: &mut ProviderSession, ack: Acknowledgement) {
        if let Err(e) = self.backend.acknowledge(session, &ack) {
            warn!(error = %e, "failed to acknowledge action");
        }
    }

    fn record(&mut self, record: &TurnRecord, screenshot: &Screenshot) {
        if let Err(e) = self.recorder.record_turn(record, screenshot) {
            warn!(turn = record.turn, error = %e, "failed to record turn");
        }
    }
}

fn proposed_label(record: &TurnRecord) -> String {
    record
        .proposed
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "action".to_string())
}
