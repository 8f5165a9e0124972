//! Per-run mutable state of the turn controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::guard::LoopGuard;

/// Number of turn summaries kept for the stateless backend's prompt.
pub const RECENT_TURNS: usize = 5;

/// Lifecycle of a run (and of each step within it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Running => "running",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the controller mutates while a run is in progress.
///
/// Owned by exactly one controller for one run. Counters and history are
/// per step except `total_turns`, which spans the whole run.
#[derive(Debug, Clone)]
pub struct AgentState {
    step_index: usize,
    step_turns: u32,
    total_turns: u32,
    consecutive_exec_errors: u32,
    guard: LoopGuard,
    recent: Vec<String>,
    outcome: Outcome,
    reason: Option<String>,
}

impl AgentState {
    pub fn new(repetition_window: usize) -> Self {
        Self {
            step_index: 0,
            step_turns: 0,
            total_turns: 0,
            consecutive_exec_errors: 0,
            guard: LoopGuard::new(repetition_window),
            recent: Vec::with_capacity(RECENT_TURNS),
            outcome: Outcome::Running,
            reason: None,
        }
    }

    /// Zero-based index of the current step
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// Turns taken in the current step
    pub fn step_turns(&self) -> u32 {
        self.step_turns
    }

    /// Turns taken in the whole run
    pub fn total_turns(&self) -> u32 {
        self.total_turns
    }

    /// Enter a step: per-step counters and action history start empty.
    pub fn begin_step(&mut self, index: usize) {
        self.step_index = index;
        self.step_turns = 0;
        self.consecutive_exec_errors = 0;
        self.guard.reset();
        self.recent.clear();
    }

    /// Count a new turn and return its run-wide number (1-based).
    pub fn begin_turn(&mut self) -> u32 {
        debug_assert!(!self.is_finished(), "turn started after the run finished");
        self.step_turns += 1;
        self.total_turns += 1;
        self.total_turns
    }

    pub fn guard(&self) -> &LoopGuard {
        &self.guard
    }

    pub fn guard_mut(&mut self) -> &mut LoopGuard {
        &mut self.guard
    }

    /// Latest turn summaries of the current step, oldest first.
    pub fn recent_turns(&self) -> &[String] {
        &self.recent
    }

    pub fn push_recent(&mut self, summary: String) {
        if self.recent.len() == RECENT_TURNS {
            self.recent.remove(0);
        }
        self.recent.push(summary);
    }

    /// Count a failed execution; returns the current streak.
    pub fn note_exec_error(&mut self) -> u32 {
        self.consecutive_exec_errors += 1;
        self.consecutive_exec_errors
    }

    pub fn clear_exec_errors(&mut self) {
        self.consecutive_exec_errors = 0;
    }

    pub fn consecutive_exec_errors(&self) -> u32 {
        self.consecutive_exec_errors
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_terminal()
    }

    /// Set the terminal outcome of the run.
    ///
    /// Only the first terminal assignment takes effect; returns whether this
    /// call was it.
    pub fn conclude(&mut self, outcome: Outcome, reason: Option<String>) -> bool {
        if !outcome.is_terminal() {
            return false;
        }
        if self.is_finished() {
            warn!(
                current = %self.outcome,
                ignored = %outcome,
                "run outcome already set, ignoring"
            );
            return false;
        }
        self.outcome = outcome;
        self.reason = reason;
        true
    }
}
