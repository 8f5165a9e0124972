//! Loop guard: detects an agent stuck repeating the same action.
//!
//! The guard keeps the trailing window of the last N executed actions of the
//! current step. When a candidate is structurally identical to the previous
//! N-1 actions (so all N slots would hold the same action), the guard swaps
//! it for a recovery action (hardware BACK) and clears the window. The
//! substitution is a nudge, never a failure.

use std::collections::VecDeque;

use tracing::warn;

use crate::action::ActionDescriptor;

/// Default number of identical consecutive actions that triggers recovery.
pub const DEFAULT_REPETITION_WINDOW: usize = 10;

/// Smallest meaningful window: one executed action plus the candidate.
pub const MIN_REPETITION_WINDOW: usize = 2;

/// Verdict for a candidate action.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Allow,
    Substitute(ActionDescriptor),
}

impl GuardDecision {
    pub fn is_substitute(&self) -> bool {
        matches!(self, GuardDecision::Substitute(_))
    }
}

/// Trailing-window repetition detector.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    window: usize,
    history: VecDeque<ActionDescriptor>,
    recovery: ActionDescriptor,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPETITION_WINDOW)
    }
}

impl LoopGuard {
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_REPETITION_WINDOW);
        Self {
            window,
            history: VecDeque::with_capacity(window),
            recovery: ActionDescriptor::back(),
        }
    }

    /// Override the recovery action (defaults to hardware BACK).
    pub fn with_recovery(mut self, recovery: ActionDescriptor) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Executed actions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Number of most recent actions identical to `candidate`.
    pub fn trailing_repeats(&self, candidate: &ActionDescriptor) -> usize {
        self.history.iter().rev().take_while(|a| *a == candidate).count()
    }

    /// Decide whether `candidate` may run.
    pub fn inspect(&self, candidate: &ActionDescriptor) -> GuardDecision {
        if self.trailing_repeats(candidate) >= self.window - 1 {
            warn!(
                action = %candidate,
                window = self.window,
                recovery = %self.recovery,
                "repeated action detected, substituting recovery action"
            );
            GuardDecision::Substitute(self.recovery.clone())
        } else {
            GuardDecision::Allow
        }
    }

    /// Record the outcome of a turn.
    ///
    /// After a substitution the window restarts empty; otherwise the
    /// executed action is appended and the oldest entry falls off.
    pub fn record(&mut self, executed: &ActionDescriptor, decision: &GuardDecision) {
        if decision.is_substitute() {
            self.history.clear();
            return;
        }
        self.history.push_back(executed.clone());
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    /// Forget all history (new step).
    pub fn reset(&mut self) {
        self.history.clear();
    }
}
