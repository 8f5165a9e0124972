//! Types for run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent::Outcome;
use crate::backend::ProviderKind;

/// Result of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step number (1-based)
    pub index: usize,

    pub goal: String,

    pub success_criteria: String,

    /// Terminal outcome of the step
    pub outcome: Outcome,

    /// Turns spent in this step
    pub turns: u32,

    /// Why the step ended (backend reason, budget, error)
    pub reason: Option<String>,
}

/// Result of a complete run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Package under test
    pub package: String,

    /// Backend that drove the run; `None` for scripts
    pub provider: Option<ProviderKind>,

    /// Terminal outcome of the run
    pub outcome: Outcome,

    /// Why the run ended
    pub reason: Option<String>,

    /// Step-by-step results, in execution order (steps never reached are absent)
    pub steps: Vec<StepResult>,

    /// Turns taken across all steps
    pub total_turns: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl RunResult {
    /// A run that failed before any turn was played.
    pub fn setup_failed(package: impl Into<String>, provider: Option<ProviderKind>, error: impl fmt::Display) -> Self {
        let now = Utc::now();
        RunResult {
            package: package.into(),
            provider,
            outcome: Outcome::Failed,
            reason: Some(format!("setup failed: {}", error)),
            steps: Vec::new(),
            total_turns: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Process exit code for this result
    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} after {} turn(s) in {:.1}s",
            self.package,
            self.outcome,
            self.total_turns,
            self.duration_ms as f64 / 1000.0
        );
        if let Some(reason) = &self.reason {
            line.push_str(&format!(" ({})", reason));
        }
        line
    }
}
