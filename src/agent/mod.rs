//! Goal-directed agent loop.
//!
//! The [`TurnController`] alternates observation, decision, loop guarding,
//! translation and execution until a step ends, then moves on to the next
//! step of the spec. Per-run state lives in [`AgentState`]; turn artifacts
//! go to a [`RunRecorder`].

pub mod controller;
pub mod record;
pub mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::action::Resolution;
use crate::device::DeviceError;

pub use controller::TurnController;
pub use record::{MemoryRecorder, RecordError, RecordResult, RunRecorder, TurnError, TurnRecord};
pub use state::{AgentState, Outcome, RECENT_TURNS};

/// Result type for setup operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Setup failures. Fatal: the run ends `failed` before any turn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("device unreachable: {0}")]
    Device(#[from] DeviceError),

    #[error("invalid screen geometry (canvas {canvas}, device {device})")]
    InvalidGeometry { canvas: Resolution, device: Resolution },

    #[error("package '{0}' is not installed and installation is skipped")]
    NotInstalled(String),

    #[error("no APK to install for '{0}'")]
    MissingApk(String),

    #[error("{stage} failed: {source}")]
    Lifecycle {
        stage: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("pre-step {index} ({command}) failed: {source}")]
    PreStep {
        index: usize,
        command: String,
        #[source]
        source: DeviceError,
    },
}

/// Cooperative cancellation flag, checked at turn boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
