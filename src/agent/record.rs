//! Turn records and the recorder boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::action::{ActionDescriptor, DeviceCommand};
use crate::device::Screenshot;
use crate::runner::RunResult;

/// Result type for recorder operations
pub type RecordResult<T> = Result<T, RecordError>;

/// Recorder failures. Logged by the caller, never fatal to a run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Why a turn did not run its action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TurnError {
    Decision(String),
    Translation(String),
    Execution(String),
}

/// One turn, as handed to the recorder. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Run-wide turn number (1-based)
    pub turn: u32,
    /// Step number (1-based)
    pub step: usize,
    /// Turn number within the step (1-based)
    pub step_turn: u32,
    pub timestamp: DateTime<Utc>,
    /// File name of the screenshot observed at the start of the turn
    pub screenshot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Action proposed by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed: Option<ActionDescriptor>,
    /// Action actually chosen (differs from `proposed` after a substitution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionDescriptor>,
    #[serde(default)]
    pub substituted: bool,
    /// Device command the action translated to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<DeviceCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
}

impl TurnRecord {
    pub fn new(turn: u32, step: usize, step_turn: u32) -> Self {
        Self {
            turn,
            step,
            step_turn,
            timestamp: Utc::now(),
            screenshot: Self::screenshot_name(turn),
            raw_response: None,
            rationale: None,
            proposed: None,
            action: None,
            substituted: false,
            command: None,
            error: None,
        }
    }

    /// Screenshot file name for a turn
    pub fn screenshot_name(turn: u32) -> String {
        format!("turn_{:03}.png", turn)
    }

    /// True when nothing was executed on the device this turn
    pub fn is_no_op(&self) -> bool {
        self.command.is_none() || matches!(self.error, Some(TurnError::Execution(_)))
    }
}

/// Sink for run artifacts.
///
/// The loop only emits events; layout and storage belong to the recorder.
pub trait RunRecorder {
    /// A pre-step was executed; `screenshot` is the screen right after it.
    fn record_pre_step(
        &mut self,
        index: usize,
        command: &DeviceCommand,
        screenshot: Option<&Screenshot>,
    ) -> RecordResult<()>;

    /// A turn finished.
    fn record_turn(&mut self, record: &TurnRecord, screenshot: &Screenshot) -> RecordResult<()>;

    /// The run is over.
    fn finish(&mut self, result: &RunResult) -> RecordResult<()>;
}

impl<R: RunRecorder + ?Sized> RunRecorder for &mut R {
    fn record_pre_step(
        &mut self,
        index: usize,
        command: &DeviceCommand,
        screenshot: Option<&Screenshot>,
    ) -> RecordResult<()> {
        (**self).record_pre_step(index, command, screenshot)
    }

    fn record_turn(&mut self, record: &TurnRecord, screenshot: &Screenshot) -> RecordResult<()> {
        (**self).record_turn(record, screenshot)
    }

    fn finish(&mut self, result: &RunResult) -> RecordResult<()> {
        (**self).finish(result)
    }
}

/// Recorder that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    pub pre_steps: Vec<(usize, DeviceCommand)>,
    pub turns: Vec<TurnRecord>,
    pub result: Option<RunResult>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions chosen per turn, `None` for no-op turns.
    pub fn actions(&self) -> Vec<Option<&ActionDescriptor>> {
        self.turns.iter().map(|t| t.action.as_ref()).collect()
    }
}

impl RunRecorder for MemoryRecorder {
    fn record_pre_step(
        &mut self,
        index: usize,
        command: &DeviceCommand,
        _screenshot: Option<&Screenshot>,
    ) -> RecordResult<()> {
        self.pre_steps.push((index, command.clone()));
        Ok(())
    }

    fn record_turn(&mut self, record: &TurnRecord, _screenshot: &Screenshot) -> RecordResult<()> {
        self.turns.push(record.clone());
        Ok(())
    }

    fn finish(&mut self, result: &RunResult) -> RecordResult<()> {
        self.result = Some(result.clone());
        Ok(())
    }
}
