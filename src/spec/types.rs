use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::action::DeviceCommand;

/// One sub-goal of a test: what to reach and how to judge it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// What the agent must achieve in this step
    pub goal: String,

    /// Strict guidance on how to get there
    #[serde(default)]
    pub suggestions: String,

    /// Hard constraints: things the agent must never do
    #[serde(default)]
    pub negative_prompt: String,

    /// Observable condition that means the step succeeded
    #[serde(default)]
    pub success_criteria: String,
}

/// Controls APK installation before the run and removal after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Assume the package is already on the device
    pub skip_install: bool,
    /// Uninstall the package once the run is over
    pub uninstall_after: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            skip_install: false,
            uninstall_after: true,
        }
    }
}

/// A loaded, normalized test specification.
///
/// `steps` always holds at least one entry for agent specs: when the
/// document declares no `steps`, the top-level guidance fields form the
/// single implicit step. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// APK to install (required unless `install.skip_install`)
    pub apk: Option<PathBuf>,

    /// Android package name of the app under test
    pub package: String,

    /// Activity to launch (launcher intent when absent)
    pub activity: Option<String>,

    /// Top-level guidance, as declared
    pub goal: String,
    pub suggestions: String,
    pub negative_prompt: String,
    pub success_criteria: String,

    /// Free-form hints shared by every step
    pub hints: Vec<String>,

    /// Ordered sub-goals; an AND-sequence
    pub steps: Vec<StepSpec>,

    /// Deterministic setup commands run before the agent loop
    pub pre_steps: Vec<DeviceCommand>,

    /// Deterministic command list when `steps` holds commands instead of goals
    pub script: Vec<DeviceCommand>,

    pub install: InstallConfig,
}

impl TestSpec {
    /// True when the document describes a deterministic command script.
    pub fn is_script(&self) -> bool {
        !self.script.is_empty()
    }

    /// Short label for session directories and logs.
    pub fn label(&self) -> &str {
        self.package.rsplit('.').next().unwrap_or(&self.package)
    }
}

/// Result type for spec operations
pub type SpecResult<T> = Result<T, SpecError>;

/// Errors raised while loading or validating a test spec
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'apk' is required unless skip_install=true")]
    MissingApk,

    #[error("step {0} has an empty goal")]
    EmptyGoal(usize),
}
