//! Decision backend adapter.
//!
//! One decision contract over two backend variants with different
//! statefulness:
//! - [`OpenAiBackend`]: stateless; every request carries the full context
//! - [`ClaudeBackend`]: stateful; every tool call must be acknowledged with a
//!   result before the next decision may be requested
//!
//! Which variant is in use is carried explicitly by [`ProviderKind`] and by
//! the shape of the [`ProviderSession`] value the loop threads through calls.

pub mod claude;
pub mod image;
pub mod openai;
pub mod prompt;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::action::{ActionDescriptor, Resolution};
use crate::config::BackendSettings;
use crate::device::Screenshot;

pub use claude::{ClaudeBackend, Transcript};
pub use openai::OpenAiBackend;
pub use prompt::TaskContext;
pub use transport::{CurlTransport, HttpTransport, RecordedRequest, ReplayTransport};

/// Result type for decision operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Decision errors. Non-fatal to the loop: the turn becomes a no-op.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The response held neither an action nor a termination call
    #[error("response contained no action")]
    NoAction { raw: Value },

    #[error("unsupported action '{name}'")]
    UnsupportedAction { name: String, raw: Value },

    /// A stateful session still has tool calls without a result
    #[error("{0} tool call(s) not acknowledged before the next decision")]
    Unacknowledged(usize),

    /// The session value does not belong to this backend
    #[error("session does not match a {0} backend")]
    SessionMismatch(ProviderKind),

    #[error("missing credentials: set {0}")]
    MissingCredentials(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] ::image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// The raw backend response, when the error came from interpreting one.
    pub fn raw_response(&self) -> Option<&Value> {
        match self {
            BackendError::NoAction { raw } | BackendError::UnsupportedAction { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Which backend variant drives the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Claude,
}

impl ProviderKind {
    /// Case-insensitive name lookup (`openai`, `claude`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
        }
    }

    /// Whether the variant needs a transcript and explicit acknowledgements.
    pub fn is_stateful(&self) -> bool {
        matches!(self, ProviderKind::Claude)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown provider '{}' (expected openai or claude)", s))
    }
}

/// Backend-specific conversational state for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderSession {
    /// Nothing persists between calls
    Stateless,
    /// Ordered transcript with explicit tool acknowledgements
    Stateful(Transcript),
}

impl ProviderSession {
    pub fn is_stateful(&self) -> bool {
        matches!(self, ProviderSession::Stateful(_))
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        match self {
            ProviderSession::Stateless => None,
            ProviderSession::Stateful(transcript) => Some(transcript),
        }
    }

    /// Tool calls still waiting for a result
    pub fn pending_acknowledgements(&self) -> usize {
        self.transcript().map_or(0, |t| t.pending().len())
    }
}

/// Everything a backend needs to propose the next action.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub screenshot: &'a Screenshot,
    pub context: &'a TaskContext,
    /// Canvas the backend is told to reason in
    pub canvas: Resolution,
    /// Short summaries of the latest turns of the current step
    pub recent_turns: &'a [String],
}

/// One normalized decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: ActionDescriptor,
    /// Canvas the action's coordinates are expressed in
    pub canvas: Resolution,
    /// Human-readable reasoning, when the backend gave any
    pub rationale: Option<String>,
    /// The raw backend response
    pub raw: Value,
}

/// Result of executing the last decided action, reported back to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub success: bool,
    pub message: String,
}

impl Acknowledgement {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// A vision-capable action policy.
pub trait DecisionBackend: Send {
    fn kind(&self) -> ProviderKind;

    /// Fresh session value for a new run.
    fn open_session(&self) -> ProviderSession;

    /// Propose the next action for the given observation.
    fn decide(&self, request: &DecisionRequest<'_>, session: &mut ProviderSession) -> BackendResult<Decision>;

    /// Report the outcome of the last decided action.
    ///
    /// Stateful backends must receive this before the next `decide`.
    fn acknowledge(&self, session: &mut ProviderSession, ack: &Acknowledgement) -> BackendResult<()>;
}

impl<T: DecisionBackend + ?Sized> DecisionBackend for Box<T> {
    fn kind(&self) -> ProviderKind {
        (**self).kind()
    }

    fn open_session(&self) -> ProviderSession {
        (**self).open_session()
    }

    fn decide(&self, request: &DecisionRequest<'_>, session: &mut ProviderSession) -> BackendResult<Decision> {
        (**self).decide(request, session)
    }

    fn acknowledge(&self, session: &mut ProviderSession, ack: &Acknowledgement) -> BackendResult<()> {
        (**self).acknowledge(session, ack)
    }
}

/// Build the configured backend over the given transport.
pub fn create_backend(
    settings: &BackendSettings,
    transport: Box<dyn HttpTransport>,
) -> BackendResult<Box<dyn DecisionBackend>> {
    match settings.provider {
        ProviderKind::OpenAi => {
            if settings.openai.api_key.is_none() {
                return Err(BackendError::MissingCredentials(crate::config::ENV_OPENAI_API_KEY));
            }
            Ok(Box::new(OpenAiBackend::new(settings.openai.clone(), settings.max_tokens, transport)))
        }
        ProviderKind::Claude => {
            if settings.claude.api_key.is_none() {
                return Err(BackendError::MissingCredentials(crate::config::ENV_ANTHROPIC_API_KEY));
            }
            Ok(Box::new(ClaudeBackend::new(settings.claude.clone(), settings.max_tokens, transport)))
        }
    }
}

/// Why a native action could not be mapped onto the shared vocabulary
#[derive(Debug)]
pub(crate) enum NormalizeError {
    Unsupported(String),
    Malformed(String),
}

impl NormalizeError {
    pub(crate) fn into_backend_error(self, raw: Value) -> BackendError {
        match self {
            NormalizeError::Unsupported(name) => BackendError::UnsupportedAction { name, raw },
            NormalizeError::Malformed(reason) => BackendError::InvalidResponse(reason),
        }
    }
}

/// Read a coordinate value that may arrive as an integer, float or numeric string.
pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read an `[x, y]` pair.
pub(crate) fn coordinate(value: Option<&Value>) -> Option<(f64, f64)> {
    let pair = value?.as_array()?;
    match pair.as_slice() {
        [x, y] => Some((number(Some(x))?, number(Some(y))?)),
        _ => None,
    }
}
