//! droid-pilot - goal-directed Android UI agent.
//!
//! This crate provides:
//! - A turn controller that observes screenshots, asks a vision decision
//!   backend for the next action, and drives the device until the goal is met
//! - Stateless (OpenAI Responses) and stateful (Anthropic Messages) backends
//!   behind one decision contract
//! - A loop guard that breaks out of repeated ineffective actions
//! - Canvas-to-device coordinate translation
//! - An adb device port, plus a mock device for tests and dry runs
//! - Session directories with per-turn screenshots and records
//!
//! # Example
//!
//! ```rust,no_run
//! use droid_pilot::agent::{MemoryRecorder, TurnController};
//! use droid_pilot::backend::{CurlTransport, create_backend};
//! use droid_pilot::config::Config;
//! use droid_pilot::device::AdbDevice;
//! use droid_pilot::spec::load_spec;
//!
//! let config = Config::from_env();
//! let spec = load_spec(std::path::Path::new("spec.json")).unwrap();
//! let backend = create_backend(&config.backend, Box::new(CurlTransport::new(10))).unwrap();
//! let device = AdbDevice::connect("adb", None).unwrap();
//! let mut controller = TurnController::new(device, backend, MemoryRecorder::new(), config.agent.clone());
//! let result = controller.run(&spec);
//! println!("{}", result.summary());
//! ```

pub mod action;
pub mod agent;
pub mod backend;
pub mod config;
pub mod device;
pub mod guard;
pub mod logging;
pub mod runner;
pub mod script;
pub mod session;
pub mod spec;
pub mod translate;

// Re-export the core types
pub use action::{ActionDescriptor, DeviceCommand, Resolution, ScreenGeometry};
pub use agent::{AgentError, AgentState, CancelToken, MemoryRecorder, Outcome, RunRecorder, TurnController, TurnRecord};
pub use backend::{BackendError, DecisionBackend, ProviderKind, ProviderSession, create_backend};
pub use device::{AdbDevice, DeviceError, DevicePort, MockDevice, Screenshot};
pub use guard::{GuardDecision, LoopGuard};
pub use runner::{RunResult, StepResult};
pub use script::run_script;
pub use session::{Session, SessionRecorder, cleanup_old_sessions, list_sessions};
pub use spec::{SpecError, StepSpec, TestSpec, load_spec};
pub use translate::{TranslateError, translate};
