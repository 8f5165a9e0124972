pub mod load;
pub mod types;

pub use load::{TIMESTAMP_PLACEHOLDER, load_spec, parse_command, parse_spec, validate_for_agent};
pub use types::{InstallConfig, SpecError, SpecResult, StepSpec, TestSpec};
