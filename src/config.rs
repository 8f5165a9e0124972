//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for droid-pilot, supporting:
//! - Environment variables for all configurable values
//! - Legacy variable names still accepted as fallbacks
//! - Builder-style overrides from CLI flags
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DROID_PILOT_PROVIDER` | Decision backend (`openai`, `claude`) | `openai` |
//! | `DROID_PILOT_MAX_TURNS` | Turn budget per step | `250` |
//! | `DROID_PILOT_MAX_TOTAL_TURNS` | Cumulative turn ceiling for a run | unset |
//! | `DROID_PILOT_ACTION_DELAY_MS` | Delay after each action (ms) | `1500` |
//! | `DROID_PILOT_REPETITION_WINDOW` | Loop guard window size | `10` |
//! | `DROID_PILOT_MAX_EXEC_ERRORS` | Consecutive device errors before a step fails | `3` |
//! | `DROID_PILOT_CANVAS` | Virtual canvas declared to the backend (`WxH`) | device resolution |
//! | `DROID_PILOT_OPENAI_ENDPOINT` | Responses API endpoint | `https://api.openai.com/v1/responses` |
//! | `DROID_PILOT_OPENAI_MODEL` | OpenAI computer-use model | `computer-use-preview` |
//! | `DROID_PILOT_CLAUDE_ENDPOINT` | Messages API endpoint | `https://api.anthropic.com/v1/messages` |
//! | `DROID_PILOT_CLAUDE_MODEL` | Claude model | `claude-sonnet-4-5` |
//! | `DROID_PILOT_MAX_TOKENS` | Max tokens per backend response | `4096` |
//! | `DROID_PILOT_CONNECT_TIMEOUT` | Backend connect timeout (s) | `10` |
//! | `DROID_PILOT_ADB` | adb binary | `adb` |
//! | `DROID_PILOT_SERIAL` | Target device serial | first device |
//! | `DROID_PILOT_REPORT_DIR` | Base directory for run sessions | `reports` |
//!
//! Credentials come from `OPENAI_API_KEY` and `ANTHROPIC_API_KEY`.

use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::action::Resolution;
use crate::backend::ProviderKind;
use crate::guard::{DEFAULT_REPETITION_WINDOW, MIN_REPETITION_WINDOW};

// ============================================================================
// Default Values
// ============================================================================

/// Default decision backend
pub const DEFAULT_PROVIDER: ProviderKind = ProviderKind::OpenAi;

/// Default turn budget per step
pub const DEFAULT_MAX_TURNS: u32 = 250;

/// Default cumulative turn ceiling across all steps of a run
pub const DEFAULT_MAX_TOTAL_TURNS: u32 = 1000;

/// Default delay between turns (milliseconds)
pub const DEFAULT_ACTION_DELAY_MS: u64 = 1500;

/// Default ceiling of consecutive device execution errors
pub const DEFAULT_MAX_EXEC_ERRORS: u32 = 3;

/// Default OpenAI Responses API endpoint
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/responses";

/// Default OpenAI computer-use model
pub const DEFAULT_OPENAI_MODEL: &str = "computer-use-preview";

/// Default Anthropic Messages API endpoint
pub const DEFAULT_CLAUDE_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Default Claude model
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5";

/// Default max tokens for backend responses
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Default backend connection timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Default adb binary
pub const DEFAULT_ADB: &str = "adb";

/// Default session base directory
pub const DEFAULT_REPORT_DIR: &str = "reports";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_PROVIDER: &str = "DROID_PILOT_PROVIDER";
pub const ENV_MAX_TURNS: &str = "DROID_PILOT_MAX_TURNS";
pub const ENV_MAX_TOTAL_TURNS: &str = "DROID_PILOT_MAX_TOTAL_TURNS";
pub const ENV_ACTION_DELAY_MS: &str = "DROID_PILOT_ACTION_DELAY_MS";
pub const ENV_REPETITION_WINDOW: &str = "DROID_PILOT_REPETITION_WINDOW";
pub const ENV_MAX_EXEC_ERRORS: &str = "DROID_PILOT_MAX_EXEC_ERRORS";
pub const ENV_CANVAS: &str = "DROID_PILOT_CANVAS";
pub const ENV_OPENAI_ENDPOINT: &str = "DROID_PILOT_OPENAI_ENDPOINT";
pub const ENV_OPENAI_MODEL: &str = "DROID_PILOT_OPENAI_MODEL";
pub const ENV_CLAUDE_ENDPOINT: &str = "DROID_PILOT_CLAUDE_ENDPOINT";
pub const ENV_CLAUDE_MODEL: &str = "DROID_PILOT_CLAUDE_MODEL";
pub const ENV_MAX_TOKENS: &str = "DROID_PILOT_MAX_TOKENS";
pub const ENV_CONNECT_TIMEOUT: &str = "DROID_PILOT_CONNECT_TIMEOUT";
pub const ENV_ADB: &str = "DROID_PILOT_ADB";
pub const ENV_SERIAL: &str = "DROID_PILOT_SERIAL";
pub const ENV_REPORT_DIR: &str = "DROID_PILOT_REPORT_DIR";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";

// ============================================================================
// Legacy Environment Variable Support
// ============================================================================

pub const ENV_PROVIDER_LEGACY: &str = "LLM_PROVIDER";
pub const ENV_MAX_TURNS_LEGACY: &str = "AGENT_MAX_STEPS";
pub const ENV_MAX_TURNS_LEGACY_OPENAI: &str = "OPENAI_AGENT_MAX_STEPS";
/// Seconds as a float, unlike `DROID_PILOT_ACTION_DELAY_MS`
pub const ENV_ACTION_DELAY_LEGACY: &str = "OPENAI_AGENT_WAIT_BETWEEN_ACTIONS";
pub const ENV_OPENAI_MODEL_LEGACY: &str = "OPENAI_COMPUTER_MODEL";
pub const ENV_CLAUDE_MODEL_LEGACY: &str = "CLAUDE_COMPUTER_MODEL";
pub const ENV_SERIAL_LEGACY: &str = "ANDROID_SERIAL";

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Centralized configuration for droid-pilot
#[derive(Debug, Clone)]
pub struct Config {
    /// Turn controller settings
    pub agent: AgentSettings,
    /// Decision backend settings
    pub backend: BackendSettings,
    /// Device port settings
    pub device: DeviceSettings,
    /// Session configuration
    pub session: SessionSettings,
}

/// Turn controller settings. Never hardcoded into the loop itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Turn budget per step
    pub max_turns: u32,
    /// Cumulative turn ceiling across all steps
    pub max_total_turns: Option<u32>,
    /// Settle time after each executed action
    pub action_delay: Duration,
    /// Loop guard window size
    pub repetition_window: usize,
    /// Consecutive execution errors tolerated before the step fails
    pub max_exec_errors: u32,
}

/// Endpoint, model and credential for one backend
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Decision backend settings
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    /// Which backend drives the loop
    pub provider: ProviderKind,
    /// Canvas declared to the backend; device resolution when `None`
    pub canvas: Option<Resolution>,
    pub openai: EndpointSettings,
    pub claude: EndpointSettings,
    /// Maximum tokens in a backend response
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
}

/// Device port settings
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// adb binary path or name
    pub adb: String,
    /// Device serial, first attached device when `None`
    pub serial: Option<String>,
}

/// Session-related settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            agent: AgentSettings::from_lookup(&lookup),
            backend: BackendSettings::from_lookup(&lookup),
            device: DeviceSettings::from_lookup(&lookup),
            session: SessionSettings::from_lookup(&lookup),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self::from_lookup(no_env)
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        self.agent.validate()?;
        if let Some(canvas) = self.backend.canvas {
            if canvas.is_degenerate() {
                return Err(ConfigError::Invalid {
                    key: ENV_CANVAS,
                    reason: format!("degenerate canvas {}", canvas),
                });
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AgentSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        let action_delay = parse::<u64>(lookup, ENV_ACTION_DELAY_MS)
            .map(Duration::from_millis)
            .or_else(|| {
                parse::<f64>(lookup, ENV_ACTION_DELAY_LEGACY)
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(Duration::from_secs_f64)
            })
            .unwrap_or(Duration::from_millis(DEFAULT_ACTION_DELAY_MS));

        Self {
            max_turns: parse(lookup, ENV_MAX_TURNS)
                .or_else(|| parse(lookup, ENV_MAX_TURNS_LEGACY))
                .or_else(|| parse(lookup, ENV_MAX_TURNS_LEGACY_OPENAI))
                .unwrap_or(DEFAULT_MAX_TURNS),
            max_total_turns: Some(parse(lookup, ENV_MAX_TOTAL_TURNS).unwrap_or(DEFAULT_MAX_TOTAL_TURNS)),
            action_delay,
            repetition_window: parse(lookup, ENV_REPETITION_WINDOW).unwrap_or(DEFAULT_REPETITION_WINDOW),
            max_exec_errors: parse(lookup, ENV_MAX_EXEC_ERRORS).unwrap_or(DEFAULT_MAX_EXEC_ERRORS),
        }
    }

    /// Agent settings with defaults
    pub fn defaults() -> Self {
        Self::from_lookup(&no_env)
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn max_total_turns(mut self, max_total_turns: Option<u32>) -> Self {
        self.max_total_turns = max_total_turns;
        self
    }

    pub fn action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn repetition_window(mut self, window: usize) -> Self {
        self.repetition_window = window;
        self
    }

    pub fn max_exec_errors(mut self, max: u32) -> Self {
        self.max_exec_errors = max;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_TURNS,
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_total_turns == Some(0) {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_TOTAL_TURNS,
                reason: "must be at least 1".to_string(),
            });
        }
        if self.repetition_window < MIN_REPETITION_WINDOW {
            return Err(ConfigError::Invalid {
                key: ENV_REPETITION_WINDOW,
                reason: format!("must be at least {}", MIN_REPETITION_WINDOW),
            });
        }
        if self.max_exec_errors == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_EXEC_ERRORS,
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl BackendSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        Self {
            provider: lookup(ENV_PROVIDER)
                .or_else(|| lookup(ENV_PROVIDER_LEGACY))
                .and_then(|s| ProviderKind::parse(&s))
                .unwrap_or(DEFAULT_PROVIDER),
            canvas: lookup(ENV_CANVAS).and_then(|s| {
                let canvas = Resolution::parse(&s);
                if canvas.is_none() {
                    warn!(value = %s, "ignoring malformed {}", ENV_CANVAS);
                }
                canvas
            }),
            openai: EndpointSettings {
                endpoint: lookup(ENV_OPENAI_ENDPOINT).unwrap_or_else(|| DEFAULT_OPENAI_ENDPOINT.to_string()),
                model: lookup(ENV_OPENAI_MODEL)
                    .or_else(|| lookup(ENV_OPENAI_MODEL_LEGACY))
                    .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                api_key: lookup(ENV_OPENAI_API_KEY).filter(|k| !k.is_empty()),
            },
            claude: EndpointSettings {
                endpoint: lookup(ENV_CLAUDE_ENDPOINT).unwrap_or_else(|| DEFAULT_CLAUDE_ENDPOINT.to_string()),
                model: lookup(ENV_CLAUDE_MODEL)
                    .or_else(|| lookup(ENV_CLAUDE_MODEL_LEGACY))
                    .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
                api_key: lookup(ENV_ANTHROPIC_API_KEY).filter(|k| !k.is_empty()),
            },
            max_tokens: parse(lookup, ENV_MAX_TOKENS).unwrap_or(DEFAULT_MAX_TOKENS),
            connect_timeout: parse(lookup, ENV_CONNECT_TIMEOUT).unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    /// Backend settings with defaults
    pub fn defaults() -> Self {
        Self::from_lookup(&no_env)
    }
}

impl DeviceSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        Self {
            adb: lookup(ENV_ADB).unwrap_or_else(|| DEFAULT_ADB.to_string()),
            serial: lookup(ENV_SERIAL)
                .or_else(|| lookup(ENV_SERIAL_LEGACY))
                .filter(|s| !s.is_empty()),
        }
    }
}

impl SessionSettings {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: &F) -> Self {
        Self {
            base_dir: lookup(ENV_REPORT_DIR).unwrap_or_else(|| DEFAULT_REPORT_DIR.to_string()),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn no_env(_: &str) -> Option<String> {
    None
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Parse a `WxH` canvas given on the command line
pub fn parse_canvas(value: &str) -> ConfigResult<Resolution> {
    Resolution::parse(value)
        .filter(|r| !r.is_degenerate())
        .ok_or_else(|| ConfigError::Invalid {
            key: ENV_CANVAS,
            reason: format!("'{}' is not a WxH resolution", value),
        })
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    Config::from_env().session.base_dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.agent.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(config.agent.max_total_turns, Some(DEFAULT_MAX_TOTAL_TURNS));
        assert_eq!(config.agent.repetition_window, DEFAULT_REPETITION_WINDOW);
        assert_eq!(config.agent.action_delay, Duration::from_millis(DEFAULT_ACTION_DELAY_MS));
        assert_eq!(config.backend.provider, ProviderKind::OpenAi);
        assert_eq!(config.backend.openai.endpoint, DEFAULT_OPENAI_ENDPOINT);
        assert_eq!(config.backend.claude.model, DEFAULT_CLAUDE_MODEL);
        assert_eq!(config.backend.canvas, None);
        assert_eq!(config.session.base_dir, DEFAULT_REPORT_DIR);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_PROVIDER, "claude"),
            (ENV_MAX_TURNS, "40"),
            (ENV_ACTION_DELAY_MS, "250"),
            (ENV_CANVAS, "1024x768"),
            (ENV_ANTHROPIC_API_KEY, "sk-test"),
            (ENV_SERIAL, "emulator-5554"),
        ]));
        assert_eq!(config.backend.provider, ProviderKind::Claude);
        assert_eq!(config.agent.max_turns, 40);
        assert_eq!(config.agent.action_delay, Duration::from_millis(250));
        assert_eq!(config.backend.canvas, Some(Resolution::new(1024, 768)));
        assert_eq!(config.backend.claude.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.device.serial.as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn test_legacy_variables() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_PROVIDER_LEGACY, "Claude"),
            (ENV_MAX_TURNS_LEGACY, "12"),
            (ENV_ACTION_DELAY_LEGACY, "0.5"),
            (ENV_OPENAI_MODEL_LEGACY, "my-model"),
        ]));
        assert_eq!(config.backend.provider, ProviderKind::Claude);
        assert_eq!(config.agent.max_turns, 12);
        assert_eq!(config.agent.action_delay, Duration::from_millis(500));
        assert_eq!(config.backend.openai.model, "my-model");
    }

    #[test]
    fn test_primary_beats_legacy() {
        let config = Config::from_lookup(lookup_from(&[(ENV_MAX_TURNS, "5"), (ENV_MAX_TURNS_LEGACY, "9")]));
        assert_eq!(config.agent.max_turns, 5);
    }

    #[test]
    fn test_validation() {
        assert!(AgentSettings::defaults().max_turns(0).validate().is_err());
        assert!(AgentSettings::defaults().repetition_window(1).validate().is_err());
        assert!(AgentSettings::defaults().max_exec_errors(0).validate().is_err());
        assert!(AgentSettings::defaults().max_total_turns(Some(0)).validate().is_err());
        assert!(AgentSettings::defaults().max_total_turns(Some(3)).validate().is_ok());
    }

    #[test]
    fn test_canvas_parsing_and_validation() {
        assert_eq!(parse_canvas("720x1280").unwrap(), Resolution::new(720, 1280));
        assert!(parse_canvas("720").is_err());
        assert!(parse_canvas("0x1280").is_err());

        let config = Config::from_lookup(lookup_from(&[(ENV_CANVAS, "0x100")]));
        assert!(config.validate().is_err());
        let config = Config::from_lookup(lookup_from(&[(ENV_CANVAS, "bogus")]));
        assert_eq!(config.backend.canvas, None);
        assert!(config.validate().is_ok());
    }
}
