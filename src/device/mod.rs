//! Device control port: the boundary between the agent loop and a device.
//!
//! The loop only needs two things from a device: a screenshot, and the
//! execution of a [`DeviceCommand`]. Screenshot capture is safe to retry;
//! command execution has real side effects and is never retried by the core.
//!
//! Implementations:
//! - [`AdbDevice`] drives a real device or emulator through `adb`
//! - [`MockDevice`] renders a synthetic screen for tests and dry runs

pub mod adb;
pub mod mock;

use chrono::{DateTime, Utc};
use std::io::Cursor;
use thiserror::Error;

use crate::action::{DeviceCommand, Resolution};

pub use adb::AdbDevice;
pub use mock::{MockDevice, MockFramebuffer};

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while talking to a device
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device could be reached
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// A device command exited unsuccessfully
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Screenshot capture failed
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// A PNG screenshot and its pixel size.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// PNG-encoded image data
    pub png: Vec<u8>,
    /// Pixel size of the image
    pub size: Resolution,
    /// When the screenshot was taken
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    /// Wrap PNG bytes, reading the dimensions from the image header.
    pub fn from_png(png: Vec<u8>) -> DeviceResult<Self> {
        let (width, height) = image::io::Reader::new(Cursor::new(&png))
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(Self {
            png,
            size: Resolution::new(width, height),
            captured_at: Utc::now(),
        })
    }
}

/// A device the agent can observe and drive.
///
/// A port is exclusively owned by one run; it is never shared between
/// concurrent controllers.
pub trait DevicePort: Send {
    /// Take a screenshot of the current screen
    fn capture_screenshot(&mut self) -> DeviceResult<Screenshot>;

    /// Current screen size in pixels, taking rotation into account
    fn screen_size(&mut self) -> DeviceResult<Resolution>;

    /// Execute a device-space command
    fn execute(&mut self, command: &DeviceCommand) -> DeviceResult<()>;

    /// Whether a package is installed
    fn is_installed(&mut self, package: &str) -> DeviceResult<bool>;

    /// Source identifier for logs and records (e.g. "adb", "mock")
    fn source_type(&self) -> &str;
}

impl<T: DevicePort + ?Sized> DevicePort for Box<T> {
    fn capture_screenshot(&mut self) -> DeviceResult<Screenshot> {
        (**self).capture_screenshot()
    }

    fn screen_size(&mut self) -> DeviceResult<Resolution> {
        (**self).screen_size()
    }

    fn execute(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        (**self).execute(command)
    }

    fn is_installed(&mut self, package: &str) -> DeviceResult<bool> {
        (**self).is_installed(package)
    }

    fn source_type(&self) -> &str {
        (**self).source_type()
    }
}
