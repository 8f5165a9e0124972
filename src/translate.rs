//! Action translation from a backend's virtual canvas into device pixels.
//!
//! Coordinates are rescaled independently per axis:
//! `device_px = canvas_coord * device_dimension / canvas_dimension`.
//! Non-coordinate actions pass through unchanged. `end_test` is never
//! translated; the turn controller intercepts it first.

use thiserror::Error;

use crate::action::{ActionDescriptor, DeviceCommand, Resolution, ScreenGeometry};

/// Result type for translation
pub type TranslateResult<T> = Result<T, TranslateError>;

/// Reasons an action could not be mapped to a device command.
///
/// All of these are turn-level annotations; the turn becomes a no-op.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslateError {
    #[error("action '{0}' has no device command")]
    Unsupported(&'static str),

    #[error("non-finite coordinate in {0}")]
    NonFinite(String),

    #[error("coordinate ({x}, {y}) lies outside canvas {canvas}")]
    OutOfCanvas { x: f64, y: f64, canvas: Resolution },

    #[error("degenerate geometry (canvas {canvas}, device {device})")]
    DegenerateGeometry { canvas: Resolution, device: Resolution },

    #[error("invalid wait duration {0}")]
    InvalidWait(f64),
}

/// Translate a canvas-space action into a device-space command.
pub fn translate(action: &ActionDescriptor, geometry: &ScreenGeometry) -> TranslateResult<DeviceCommand> {
    match action {
        ActionDescriptor::Tap { x, y } => {
            let (x, y) = scale_point(*x, *y, geometry)?;
            Ok(DeviceCommand::Tap { x, y })
        }
        ActionDescriptor::Swipe { x1, y1, x2, y2, duration_ms } => {
            let (x1, y1) = scale_point(*x1, *y1, geometry)?;
            let (x2, y2) = scale_point(*x2, *y2, geometry)?;
            Ok(DeviceCommand::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms: *duration_ms,
            })
        }
        ActionDescriptor::TypeText { text } => Ok(DeviceCommand::InputText { text: text.clone() }),
        ActionDescriptor::KeyEvent { code } => Ok(DeviceCommand::Keyevent { code: *code }),
        ActionDescriptor::Wait { seconds } => {
            if !seconds.is_finite() || *seconds < 0.0 {
                return Err(TranslateError::InvalidWait(*seconds));
            }
            Ok(DeviceCommand::Wait { seconds: *seconds })
        }
        ActionDescriptor::EndTest { .. } => Err(TranslateError::Unsupported(action.kind())),
    }
}

/// Rescale one canvas point into device pixels.
pub fn scale_point(x: f64, y: f64, geometry: &ScreenGeometry) -> TranslateResult<(u32, u32)> {
    let ScreenGeometry { canvas, device } = *geometry;
    if canvas.is_degenerate() || device.is_degenerate() {
        return Err(TranslateError::DegenerateGeometry { canvas, device });
    }
    if !x.is_finite() || !y.is_finite() {
        return Err(TranslateError::NonFinite(format!("({}, {})", x, y)));
    }
    if x < 0.0 || y < 0.0 || x > canvas.width as f64 || y > canvas.height as f64 {
        return Err(TranslateError::OutOfCanvas { x, y, canvas });
    }

    Ok((
        scale_axis(x, canvas.width, device.width),
        scale_axis(y, canvas.height, device.height),
    ))
}

fn scale_axis(value: f64, canvas_dim: u32, device_dim: u32) -> u32 {
    // multiply first so corners map exactly
    let scaled = (value * device_dim as f64 / canvas_dim as f64).round();
    scaled.clamp(0.0, device_dim as f64) as u32
}
