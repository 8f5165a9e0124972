//! Action vocabulary shared by the decision backends, the loop guard, the
//! translator and the device port.
//!
//! Two coordinate spaces exist and are never mixed implicitly:
//! - the *virtual canvas* a decision backend declares and reasons in
//!   ([`ActionDescriptor`] coordinates), and
//! - the *device* pixel space ([`DeviceCommand`] coordinates).
//!
//! [`ScreenGeometry`] carries both together through the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default swipe duration used when a backend or pre-step omits one.
pub const DEFAULT_SWIPE_MS: u32 = 300;

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a `WxH` string (e.g. `1080x2400`).
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let (w, h) = lower.split_once('x')?;
        let width = w.trim().parse().ok()?;
        let height = h.trim().parse().ok()?;
        Some(Self::new(width, height))
    }

    /// True when either dimension is zero.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Same resolution rotated by 90 degrees.
    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The backend's declared canvas paired with the device's pixel resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    /// Coordinate space the decision backend uses
    pub canvas: Resolution,
    /// Physical device pixel space (after rotation)
    pub device: Resolution,
}

impl ScreenGeometry {
    pub fn new(canvas: Resolution, device: Resolution) -> Self {
        Self { canvas, device }
    }

    /// Geometry where the backend works directly in device pixels.
    pub fn identity(device: Resolution) -> Self {
        Self::new(device, device)
    }
}

/// A normalized action proposed by a decision backend.
///
/// All coordinates are in the backend's declared virtual canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDescriptor {
    Tap {
        x: f64,
        y: f64,
    },
    Swipe {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        duration_ms: u32,
    },
    TypeText {
        text: String,
    },
    KeyEvent {
        code: u32,
    },
    Wait {
        seconds: f64,
    },
    EndTest {
        success: bool,
        reason: String,
    },
}

impl ActionDescriptor {
    /// The recovery action substituted by the loop guard.
    pub fn back() -> Self {
        ActionDescriptor::KeyEvent { code: keycode::BACK }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionDescriptor::Tap { .. } => "tap",
            ActionDescriptor::Swipe { .. } => "swipe",
            ActionDescriptor::TypeText { .. } => "type_text",
            ActionDescriptor::KeyEvent { .. } => "key_event",
            ActionDescriptor::Wait { .. } => "wait",
            ActionDescriptor::EndTest { .. } => "end_test",
        }
    }

    /// Tap point, if this action has a single target point.
    pub fn tap_point(&self) -> Option<(f64, f64)> {
        match self {
            ActionDescriptor::Tap { x, y } => Some((*x, *y)),
            _ => None,
        }
    }
}

impl fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionDescriptor::Tap { x, y } => write!(f, "tap({}, {})", x, y),
            ActionDescriptor::Swipe { x1, y1, x2, y2, duration_ms } => {
                write!(f, "swipe({}, {} -> {}, {}, {}ms)", x1, y1, x2, y2, duration_ms)
            }
            ActionDescriptor::TypeText { text } => write!(f, "type_text({:?})", text),
            ActionDescriptor::KeyEvent { code } => write!(f, "key_event({})", code),
            ActionDescriptor::Wait { seconds } => write!(f, "wait({}s)", seconds),
            ActionDescriptor::EndTest { success, reason } => {
                write!(f, "end_test(success={}, reason={:?})", success, reason)
            }
        }
    }
}

/// A command in device pixel space, executed by a device port.
///
/// Pre-steps in a test spec are parsed directly into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceCommand {
    Tap {
        x: u32,
        y: u32,
    },
    Swipe {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u32,
    },
    InputText {
        text: String,
    },
    Keyevent {
        code: u32,
    },
    Wait {
        seconds: f64,
    },
    Back,
    Home,
    Launch {
        package: String,
        activity: Option<String>,
    },
    Stop {
        package: String,
    },
    Install {
        apk: PathBuf,
    },
    Uninstall {
        package: String,
    },
    /// Observation only; the caller records a screenshot after it
    Screenshot,
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Tap { .. } => "tap",
            DeviceCommand::Swipe { .. } => "swipe",
            DeviceCommand::InputText { .. } => "input_text",
            DeviceCommand::Keyevent { .. } => "keyevent",
            DeviceCommand::Wait { .. } => "wait",
            DeviceCommand::Back => "back",
            DeviceCommand::Home => "home",
            DeviceCommand::Launch { .. } => "launch",
            DeviceCommand::Stop { .. } => "stop",
            DeviceCommand::Install { .. } => "install",
            DeviceCommand::Uninstall { .. } => "uninstall",
            DeviceCommand::Screenshot => "screenshot",
        }
    }

    /// Point to mark on the recorded screenshot.
    pub fn marker(&self) -> Option<(u32, u32)> {
        match self {
            DeviceCommand::Tap { x, y } => Some((*x, *y)),
            DeviceCommand::Swipe { x1, y1, .. } => Some((*x1, *y1)),
            _ => None,
        }
    }
}

/// Android key codes used by the agent.
pub mod keycode {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const DPAD_UP: u32 = 19;
    pub const DPAD_DOWN: u32 = 20;
    pub const DPAD_LEFT: u32 = 21;
    pub const DPAD_RIGHT: u32 = 22;
    pub const VOLUME_UP: u32 = 24;
    pub const VOLUME_DOWN: u32 = 25;
    pub const POWER: u32 = 26;
    pub const TAB: u32 = 61;
    pub const SPACE: u32 = 62;
    pub const ENTER: u32 = 66;
    pub const DEL: u32 = 67;
    pub const MENU: u32 = 82;
    pub const SEARCH: u32 = 84;
    pub const PAGE_UP: u32 = 92;
    pub const PAGE_DOWN: u32 = 93;
    pub const FORWARD_DEL: u32 = 112;
    pub const MOVE_HOME: u32 = 122;
    pub const MOVE_END: u32 = 123;
    pub const APP_SWITCH: u32 = 187;

    const KEYCODE_0: u32 = 7;
    const KEYCODE_A: u32 = 29;

    /// Resolve a key name (xdotool, browser or Android style) or a numeric
    /// string into an Android key code.
    pub fn from_name(name: &str) -> Option<u32> {
        let trimmed = name.trim();
        if let Ok(code) = trimmed.parse::<u32>() {
            return Some(code);
        }

        let lower = trimmed.to_lowercase().replace(['-', ' '], "_");
        let lower = lower.strip_prefix("keycode_").unwrap_or(&lower);

        let code = match lower {
            "home" => HOME,
            "back" | "escape" | "esc" => BACK,
            "up" | "arrowup" | "dpad_up" => DPAD_UP,
            "down" | "arrowdown" | "dpad_down" => DPAD_DOWN,
            "left" | "arrowleft" | "dpad_left" => DPAD_LEFT,
            "right" | "arrowright" | "dpad_right" => DPAD_RIGHT,
            "volume_up" | "xf86audioraisevolume" => VOLUME_UP,
            "volume_down" | "xf86audiolowervolume" => VOLUME_DOWN,
            "power" => POWER,
            "tab" => TAB,
            "space" => SPACE,
            "enter" | "return" | "kp_enter" => ENTER,
            "backspace" | "del" => DEL,
            "delete" | "forward_del" => FORWARD_DEL,
            "menu" => MENU,
            "search" => SEARCH,
            "page_up" | "pageup" | "prior" => PAGE_UP,
            "page_down" | "pagedown" | "next" => PAGE_DOWN,
            "move_home" => MOVE_HOME,
            "end" | "move_end" => MOVE_END,
            "app_switch" => APP_SWITCH,
            other => return single_char_code(other),
        };
        Some(code)
    }

    fn single_char_code(s: &str) -> Option<u32> {
        let mut chars = s.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        match c {
            '0'..='9' => Some(KEYCODE_0 + (c as u32 - '0' as u32)),
            'a'..='z' => Some(KEYCODE_A + (c as u32 - 'a' as u32)),
            _ => None,
        }
    }
}
