//! Device port backed by the `adb` command-line tool.
//!
//! Every operation is a one-shot `adb` subprocess. Output parsing lives in
//! small pure functions so it can be tested without a device attached.

use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DeviceError, DevicePort, DeviceResult, Screenshot};
use crate::action::{DeviceCommand, Resolution, keycode};

/// Used when `wm size` output cannot be parsed
pub const FALLBACK_RESOLUTION: Resolution = Resolution::new(1080, 2400);

/// A device or emulator reachable through adb.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: String,
    serial: Option<String>,
}

impl AdbDevice {
    /// Use an explicit serial, or let adb pick when there is exactly one device.
    pub fn new(adb: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            adb: adb.into(),
            serial,
        }
    }

    /// Resolve the target device: the given serial, else the first online
    /// emulator, else the first online device.
    pub fn connect(adb: impl Into<String>, serial: Option<String>) -> DeviceResult<Self> {
        let adb = adb.into();
        if serial.is_some() {
            return Ok(Self::new(adb, serial));
        }

        let output = Command::new(&adb).arg("devices").output().map_err(|e| {
            DeviceError::Unreachable(format!("failed to run '{} devices': {}", adb, e))
        })?;
        let devices = parse_devices(&String::from_utf8_lossy(&output.stdout));
        let chosen = pick_serial(&devices)
            .ok_or_else(|| DeviceError::Unreachable("no online device or emulator".to_string()))?;
        debug!(serial = %chosen, "Selected device");
        Ok(Self::new(adb, Some(chosen)))
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd
    }

    /// Run adb with `args`, failing on a non-zero exit.
    fn run(&self, name: &str, args: &[&str]) -> DeviceResult<Output> {
        debug!(command = name, ?args, "adb");
        let output = self.command().args(args).output()?;
        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command: name.to_string(),
                message: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output)
    }

    fn shell(&self, name: &str, args: &[&str]) -> DeviceResult<Output> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run(name, &full)
    }

    fn rotation_quarter_turns(&self) -> u8 {
        match self.shell("dumpsys", &["dumpsys", "input"]) {
            Ok(output) => parse_surface_orientation(&String::from_utf8_lossy(&output.stdout)).unwrap_or(0),
            Err(e) => {
                debug!("Could not read display orientation: {}", e);
                0
            }
        }
    }
}

impl DevicePort for AdbDevice {
    fn capture_screenshot(&mut self) -> DeviceResult<Screenshot> {
        let output = self
            .run("screencap", &["exec-out", "screencap", "-p"])
            .map_err(|e| DeviceError::Capture(e.to_string()))?;
        if output.stdout.is_empty() {
            return Err(DeviceError::Capture("screencap returned no data".to_string()));
        }
        Screenshot::from_png(output.stdout)
    }

    fn screen_size(&mut self) -> DeviceResult<Resolution> {
        let output = self.shell("wm size", &["wm", "size"])?;
        let size = match parse_wm_size(&String::from_utf8_lossy(&output.stdout)) {
            Some(size) => size,
            None => {
                warn!("Unrecognized 'wm size' output, assuming {}", FALLBACK_RESOLUTION);
                FALLBACK_RESOLUTION
            }
        };
        // wm size reports the natural (portrait) orientation
        if self.rotation_quarter_turns() % 2 == 1 {
            Ok(size.swapped())
        } else {
            Ok(size)
        }
    }

    fn execute(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        let name = command.name();
        match command {
            DeviceCommand::Tap { x, y } => {
                self.shell(name, &["input", "tap", &x.to_string(), &y.to_string()])?;
            }
            DeviceCommand::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                self.shell(
                    name,
                    &[
                        "input",
                        "swipe",
                        &x1.to_string(),
                        &y1.to_string(),
                        &x2.to_string(),
                        &y2.to_string(),
                        &duration_ms.to_string(),
                    ],
                )?;
            }
            DeviceCommand::InputText { text } => {
                let sanitized = sanitize_input_text(text);
                if !sanitized.is_empty() {
                    self.shell(name, &["input", "text", &sanitized])?;
                }
            }
            DeviceCommand::Keyevent { code } => {
                self.shell(name, &["input", "keyevent", &code.to_string()])?;
            }
            DeviceCommand::Back => {
                self.shell(name, &["input", "keyevent", &keycode::BACK.to_string()])?;
            }
            DeviceCommand::Home => {
                self.shell(name, &["input", "keyevent", &keycode::HOME.to_string()])?;
            }
            DeviceCommand::Wait { seconds } if seconds.is_finite() && *seconds > 0.0 => {
                thread::sleep(Duration::from_secs_f64(*seconds));
            }
            DeviceCommand::Wait { .. } => {}
            DeviceCommand::Launch { package, activity } => match activity {
                Some(activity) => {
                    let component = component_name(package, activity);
                    self.shell(name, &["am", "start", "-n", &component])?;
                }
                None => {
                    self.shell(
                        name,
                        &["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"],
                    )?;
                }
            },
            DeviceCommand::Stop { package } => {
                self.shell(name, &["am", "force-stop", package])?;
            }
            DeviceCommand::Install { apk } => {
                let apk = apk.to_string_lossy();
                self.run(name, &["install", "-r", "-t", &apk])?;
            }
            DeviceCommand::Uninstall { package } => {
                self.run(name, &["uninstall", package])?;
            }
            DeviceCommand::Screenshot => {
                self.capture_screenshot()?;
            }
        }
        Ok(())
    }

    fn is_installed(&mut self, package: &str) -> DeviceResult<bool> {
        let output = self.shell("pm list", &["pm", "list", "packages", package])?;
        Ok(package_listed(&String::from_utf8_lossy(&output.stdout), package))
    }

    fn source_type(&self) -> &str {
        "adb"
    }
}

/// Parse `adb devices` output into `(serial, state)` pairs.
pub fn parse_devices(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .collect()
}

/// First online emulator, else first online device.
pub fn pick_serial(devices: &[(String, String)]) -> Option<String> {
    let online = || devices.iter().filter(|(_, state)| state == "device");
    online()
        .find(|(serial, _)| serial.starts_with("emulator-"))
        .or_else(|| online().next())
        .map(|(serial, _)| serial.clone())
}

/// Parse `wm size` output. An override size wins over the physical one.
pub fn parse_wm_size(output: &str) -> Option<Resolution> {
    let mut physical = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let Some(size) = Resolution::parse(value) else {
            continue;
        };
        if label.contains("Override") {
            return Some(size);
        }
        physical.get_or_insert(size);
    }
    physical
}

/// Parse the `SurfaceOrientation` value (quarter turns) from `dumpsys input`.
pub fn parse_surface_orientation(output: &str) -> Option<u8> {
    output
        .lines()
        .find(|line| line.contains("SurfaceOrientation"))
        .and_then(|line| line.split_once(':'))
        .and_then(|(_, value)| value.trim().parse::<u8>().ok())
        .filter(|turns| *turns < 4)
}

/// Make text safe for `adb shell input text`.
///
/// Spaces become `%s`; characters outside a conservative safe set become `_`.
pub fn sanitize_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            c if c.is_ascii_alphanumeric() || "_%@.,:-".contains(c) => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

/// `package/activity`, unless the activity is already a full component.
pub fn component_name(package: &str, activity: &str) -> String {
    if activity.contains('/') {
        activity.to_string()
    } else {
        format!("{}/{}", package, activity)
    }
}

fn package_listed(output: &str, package: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .any(|listed| listed == package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_devices() {
        let output = "List of devices attached\n\
                      * daemon started successfully\n\
                      R58M123 device\n\
                      emulator-5554\tdevice\n\
                      emulator-5556\toffline\n\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(pick_serial(&devices).as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn test_pick_serial_falls_back_to_physical() {
        let devices = vec![
            ("emulator-5554".to_string(), "offline".to_string()),
            ("R58M123".to_string(), "device".to_string()),
        ];
        assert_eq!(pick_serial(&devices).as_deref(), Some("R58M123"));
        assert_eq!(pick_serial(&[]), None);
    }

    #[test]
    fn test_parse_wm_size() {
        assert_eq!(parse_wm_size("Physical size: 1080x2424\n"), Some(Resolution::new(1080, 2424)));
        assert_eq!(
            parse_wm_size("Physical size: 1440x3120\nOverride size: 1080x2340\n"),
            Some(Resolution::new(1080, 2340))
        );
        assert_eq!(parse_wm_size("error: no devices"), None);
    }

    #[test]
    fn test_parse_surface_orientation() {
        let dumpsys = "  Viewport:\n    SurfaceOrientation: 1\n    SurfaceWidth: 2400\n";
        assert_eq!(parse_surface_orientation(dumpsys), Some(1));
        assert_eq!(parse_surface_orientation("SurfaceOrientation: 7"), None);
        assert_eq!(parse_surface_orientation("nothing here"), None);
    }

    #[test]
    fn test_sanitize_input_text() {
        assert_eq!(sanitize_input_text("hello world"), "hello%sworld");
        assert_eq!(sanitize_input_text("a@b.com"), "a@b.com");
        assert_eq!(sanitize_input_text("it's \"ok\"&"), "it_s%s_ok__");
    }

    #[test]
    fn test_component_name() {
        assert_eq!(component_name("com.app", ".Main"), "com.app/.Main");
        assert_eq!(component_name("com.app", "com.app/.Main"), "com.app/.Main");
    }

    #[test]
    fn test_package_listed_is_exact() {
        let output = "package:com.example.app\npackage:com.example.app.debug\n";
        assert!(package_listed(output, "com.example.app"));
        assert!(!package_listed(output, "com.example"));
    }
}
