//! Session management for run reports.
//!
//! Every run gets its own directory under the report base:
//! - `.session.json`: session metadata
//! - `screenshots/`: one PNG per turn (tap marker drawn) and per pre-step
//! - `turns.jsonl`: one JSON turn record per line
//! - `responses_raw/`: raw backend response per turn
//! - `summary.json`: the final run result

use image::{Rgb, RgbImage};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use crate::action::DeviceCommand;
use crate::agent::{RecordResult, RunRecorder, TurnRecord};
use crate::device::Screenshot;
use crate::runner::RunResult;

/// Marker colour drawn where a tap landed
const MARKER_COLOR: [u8; 3] = [255, 0, 0];

/// Half-size of the tap marker in pixels
const MARKER_RADIUS: i64 = 12;

/// A run report directory
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after the session is dropped
    pub keep: bool,
}

impl Session {
    /// Create a session named after `name` under `base`
    pub fn with_name(base: impl AsRef<Path>, name: &str) -> Self {
        let id = format!("{}_{}", sanitize_name(name), generate_timestamp_suffix());
        let dir = base.as_ref().join(&id);
        Self { id, dir, keep: true }
    }

    /// Create a session in a specific directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("session_{}", generate_timestamp_suffix()));
        Self { id, dir, keep: true }
    }

    /// Set whether to keep files after the session is dropped
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the directory tree and write session metadata
    pub fn init(&self, metadata: serde_json::Value) -> std::io::Result<()> {
        fs::create_dir_all(self.screenshots_dir())?;
        fs::create_dir_all(self.responses_dir())?;

        let mut metadata = metadata;
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("id".to_string(), self.id.clone().into());
            obj.insert("created".to_string(), chrono::Utc::now().to_rfc3339().into());
        }
        fs::write(self.dir.join(".session.json"), serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.dir.join("screenshots")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.dir.join("responses_raw")
    }

    pub fn turns_path(&self) -> PathBuf {
        self.dir.join("turns.jsonl")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.json")
    }

    /// Path of a pre-step screenshot
    pub fn pre_step_path(&self, index: usize) -> PathBuf {
        self.screenshots_dir().join(format!("pre_step_{:02}.png", index))
    }

    /// List all PNG files in the session
    pub fn list_captures(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut captures = Vec::new();
        let dir = self.screenshots_dir();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "png").unwrap_or(false) {
                    captures.push(path);
                }
            }
        }
        captures.sort();
        Ok(captures)
    }

    /// Remove the session directory unless it is kept
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// [`RunRecorder`] that writes a [`Session`] directory.
#[derive(Debug)]
pub struct SessionRecorder {
    session: Session,
}

impl SessionRecorder {
    /// Create and initialise the session directory.
    pub fn create(session: Session, metadata: serde_json::Value) -> std::io::Result<Self> {
        session.init(metadata)?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn append_turn(&self, record: &TurnRecord) -> RecordResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session.turns_path())?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }
}

impl RunRecorder for SessionRecorder {
    fn record_pre_step(
        &mut self,
        index: usize,
        command: &DeviceCommand,
        screenshot: Option<&Screenshot>,
    ) -> RecordResult<()> {
        if let Some(shot) = screenshot {
            let path = self.session.pre_step_path(index);
            fs::write(&path, &shot.png)?;
            debug!(index, command = command.name(), path = %path.display(), "pre-step screenshot saved");
        }
        Ok(())
    }

    fn record_turn(&mut self, record: &TurnRecord, screenshot: &Screenshot) -> RecordResult<()> {
        let png = match record.command.as_ref().and_then(|c| c.marker()) {
            Some(point) => mark_point(&screenshot.png, point)?,
            None => screenshot.png.clone(),
        };
        fs::write(self.session.screenshots_dir().join(&record.screenshot), png)?;

        if let Some(raw) = &record.raw_response {
            let path = self.session.responses_dir().join(format!("turn_{:03}.json", record.turn));
            fs::write(path, serde_json::to_string_pretty(raw)?)?;
        }
        self.append_turn(record)
    }

    fn finish(&mut self, result: &RunResult) -> RecordResult<()> {
        fs::write(self.session.summary_path(), serde_json::to_string_pretty(result)?)?;
        Ok(())
    }
}

/// Draw a crosshair at `point` and return the re-encoded PNG.
pub fn mark_point(png: &[u8], point: (u32, u32)) -> RecordResult<Vec<u8>> {
    let mut img: RgbImage = image::load_from_memory(png)?.to_rgb8();
    let (cx, cy) = (point.0 as i64, point.1 as i64);
    let (w, h) = (img.width() as i64, img.height() as i64);

    for d in -MARKER_RADIUS..=MARKER_RADIUS {
        for t in -1..=1 {
            for (x, y) in [(cx + d, cy + t), (cx + t, cy + d)] {
                if (0..w).contains(&x) && (0..h).contains(&y) {
                    img.put_pixel(x as u32, y as u32, Rgb(MARKER_COLOR));
                }
            }
        }
    }

    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(out)
}

/// Generate a timestamp suffix
fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Remove sessions under `base` older than `max_age`
pub fn cleanup_old_sessions(base: impl AsRef<Path>, max_age: std::time::Duration) -> std::io::Result<usize> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;

    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) && fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

/// List all sessions under `base`
pub fn list_sessions(base: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}
