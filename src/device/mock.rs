//! Synthetic device for tests and dry runs.
//!
//! [`MockDevice`] renders its screen into a [`MockFramebuffer`], records
//! every command it is asked to execute, and can be told to fail.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use std::collections::HashSet;
use std::io::Cursor;

use super::{DeviceError, DevicePort, DeviceResult, Screenshot};
use crate::action::{DeviceCommand, Resolution};

const BACKGROUND: [u8; 3] = [245, 245, 245];
const STATUS_BAR: [u8; 3] = [33, 33, 33];
const TEXT: [u8; 3] = [20, 20, 20];
const TOUCH: [u8; 3] = [230, 40, 40];

/// A virtual framebuffer for programmatic drawing
///
/// - `fill()` - Fill entire buffer with a color
/// - `draw_rect()` - Draw a filled rectangle
/// - `draw_text()` - Draw text using font8x8 glyphs
/// - `get_pixel()` / `set_pixel()` - Direct pixel access
#[derive(Debug, Clone)]
pub struct MockFramebuffer {
    width: u32,
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
}

impl MockFramebuffer {
    /// Create a new framebuffer with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u8; (width * height * 3) as usize],
        }
    }

    /// Create a framebuffer initialized to a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut fb = Self::new(width, height);
        fb.fill(color);
        fb
    }

    /// Load a framebuffer from PNG image bytes
    pub fn from_png_bytes(data: &[u8]) -> DeviceResult<Self> {
        let rgb = image::load_from_memory(data)?.to_rgb8();
        Ok(Self {
            width: rgb.width(),
            height: rgb.height(),
            buffer: rgb.into_raw(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle, clipped to the buffer
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..y.saturating_add(h).min(self.height) {
            for px in x..x.saturating_add(w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text using font8x8 glyphs
    ///
    /// Each character is 8x8 pixels. Text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width {
                break;
            }
            self.draw_char(cursor_x, y, ch, fg, bg);
            cursor_x += 8;
        }
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, fg: [u8; 3], bg: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as u32;
            for bit in 0..8 {
                // font8x8 stores LSB as leftmost pixel
                let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                self.set_pixel(x + bit, py, color);
            }
        }
    }

    /// Color of a pixel; black outside the buffer
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    /// Set a pixel; writes outside the buffer are ignored
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn to_image(&self) -> DeviceResult<RgbImage> {
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| DeviceError::Capture("framebuffer size does not match dimensions".to_string()))
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> DeviceResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.to_image()?
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}

/// A fake device that draws what happened to it.
///
/// Every capture renders a fresh frame: a status bar with the capture
/// number, the last executed command as text, and a touch marker where
/// the last tap or swipe landed.
#[derive(Debug, Clone)]
pub struct MockDevice {
    framebuffer: MockFramebuffer,
    executed: Vec<DeviceCommand>,
    installed: HashSet<String>,
    captures: u32,
    failing_executes: u32,
    failing_captures: u32,
}

impl MockDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            framebuffer: MockFramebuffer::with_color(width, height, BACKGROUND),
            executed: Vec::new(),
            installed: HashSet::new(),
            captures: 0,
            failing_executes: 0,
            failing_captures: 0,
        }
    }

    /// Mark a package as already installed
    pub fn with_installed(mut self, package: impl Into<String>) -> Self {
        self.installed.insert(package.into());
        self
    }

    /// Make the next `count` executions fail
    pub fn fail_next_executes(&mut self, count: u32) {
        self.failing_executes = count;
    }

    /// Make the next `count` captures fail
    pub fn fail_next_captures(&mut self, count: u32) {
        self.failing_captures = count;
    }

    /// Commands executed so far, in order
    pub fn executed(&self) -> &[DeviceCommand] {
        &self.executed
    }

    /// Number of screenshots taken so far
    pub fn capture_count(&self) -> u32 {
        self.captures
    }

    pub fn framebuffer(&self) -> &MockFramebuffer {
        &self.framebuffer
    }

    fn render(&mut self) {
        let width = self.framebuffer.width();
        self.framebuffer.fill(BACKGROUND);
        self.framebuffer.draw_rect(0, 0, width, 24, STATUS_BAR);
        let status = format!("capture {}", self.captures);
        self.framebuffer.draw_text(8, 8, &status, BACKGROUND, STATUS_BAR);

        if let Some(last) = self.executed.last() {
            let label = serde_json::to_string(last).unwrap_or_else(|_| last.name().to_string());
            self.framebuffer.draw_text(8, 40, &label, TEXT, BACKGROUND);
            if let Some((x, y)) = last.marker() {
                self.framebuffer
                    .draw_rect(x.saturating_sub(4), y.saturating_sub(4), 9, 9, TOUCH);
            }
        }
    }
}

impl DevicePort for MockDevice {
    fn capture_screenshot(&mut self) -> DeviceResult<Screenshot> {
        if self.failing_captures > 0 {
            self.failing_captures -= 1;
            return Err(DeviceError::Capture("mock capture failure".to_string()));
        }
        self.captures += 1;
        self.render();
        Screenshot::from_png(self.framebuffer.to_png()?)
    }

    fn screen_size(&mut self) -> DeviceResult<Resolution> {
        Ok(Resolution::new(self.framebuffer.width(), self.framebuffer.height()))
    }

    fn execute(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        if self.failing_executes > 0 {
            self.failing_executes -= 1;
            return Err(DeviceError::CommandFailed {
                command: command.name().to_string(),
                message: "mock execution failure".to_string(),
            });
        }
        match command {
            DeviceCommand::Uninstall { package } => {
                self.installed.remove(package);
            }
            DeviceCommand::Tap { x, y } if *x >= self.framebuffer.width() || *y >= self.framebuffer.height() => {
                return Err(DeviceError::CommandFailed {
                    command: command.name().to_string(),
                    message: format!("({}, {}) is off screen", x, y),
                });
            }
            _ => {}
        }
        self.executed.push(command.clone());
        Ok(())
    }

    fn is_installed(&mut self, package: &str) -> DeviceResult<bool> {
        Ok(self.installed.contains(package))
    }

    fn source_type(&self) -> &str {
        "mock"
    }
}
