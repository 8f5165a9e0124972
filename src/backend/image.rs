//! Screenshot preparation for backend requests.

use base64::Engine;
use image::imageops::FilterType;
use std::io::Cursor;

use super::BackendResult;
use crate::action::Resolution;
use crate::device::Screenshot;

/// Base64 PNG of the screenshot as seen on the declared canvas.
///
/// When the canvas differs from the screenshot size the image is resized,
/// so the coordinates a model reads off the picture are canvas coordinates.
pub fn encode_for_canvas(screenshot: &Screenshot, canvas: Resolution) -> BackendResult<String> {
    let engine = base64::engine::general_purpose::STANDARD;
    if screenshot.size == canvas {
        return Ok(engine.encode(&screenshot.png));
    }

    let resized = image::load_from_memory(&screenshot.png)?.resize_exact(
        canvas.width,
        canvas.height,
        FilterType::Triangle,
    );
    let mut png = Vec::new();
    resized.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(engine.encode(&png))
}

/// `data:` URL form used by the Responses API.
pub fn data_url(base64_png: &str) -> String {
    format!("data:image/png;base64,{}", base64_png)
}
