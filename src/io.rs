// ============================================================================
// Image I/O — codec boundary + debug artifact sink
// ============================================================================
//
// The search core never touches the filesystem; everything here is a thin
// wrapper over the `image` crate that surfaces failures as string errors to
// the caller.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, GrayImage, ImageEncoder, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::field::{OffsetField, field_to_rgba, save_field};

/// Decode any supported raster file into RGBA.
pub fn load_rgba(path: &Path) -> Result<RgbaImage, String> {
    let img = image::open(path)
        .map_err(|e| format!("could not load '{}': {}", path.display(), e))?;
    Ok(img.to_rgba8())
}

/// Decode a mask file as 8-bit grayscale.
pub fn load_mask(path: &Path) -> Result<GrayImage, String> {
    let img = image::open(path)
        .map_err(|e| format!("could not load mask '{}': {}", path.display(), e))?;
    Ok(img.to_luma8())
}

/// Encode to the format implied by the output extension (PNG when in doubt).
/// `quality` only affects JPEG.
pub fn save_rgba(path: &Path, img: &RgbaImage, quality: u8) -> Result<(), String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let file = File::create(path)
        .map_err(|e| format!("could not create '{}': {}", path.display(), e))?;
    let writer = BufWriter::new(file);
    let (w, h) = img.dimensions();
    match ext.as_str() {
        "jpg" | "jpeg" => {
            // JPEG has no alpha channel; flatten first.
            let rgb = image::DynamicImage::ImageRgba8(img.clone()).to_rgb8();
            JpegEncoder::new_with_quality(writer, quality.clamp(1, 100))
                .write_image(rgb.as_raw(), w, h, ColorType::Rgb8)
                .map_err(|e| format!("could not save '{}': {}", path.display(), e))
        }
        _ => PngEncoder::new(writer)
            .write_image(img.as_raw(), w, h, ColorType::Rgba8)
            .map_err(|e| format!("could not save '{}': {}", path.display(), e)),
    }
}

// ============================================================================
// Debug artifacts
// ============================================================================

/// Optional directory for intermediate results.  Failures are logged and
/// swallowed: debug output is never required for correctness.
pub struct DebugSink {
    dir: Option<PathBuf>,
}

impl DebugSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                crate::log_warn!("debug dir '{}' unavailable: {}", dir.display(), e);
                return DebugSink { dir: None };
            }
        }
        DebugSink { dir }
    }

    pub fn disabled() -> Self {
        DebugSink { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn write_image(&self, name: &str, img: &RgbaImage) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(format!("{}.png", name));
        if let Err(e) = save_rgba(&path, img, 90) {
            crate::log_warn!("debug image '{}' not written: {}", name, e);
        }
    }

    /// Write both the HSV visualization and the raw `.nnf` dump of a field.
    pub fn write_field(&self, name: &str, field: &OffsetField) {
        let Some(dir) = &self.dir else { return };
        self.write_image(name, &field_to_rgba(field));
        let path = dir.join(format!("{}.nnf", name));
        if let Err(e) = save_field(field, &path) {
            crate::log_warn!("debug field '{}' not written: {}", name, e);
        }
    }
}
