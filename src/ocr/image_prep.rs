//! Normalize uploaded photos and scans before sending them to OCR.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use tracing::debug;

/// Longest edge sent to OCR. Phone photos are often 4000px+.
pub const MAX_EDGE_PX: u32 = 2500;

/// A PNG-encoded image ready for upload.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    pub fn data_url(&self) -> String {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        format!("data:image/png;base64,{}", BASE64.encode(&self.png))
    }
}

/// Decode any supported image, downscale it and re-encode as PNG.
pub fn prepare(data: &[u8]) -> Result<PreparedImage> {
    let img = image::load_from_memory(data).context("Failed to decode image")?;
    let (orig_w, orig_h) = img.dimensions();

    let img = downscale(img);
    let (width, height) = img.dimensions();
    if (width, height) != (orig_w, orig_h) {
        debug!("Downscaled image {}x{} -> {}x{}", orig_w, orig_h, width, height);
    }

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png)
        .context("Failed to encode PNG")?;

    Ok(PreparedImage {
        png: buf.into_inner(),
        width,
        height,
    })
}

fn downscale(img: DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w.max(h) <= MAX_EDGE_PX {
        return img;
    }
    // resize() keeps the aspect ratio within the bounding box.
    img.resize(MAX_EDGE_PX, MAX_EDGE_PX, FilterType::Triangle)
}
