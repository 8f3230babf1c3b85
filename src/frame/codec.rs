//! Still-frame wire codec: downscale, JPEG-compress, base64.
//!
//! Frames cross the broadcast channel as base64 JPEG inside a JSON payload,
//! so the encoded size matters more than fidelity. The default 240x180 at
//! quality 70 lands well under typical pub/sub payload limits.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageBuffer, ImageFormat, Rgb};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::RgbFrame;

/// Downscale a frame to at most `width` x `height`, preserving aspect.
fn downscale(frame: &RgbFrame, width: u32, height: u32) -> anyhow::Result<RgbFrame> {
    if frame.width <= width && frame.height <= height {
        return Ok(frame.clone());
    }
    let Some(buffer) =
        ImageBuffer::<Rgb<u8>, _>::from_vec(frame.width, frame.height, frame.data.clone())
    else {
        anyhow::bail!("frame buffer does not match {}x{}", frame.width, frame.height);
    };
    let resized = image::DynamicImage::ImageRgb8(buffer)
        .resize(width, height, image::imageops::FilterType::Triangle)
        .to_rgb8();
    Ok(RgbFrame {
        width: resized.width(),
        height: resized.height(),
        data: resized.into_raw(),
    })
}

/// Stamp a small solid badge in the top-left corner. Used by the debug
/// overlay so loopback runs can tell local and remote frames apart.
fn stamp_badge(frame: &mut RgbFrame, rgb: [u8; 3]) {
    let side = (frame.width.min(frame.height) / 10).max(4);
    for y in 0..side.min(frame.height) {
        for x in 0..side.min(frame.width) {
            let i = ((y * frame.width + x) * 3) as usize;
            frame.data[i..i + 3].copy_from_slice(&rgb);
        }
    }
}

/// Encode a captured frame for the wire: downscale, optional badge,
/// JPEG at the configured quality, base64.
pub fn prepare(frame: &RgbFrame, config: &CallConfig, badge: Option<[u8; 3]>) -> anyhow::Result<String> {
    let mut small = downscale(frame, config.frame_width, config.frame_height)?;
    if config.debug_overlay {
        if let Some(rgb) = badge {
            stamp_badge(&mut small, rgb);
        }
    }

    let mut jpeg = Vec::with_capacity(small.data.len() / 4);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, config.jpeg_quality);
    encoder.encode(&small.data, small.width, small.height, ColorType::Rgb8)?;
    Ok(STANDARD.encode(jpeg))
}

/// Decode a received wire frame back to raw RGB. Malformed input is a
/// soft failure; the caller logs it and keeps the previous frame.
pub fn decode(encoded: &str) -> Result<RgbFrame, CallError> {
    let jpeg = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CallError::FrameDecodeFailure(format!("bad base64: {e}")))?;
    let img = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
        .map_err(|e| CallError::FrameDecodeFailure(format!("bad jpeg: {e}")))?
        .to_rgb8();
    Ok(RgbFrame {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    })
}
