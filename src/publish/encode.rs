use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::capture::{Frame, PixelFormat};
use crate::error::FrameError;

/// Lossy-compress a frame. Quality 0 is treated as the lowest the codec allows.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, FrameError> {
    let color = match frame.meta.format {
        PixelFormat::Rgb24 => ExtendedColorType::Rgb8,
        PixelFormat::Gray8 => ExtendedColorType::L8,
    };

    // Typical compression ratio is well above 10:1 for camera content
    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode(
        &frame.data,
        frame.width(),
        frame.height(),
        color,
    )?;
    Ok(jpeg)
}

/// JPEG wrapped in standard base64, ready for a text channel.
pub fn encode_frame(frame: &Frame, quality: u8) -> Result<String, FrameError> {
    Ok(STANDARD.encode(encode_jpeg(frame, quality)?))
}
