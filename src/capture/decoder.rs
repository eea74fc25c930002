use zune_jpeg::JpegDecoder;

use super::frame::{Frame, PixelFormat};
use crate::error::FrameError;

/// Pixel layouts the camera may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Mjpeg,
    Yuyv,
    Rgb24,
}

impl WireFormat {
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            WireFormat::Mjpeg => b"MJPG",
            WireFormat::Yuyv => b"YUYV",
            WireFormat::Rgb24 => b"RGB3",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"MJPG" => Some(WireFormat::Mjpeg),
            b"YUYV" => Some(WireFormat::Yuyv),
            b"RGB3" => Some(WireFormat::Rgb24),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            WireFormat::Mjpeg => "MJPEG",
            WireFormat::Yuyv => "YUYV",
            WireFormat::Rgb24 => "RGB24",
        }
    }
}

/// Negotiated geometry of the buffers a device hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub format: WireFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row including driver padding; 0 means tightly packed
    pub stride: u32,
}

impl BufferLayout {
    pub fn packed(format: WireFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            stride: 0,
        }
    }
}

/// Turn one dequeued device buffer into an RGB24 frame.
pub fn decode_frame(data: &[u8], layout: &BufferLayout, sequence: u64) -> Result<Frame, FrameError> {
    let BufferLayout {
        format,
        width,
        height,
        ..
    } = *layout;

    match format {
        WireFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            let pixels = decoder.decode().map_err(|e| FrameError::Decode {
                format: format.name(),
                reason: e.to_string(),
            })?;
            // MJPEG carries its own geometry; trust it over the negotiated one
            let (w, h) = decoder.dimensions().ok_or(FrameError::Decode {
                format: format.name(),
                reason: "missing image dimensions".into(),
            })?;
            Frame::new(pixels, w as u32, h as u32, PixelFormat::Rgb24, sequence)
        }
        WireFormat::Rgb24 => {
            let pixels = unpad_rows(data, layout, 3)?;
            Frame::new(pixels, width, height, PixelFormat::Rgb24, sequence)
        }
        WireFormat::Yuyv => {
            let packed = unpad_rows(data, layout, 2)?;
            Frame::new(yuyv_to_rgb(&packed), width, height, PixelFormat::Rgb24, sequence)
        }
    }
}

/// Rows of `bytes_per_pixel * width` bytes, with any per-row padding dropped.
fn unpad_rows(data: &[u8], layout: &BufferLayout, bytes_per_pixel: usize) -> Result<Vec<u8>, FrameError> {
    let row = layout.width as usize * bytes_per_pixel;
    let rows = layout.height as usize;
    let stride = (layout.stride as usize).max(row);
    let needed = match rows {
        0 => 0,
        n => (n - 1) * stride + row,
    };

    if data.len() < needed {
        return Err(FrameError::BufferSize {
            width: layout.width,
            height: layout.height,
            channels: bytes_per_pixel as u8,
            expected: needed,
            actual: data.len(),
        });
    }

    if stride == row {
        return Ok(data[..needed].to_vec());
    }
    let mut packed = Vec::with_capacity(row * rows);
    for y in 0..rows {
        packed.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    Ok(packed)
}

/// YUYV 4:2:2 to packed RGB24 (BT.601, limited range).
fn yuyv_to_rgb(packed: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(packed.len() / 2 * 3);
    for chunk in packed.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
