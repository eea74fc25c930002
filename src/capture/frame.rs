use std::time::Instant;

use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Decoded frame with zero-copy semantics
///
/// The pixel buffer is immutable once built; cloning a frame only bumps the
/// reference count of `data`.
#[derive(Clone)]
pub struct Frame {
    /// Tightly packed pixels, row-major, `width * height * channels` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel layouts a decoded frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> u8 {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Width, height and channel count; two frames are comparable when equal.
pub type Shape = (u32, u32, u8);

impl Frame {
    /// Wrap a packed pixel buffer, checking its length against the geometry.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let data = data.into();
        let channels = format.channels();
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                channels,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: FrameMetadata {
                sequence,
                width,
                height,
                format,
            },
            timestamp: Instant::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn channels(&self) -> u8 {
        self.meta.format.channels()
    }

    pub fn shape(&self) -> Shape {
        (self.meta.width, self.meta.height, self.channels())
    }

    /// Copy the pixels into an `image` buffer for processing.
    pub fn to_image(&self) -> Result<DynamicImage, FrameError> {
        let (width, height) = (self.meta.width, self.meta.height);
        let pixels = self.data.to_vec();
        let image = match self.meta.format {
            PixelFormat::Rgb24 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
            PixelFormat::Gray8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        };
        image.ok_or_else(|| self.size_error())
    }

    /// Build a frame from processed pixels, keeping this frame's sequence and
    /// capture time.
    pub fn with_image(&self, image: DynamicImage) -> Result<Self, FrameError> {
        let (width, height) = (image.width(), image.height());
        let (format, data) = match image {
            DynamicImage::ImageLuma8(gray) => (PixelFormat::Gray8, gray.into_raw()),
            DynamicImage::ImageRgb8(rgb) => (PixelFormat::Rgb24, rgb.into_raw()),
            other => (PixelFormat::Rgb24, other.into_rgb8().into_raw()),
        };

        let mut frame = Frame::new(data, width, height, format, self.meta.sequence)?;
        frame.timestamp = self.timestamp;
        Ok(frame)
    }

    /// Single-channel intensity with BT.601 weights, used by motion
    /// comparison and grayscale output.
    pub fn to_luma(&self) -> Result<GrayImage, FrameError> {
        let luma = match self.meta.format {
            PixelFormat::Gray8 => self.data.to_vec(),
            PixelFormat::Rgb24 => self
                .data
                .chunks_exact(3)
                .map(|px| bt601_luma(px[0], px[1], px[2]))
                .collect(),
        };
        GrayImage::from_raw(self.meta.width, self.meta.height, luma).ok_or_else(|| self.size_error())
    }

    fn size_error(&self) -> FrameError {
        let (width, height) = (self.meta.width, self.meta.height);
        FrameError::BufferSize {
            width,
            height,
            channels: self.channels(),
            expected: width as usize * height as usize * self.channels() as usize,
            actual: self.data.len(),
        }
    }
}

/// `0.299 R + 0.587 G + 0.114 B` in 14-bit fixed point, rounded
fn bt601_luma(r: u8, g: u8, b: u8) -> u8 {
    const SHIFT: u32 = 14;
    let y = 4899 * r as u32 + 9617 * g as u32 + 1868 * b as u32 + (1 << (SHIFT - 1));
    (y >> SHIFT) as u8
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}
