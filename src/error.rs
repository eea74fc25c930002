//! Error types shared across the capture, pipeline and publish layers

use std::io;

use thiserror::Error;

use crate::capture::DeviceId;

/// Failures of the camera device itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot open camera {device}: {source}")]
    Open {
        device: DeviceId,
        #[source]
        source: io::Error,
    },
    #[error("camera {device} does not support video capture")]
    NotCapture { device: DeviceId },
    #[error("camera {device} offers no supported pixel format (negotiated {fourcc})")]
    UnsupportedFormat { device: DeviceId, fourcc: String },
    #[error("camera is not running")]
    NotRunning,
    #[error("failed to read frame: {0}")]
    Read(#[source] io::Error),
}

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid device identifier {0:?}")]
    InvalidDevice(String),
    #[error("invalid resolution {0:?}, expected WIDTHxHEIGHT")]
    InvalidResolution(String),
    #[error("{field} = {value} is out of range, expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Problems turning pixels into frames or frames into payloads.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame buffer holds {actual} bytes, {width}x{height}x{channels} needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
    #[error("cannot decode {format} buffer: {reason}")]
    Decode { format: &'static str, reason: String },
    #[error("cannot encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Anything that ends a streaming session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("previous capture thread has not exited yet")]
    Busy,
}
