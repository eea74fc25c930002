pub mod capture;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod publish;
pub mod utils;
pub mod web;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureDevice, DeviceId, Frame, PixelFormat};
pub use error::{ConfigError, DeviceError, FrameError, StreamError};
pub use metadata::{MetadataRecord, Scalar};

/// Prefix for environment overrides, e.g. `CAMCAST_STREAM__QUALITY=50`
pub const ENV_PREFIX: &str = "CAMCAST";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

/// Requested camera settings; hardware may negotiate something else
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32, // Memory-mapped driver buffers
}

/// Per-frame transforms and publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Publish cadence; falls back to the device fps
    pub fps: Option<u32>,
    pub quality: u8,
    pub resolution: Option<Resolution>,
    pub grayscale: bool,
    pub motion_detection: bool,
    pub motion_threshold: f64,
    pub motion_max_skip: u32,
    pub preload: bool,
    pub warmup_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub channel_capacity: usize,
    pub ui_dir: Option<PathBuf>,
}

/// Output frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: DeviceId::Index(0),
            width: 640,
            height: 480,
            fps: 15,
            buffer_count: 4,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: None,
            quality: 70,
            resolution: None,
            grayscale: false,
            motion_detection: false,
            motion_threshold: 0.005,
            motion_max_skip: 30,
            preload: true,
            warmup_frames: 3,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            channel_capacity: 16,
            ui_dir: None,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMCAST_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// As [`Config::load`], reading overrides from `env` instead of the
    /// process environment when it is given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(
            field: &'static str,
            value: impl fmt::Display,
            expected: &'static str,
        ) -> ConfigError {
            ConfigError::OutOfRange {
                field,
                value: value.to_string(),
                expected,
            }
        }

        let device = &self.device;
        if device.width == 0 || device.height == 0 {
            return Err(out_of_range(
                "device.width/height",
                format!("{}x{}", device.width, device.height),
                "non-zero dimensions",
            ));
        }
        if device.fps == 0 {
            return Err(out_of_range("device.fps", device.fps, "at least 1"));
        }
        if device.buffer_count == 0 {
            return Err(out_of_range("device.buffer_count", device.buffer_count, "at least 1"));
        }

        let stream = &self.stream;
        if stream.fps == Some(0) {
            return Err(out_of_range("stream.fps", 0, "at least 1"));
        }
        if stream.quality > 100 {
            return Err(out_of_range("stream.quality", stream.quality, "0 to 100"));
        }
        if !(0.0..=1.0).contains(&stream.motion_threshold) {
            return Err(out_of_range(
                "stream.motion_threshold",
                stream.motion_threshold,
                "0.0 to 1.0",
            ));
        }
        if let Some(resolution) = stream.resolution {
            if resolution.width == 0 || resolution.height == 0 {
                return Err(out_of_range(
                    "stream.resolution",
                    resolution,
                    "non-zero dimensions",
                ));
            }
        }
        if self.server.channel_capacity == 0 {
            return Err(out_of_range(
                "server.channel_capacity",
                self.server.channel_capacity,
                "at least 1",
            ));
        }
        Ok(())
    }

    /// Target publish rate in frames per second
    pub fn publish_fps(&self) -> u32 {
        self.stream.fps.unwrap_or(self.device.fps)
    }
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidResolution(s.to_string());
        let (w, h) = s
            .trim()
            .split_once(['x', 'X', ','])
            .ok_or_else(invalid)?;
        let width = w.trim().parse().map_err(|_| invalid())?;
        let height = h.trim().parse().map_err(|_| invalid())?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(resolution: Resolution) -> Self {
        resolution.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
