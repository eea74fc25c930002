pub mod decoder;
pub mod frame;
pub mod v4l2;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DeviceError};
use crate::metadata::{MetadataRecord, Scalar};

pub use frame::{Frame, PixelFormat};
pub use v4l2::V4l2Camera;

/// Camera identifier: numeric strings select `/dev/videoN`, anything else is a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceId {
    Index(usize),
    Path(PathBuf),
}

impl DeviceId {
    pub fn path(&self) -> PathBuf {
        match self {
            DeviceId::Index(index) => PathBuf::from(format!("/dev/video{index}")),
            DeviceId::Path(path) => path.clone(),
        }
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::Index(0)
    }
}

impl FromStr for DeviceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidDevice(s.to_string()));
        }
        Ok(match s.parse::<usize>() {
            Ok(index) => DeviceId::Index(index),
            Err(_) => DeviceId::Path(PathBuf::from(s)),
        })
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(index) => write!(f, "{index}"),
            DeviceId::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<&DeviceId> for Scalar {
    fn from(id: &DeviceId) -> Self {
        match id {
            DeviceId::Index(index) => Scalar::Int(*index as i64),
            DeviceId::Path(path) => Scalar::Text(path.display().to_string()),
        }
    }
}

/// Owner of exactly one camera resource between `open` and `close`.
///
/// `read` returning `Ok(None)` means the device had no frame this time and is
/// not an error.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<(), DeviceError>;

    fn is_running(&self) -> bool;

    fn read(&mut self) -> Result<Option<Frame>, DeviceError>;

    /// Negotiated geometry, rate and identifier of the open device.
    fn info(&self) -> Result<MetadataRecord, DeviceError>;

    /// Release the device. Closing a device that is not running is a no-op.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_are_indices() {
        assert_eq!("0".parse::<DeviceId>().unwrap(), DeviceId::Index(0));
        assert_eq!(" 2 ".parse::<DeviceId>().unwrap(), DeviceId::Index(2));
        assert_eq!(DeviceId::Index(3).path(), PathBuf::from("/dev/video3"));
    }

    #[test]
    fn other_strings_are_paths() {
        let id: DeviceId = "/dev/v4l/by-id/usb-cam".parse().unwrap();
        assert_eq!(id, DeviceId::Path(PathBuf::from("/dev/v4l/by-id/usb-cam")));
        assert_eq!(id.to_string(), "/dev/v4l/by-id/usb-cam");
    }

    #[test]
    fn empty_identifier_is_rejected() {
        assert!(matches!(
            "  ".parse::<DeviceId>(),
            Err(ConfigError::InvalidDevice(_))
        ));
    }

    #[test]
    fn metadata_keeps_index_numeric() {
        assert_eq!(Scalar::from(&DeviceId::Index(1)), Scalar::Int(1));
        assert_eq!(
            Scalar::from(&DeviceId::Path("/dev/video9".into())),
            Scalar::Text("/dev/video9".into())
        );
    }
}
