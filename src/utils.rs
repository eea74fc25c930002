use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::decoder::WireFormat;

/// Highest `/dev/videoN` index scanned
const MAX_SCAN_INDEX: usize = 16;

// Detected capture device info
#[derive(Debug, Clone, Serialize)]
pub struct FoundDevice {
    pub index: usize,
    pub path: PathBuf,
    pub card: String,
    pub driver: String,
    /// Every pixel format the device offers, as FourCC strings
    pub formats: Vec<String>,
}

impl FoundDevice {
    /// True if at least one offered format can be decoded by the pipeline
    pub fn is_supported(&self) -> bool {
        self.formats.iter().any(|f| {
            <&[u8; 4]>::try_from(f.as_bytes())
                .ok()
                .and_then(WireFormat::from_fourcc)
                .is_some()
        })
    }
}

/// List V4L2 video capture devices. Nodes that cannot be opened or are not
/// capture devices (metadata nodes, encoders) are skipped.
pub fn scan_devices() -> Vec<FoundDevice> {
    info!("Scanning capture devices...");

    let mut found = Vec::new();
    for index in 0..MAX_SCAN_INDEX {
        let path = PathBuf::from(format!("/dev/video{}", index));
        if !path.exists() {
            continue;
        }
        match inspect(index, &path) {
            Some(device) => {
                info!("Found capture device: {} - {}", path.display(), device.card);
                found.push(device);
            }
            None => debug!("Skipping {}", path.display()),
        }
    }
    found
}

fn inspect(index: usize, path: &Path) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }

    let formats = dev
        .enum_formats()
        .map(|formats| formats.iter().map(|f| f.fourcc.to_string()).collect())
        .unwrap_or_default();

    Some(FoundDevice {
        index,
        path: path.to_path_buf(),
        card: caps.card,
        driver: caps.driver,
        formats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(formats: &[&str]) -> FoundDevice {
        FoundDevice {
            index: 0,
            path: PathBuf::from("/dev/video0"),
            card: "Test Cam".into(),
            driver: "uvcvideo".into(),
            formats: formats.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn supported_formats_are_recognised() {
        assert!(device(&["YUYV"]).is_supported());
        assert!(device(&["H264", "MJPG"]).is_supported());
        assert!(!device(&["H264", "NV12"]).is_supported());
        assert!(!device(&[]).is_supported());
    }
}
