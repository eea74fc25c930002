//! V4L2 camera handle with memory-mapped streaming

use std::io;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder::{self, BufferLayout, WireFormat};
use crate::capture::{CaptureDevice, DeviceId, Frame};
use crate::error::DeviceError;
use crate::metadata::{MetadataRecord, Scalar};
use crate::DeviceConfig;

/// How long a dequeue may block before the read reports "no frame"
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Formats to request, best first
const PREFERRED_FORMATS: [WireFormat; 3] = [WireFormat::Mjpeg, WireFormat::Yuyv, WireFormat::Rgb24];

/// V4L2 capture device
pub struct V4l2Camera {
    config: DeviceConfig,
    session: Option<Session>,
    sequence: u64,
}

/// Resources held while the camera is open. The stream is declared first so
/// buffers are unmapped before the device handle closes.
struct Session {
    stream: MmapStream<'static>,
    device: Device,
    layout: BufferLayout,
    card: String,
    driver: String,
}

impl V4l2Camera {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            session: None,
            sequence: 0,
        }
    }

    fn open_session(&self) -> Result<Session, DeviceError> {
        let id = &self.config.id;
        let open_err = |source: io::Error| DeviceError::Open {
            device: id.clone(),
            source,
        };

        let device = match id {
            DeviceId::Index(index) => Device::new(*index),
            DeviceId::Path(path) => Device::with_path(path),
        }
        .map_err(open_err)?;

        let caps = device.query_caps().map_err(open_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::NotCapture { device: id.clone() });
        }

        let layout = self.negotiate_format(&device)?;

        // Frame rate is best effort; many UVC cameras ignore it
        match device.set_params(&Parameters::with_fps(self.config.fps)) {
            Ok(params) => debug!(
                "Negotiated frame interval {}/{}",
                params.interval.numerator, params.interval.denominator
            ),
            Err(e) => warn!("Camera refused {} fps: {}", self.config.fps, e),
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)
                .map_err(open_err)?;
        stream.set_timeout(READ_TIMEOUT);

        Ok(Session {
            stream,
            device,
            layout,
            card: caps.card,
            driver: caps.driver,
        })
    }

    /// Request the configured size in the first pixel format the driver accepts.
    fn negotiate_format(&self, device: &Device) -> Result<BufferLayout, DeviceError> {
        let id = &self.config.id;
        let mut fmt = device.format().map_err(|source| DeviceError::Open {
            device: id.clone(),
            source,
        })?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;

        for wanted in PREFERRED_FORMATS {
            fmt.fourcc = FourCC::new(wanted.fourcc());
            let actual = match device.set_format(&fmt) {
                Ok(actual) => actual,
                Err(e) => {
                    debug!("Format {} rejected: {}", fmt.fourcc, e);
                    continue;
                }
            };

            if let Some(format) = WireFormat::from_fourcc(&actual.fourcc.repr) {
                if actual.width != self.config.width || actual.height != self.config.height {
                    info!(
                        "Requested {}x{}, camera negotiated {}x{}",
                        self.config.width, self.config.height, actual.width, actual.height
                    );
                }
                return Ok(BufferLayout {
                    format,
                    width: actual.width,
                    height: actual.height,
                    stride: actual.stride,
                });
            }
        }

        let current = device
            .format()
            .map(|f| f.fourcc.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Err(DeviceError::UnsupportedFormat {
            device: id.clone(),
            fourcc: current,
        })
    }
}

impl CaptureDevice for V4l2Camera {
    #[instrument(skip(self), fields(device = %self.config.id))]
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.session.is_some() {
            warn!("Camera is already running");
            return Ok(());
        }

        info!(
            "Opening camera at {}x{} @ {} fps",
            self.config.width, self.config.height, self.config.fps
        );
        // A failed open drops whatever it acquired before returning
        let session = self.open_session()?;
        info!(
            "Capture stream started with {} buffers ({:?} {}x{})",
            self.config.buffer_count, session.layout.format, session.layout.width, session.layout.height
        );
        self.session = Some(session);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.session.is_some()
    }

    fn read(&mut self) -> Result<Option<Frame>, DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotRunning)?;

        let (buf, meta) = match session.stream.next() {
            Ok(dequeued) => dequeued,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                warn!("Camera produced no frame within {:?}", READ_TIMEOUT);
                return Ok(None);
            }
            Err(e) => return Err(DeviceError::Read(e)),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        self.sequence += 1;
        match decoder::decode_frame(data, &session.layout, self.sequence) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                // Corrupt MJPEG frames happen on flaky USB links; skip them
                warn!("Dropping undecodable frame {}: {}", self.sequence, e);
                Ok(None)
            }
        }
    }

    fn info(&self) -> Result<MetadataRecord, DeviceError> {
        let session = self.session.as_ref().ok_or(DeviceError::NotRunning)?;

        let (width, height, fourcc) = match session.device.format() {
            Ok(fmt) => (fmt.width, fmt.height, fmt.fourcc.to_string()),
            Err(_) => (
                session.layout.width,
                session.layout.height,
                String::from_utf8_lossy(session.layout.format.fourcc()).into_owned(),
            ),
        };
        let fps = session
            .device
            .params()
            .ok()
            .filter(|p| p.interval.numerator > 0)
            .map(|p| p.interval.denominator as f64 / p.interval.numerator as f64)
            .unwrap_or(self.config.fps as f64);

        let mut info = MetadataRecord::new();
        info.insert("width".into(), width.into());
        info.insert("height".into(), height.into());
        info.insert("fps".into(), fps.into());
        info.insert("device_id".into(), Scalar::from(&self.config.id));
        info.insert("fourcc".into(), fourcc.into());
        info.insert("card".into(), session.card.clone().into());
        info.insert("driver".into(), session.driver.clone().into());
        Ok(info)
    }

    fn close(&mut self) {
        match self.session.take() {
            Some(_session) => info!("Camera {} released", self.config.id),
            None => warn!("Camera is not running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_camera() -> V4l2Camera {
        V4l2Camera::new(DeviceConfig {
            id: DeviceId::Path("/nonexistent/camcast-video".into()),
            ..DeviceConfig::default()
        })
    }

    #[test]
    fn open_missing_device_fails_cleanly() {
        let mut camera = missing_camera();
        let err = camera.open().unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
        assert!(!camera.is_running());
    }

    #[test]
    fn read_and_info_require_open_device() {
        let mut camera = missing_camera();
        assert!(matches!(camera.read(), Err(DeviceError::NotRunning)));
        assert!(matches!(camera.info(), Err(DeviceError::NotRunning)));
    }

    #[test]
    fn close_when_not_running_is_a_no_op() {
        let mut camera = missing_camera();
        camera.close();
        camera.close();
        assert!(!camera.is_running());
    }
}
