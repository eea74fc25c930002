//! Fan-out of encoded frames and camera metadata

pub mod broadcast;
pub mod encode;
pub mod memory;

use std::sync::Arc;

use serde_json::json;

use crate::capture::Frame;
use crate::error::FrameError;
use crate::metadata::MetadataRecord;

pub use broadcast::BroadcastPublisher;
pub use memory::MemoryPublisher;

/// Latest published frame and metadata, handed to consumers as they join
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Base64 JPEG of the last published frame
    pub frame: Option<Arc<str>>,
    pub metadata: Option<Arc<MetadataRecord>>,
}

/// One message on the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(Arc<str>),
    CameraInfo(Arc<MetadataRecord>),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Frame(_) => "frame",
            StreamEvent::CameraInfo(_) => "camera_info",
        }
    }

    /// `{"event": <name>, "data": <payload>}`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            StreamEvent::Frame(b64) => json!({ "frame": &**b64 }),
            StreamEvent::CameraInfo(record) => serde_json::to_value(&**record)?,
        };
        serde_json::to_string(&json!({ "event": self.name(), "data": data }))
    }
}

/// Sink for processed frames; implementations must tolerate calls from the
/// capture thread while other threads read snapshots.
pub trait Publisher: Send + Sync {
    /// Encode the frame at `quality` (0-100), cache it and push it to every
    /// connected consumer. No per-consumer retries.
    fn publish(&self, frame: &Frame, quality: u8) -> Result<(), FrameError>;

    /// Cache and push a metadata record on its own channel.
    fn publish_metadata(&self, record: MetadataRecord);

    fn snapshot(&self) -> Snapshot;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, frame: &Frame, quality: u8) -> Result<(), FrameError> {
        (**self).publish(frame, quality)
    }

    fn publish_metadata(&self, record: MetadataRecord) {
        (**self).publish_metadata(record)
    }

    fn snapshot(&self) -> Snapshot {
        (**self).snapshot()
    }
}
