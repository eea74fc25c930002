//! Publisher that only records what it was given

use std::sync::{Arc, Mutex, PoisonError};

use super::{Publisher, Snapshot};
use crate::capture::Frame;
use crate::error::FrameError;
use crate::metadata::MetadataRecord;

/// Keeps every published frame and metadata record in memory, in order.
/// Handy for tests and for embedding the pipeline without a network.
#[derive(Default)]
pub struct MemoryPublisher {
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    frames: Vec<(Frame, u8)>,
    metadata: Vec<MetadataRecord>,
    /// Publish calls in arrival order, `"frame"` or `"camera_info"`
    order: Vec<&'static str>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.lock().frames.iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn qualities(&self) -> Vec<u8> {
        self.lock().frames.iter().map(|(_, q)| *q).collect()
    }

    pub fn metadata(&self) -> Vec<MetadataRecord> {
        self.lock().metadata.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().order.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, frame: &Frame, quality: u8) -> Result<(), FrameError> {
        let mut inner = self.lock();
        inner.frames.push((frame.clone(), quality));
        inner.order.push("frame");
        Ok(())
    }

    fn publish_metadata(&self, record: MetadataRecord) {
        let mut inner = self.lock();
        inner.metadata.push(record);
        inner.order.push("camera_info");
    }

    /// Frames are cached as their sequence number rather than an encoding
    fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            frame: inner
                .frames
                .last()
                .map(|(f, _)| Arc::from(f.meta.sequence.to_string())),
            metadata: inner.metadata.last().cloned().map(Arc::new),
        }
    }
}
