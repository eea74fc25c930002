//! Default publisher: broadcast fan-out plus an atomically swapped snapshot

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{instrument, trace};

use super::encode::encode_frame;
use super::{Publisher, Snapshot, StreamEvent};
use crate::capture::Frame;
use crate::error::FrameError;
use crate::metadata::MetadataRecord;

/// Encodes frames once and pushes them to every subscriber.
///
/// Readers never see a half-written snapshot: each publish builds a new
/// [`Snapshot`] and swaps it in whole.
pub struct BroadcastPublisher {
    events: broadcast::Sender<StreamEvent>,
    snapshot: ArcSwap<Snapshot>,
}

impl BroadcastPublisher {
    /// `capacity` is how many events a slow consumer may fall behind before
    /// it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// Live event feed; pair with [`Publisher::snapshot`] to greet a new consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn broadcast(&self, event: StreamEvent) {
        // Err only means nobody is listening right now
        if let Err(broadcast::error::SendError(event)) = self.events.send(event) {
            trace!("No subscribers for {} event", event.name());
        }
    }
}

impl Publisher for BroadcastPublisher {
    #[instrument(skip_all, fields(sequence = frame.meta.sequence))]
    fn publish(&self, frame: &Frame, quality: u8) -> Result<(), FrameError> {
        let encoded: Arc<str> = encode_frame(frame, quality)?.into();

        self.snapshot.rcu(|current| Snapshot {
            frame: Some(Arc::clone(&encoded)),
            metadata: current.metadata.clone(),
        });
        metrics::histogram!("frame_payload_bytes").record(encoded.len() as f64);

        self.broadcast(StreamEvent::Frame(encoded));
        Ok(())
    }

    fn publish_metadata(&self, record: MetadataRecord) {
        let record = Arc::new(record);
        self.snapshot.rcu(|current| Snapshot {
            frame: current.frame.clone(),
            metadata: Some(Arc::clone(&record)),
        });
        self.broadcast(StreamEvent::CameraInfo(record));
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::clone(&self.snapshot.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::metadata::Scalar;

    fn frame(value: u8) -> Frame {
        Frame::new(vec![value; 8 * 8 * 3], 8, 8, PixelFormat::Rgb24, value as u64).unwrap()
    }

    #[test]
    fn snapshot_starts_empty() {
        let publisher = BroadcastPublisher::new(4);
        let snapshot = publisher.snapshot();
        assert!(snapshot.frame.is_none());
        assert!(snapshot.metadata.is_none());
    }

    #[test]
    fn publish_without_subscribers_still_caches() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish(&frame(1), 70).unwrap();
        assert!(publisher.snapshot().frame.is_some());
    }

    #[tokio::test]
    async fn subscribers_receive_frames_in_order() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(&frame(10), 70).unwrap();
        publisher.publish(&frame(200), 70).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(StreamEvent::Frame(publisher.snapshot().frame.unwrap()), second);
    }

    #[tokio::test]
    async fn metadata_and_frame_caches_are_independent() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        let mut record = MetadataRecord::new();
        record.insert("width".into(), Scalar::Int(640));
        publisher.publish_metadata(record.clone());
        publisher.publish(&frame(3), 70).unwrap();

        let snapshot = publisher.snapshot();
        assert_eq!(snapshot.metadata.as_deref(), Some(&record));
        assert!(snapshot.frame.is_some());

        assert_eq!(rx.recv().await.unwrap().name(), "camera_info");
        assert_eq!(rx.recv().await.unwrap().name(), "frame");

        // A later frame keeps the cached metadata
        publisher.publish(&frame(4), 70).unwrap();
        assert_eq!(publisher.snapshot().metadata.as_deref(), Some(&record));
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let publisher = BroadcastPublisher::new(2);
        assert_eq!(publisher.subscriber_count(), 0);
        let rx = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);
        drop(rx);
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
