//! Frame processing between the camera and the publisher

pub mod motion;
pub mod status;
pub mod streamer;
pub mod transform;

pub use status::{StatusReport, StreamState, StreamStatus};
pub use streamer::{StreamSettings, Streamer};
pub use transform::{DefaultTransform, FrameTransform, TransformConfig, Transformed};
