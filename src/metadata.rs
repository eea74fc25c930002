//! Camera/stream metadata published on the `camera_info` channel

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::StreamConfig;

/// Flat key to scalar mapping describing the camera and the active stream.
pub type MetadataRecord = BTreeMap<String, Scalar>;

/// A primitive metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::Int(v.into())
    }
}

impl From<u8> for Scalar {
    fn from(v: u8) -> Self {
        Scalar::Int(v.into())
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

const NOT_APPLICABLE: &str = "N/A";

/// Active stream settings under their `stream_*` keys.
pub fn stream_fields(publish_fps: u32, stream: &StreamConfig) -> MetadataRecord {
    let motion = |value: Scalar| {
        if stream.motion_detection {
            value
        } else {
            Scalar::from(NOT_APPLICABLE)
        }
    };

    let mut fields = MetadataRecord::new();
    fields.insert("stream_fps".into(), publish_fps.into());
    fields.insert("stream_quality".into(), stream.quality.into());
    fields.insert(
        "stream_resolution".into(),
        match stream.resolution {
            // Tuple notation, as existing viewers parse it
            Some(r) => format!("({}, {})", r.width, r.height).into(),
            None => "Original".into(),
        },
    );
    fields.insert("stream_grayscale".into(), stream.grayscale.into());
    fields.insert("stream_motion_detection".into(), stream.motion_detection.into());
    fields.insert(
        "stream_motion_threshold".into(),
        motion(stream.motion_threshold.into()),
    );
    fields.insert(
        "stream_motion_max_skip".into(),
        motion(stream.motion_max_skip.into()),
    );
    fields
}

/// Device info merged with the stream fields; stream keys win on collision.
pub fn camera_info(
    device: MetadataRecord,
    publish_fps: u32,
    stream: &StreamConfig,
) -> MetadataRecord {
    let mut record = device;
    record.extend(stream_fields(publish_fps, stream));
    record
}
