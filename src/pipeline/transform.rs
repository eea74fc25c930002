//! Per-frame transforms: resize, motion gating, grayscale

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use tracing::debug;

use crate::capture::Frame;
use crate::error::FrameError;
use crate::pipeline::motion;
use crate::{Resolution, StreamConfig};

/// Result of running a frame through a transform
#[derive(Debug)]
pub enum Transformed {
    Publish(Frame),
    /// Not different enough from the last accepted frame
    Skip,
}

/// A pluggable per-frame stage between the device and the publisher.
pub trait FrameTransform: Send {
    fn apply(&mut self, frame: Frame) -> Result<Transformed, FrameError>;

    /// Change ratio computed by the most recent motion comparison
    fn last_change_ratio(&self) -> f64 {
        0.0
    }

    /// Consecutive frames skipped so far
    fn skip_count(&self) -> u32 {
        0
    }
}

/// Options for [`DefaultTransform`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransformConfig {
    pub output_resolution: Option<Resolution>,
    pub grayscale: bool,
    pub motion_detection: bool,
    pub motion_threshold: f64,
    pub max_skip: u32,
}

impl From<&StreamConfig> for TransformConfig {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            output_resolution: stream.resolution,
            grayscale: stream.grayscale,
            motion_detection: stream.motion_detection,
            motion_threshold: stream.motion_threshold,
            max_skip: stream.motion_max_skip,
        }
    }
}

/// Motion history. `previous` always holds the last *accepted* frame, after
/// resizing and before grayscale conversion.
#[derive(Debug, Default)]
pub struct TransformState {
    pub previous: Option<Frame>,
    /// Smoothed intensity of `previous`, kept while motion detection is on
    pub previous_luma: Option<GrayImage>,
    pub skip_count: u32,
    pub last_change_ratio: f64,
}

/// Run one frame through resize, motion gating and grayscale, in that order.
pub fn apply(
    frame: Frame,
    config: &TransformConfig,
    state: &mut TransformState,
) -> Result<Transformed, FrameError> {
    let frame = match config.output_resolution {
        Some(target) => resize(&frame, target)?,
        None => frame,
    };

    let mut luma = None;
    if config.motion_detection {
        if let Some(previous) = &state.previous {
            if state.skip_count >= config.max_skip {
                debug!("Forced frame send after {} skipped frames", state.skip_count);
                state.skip_count = 0;
            } else if frame.shape() == previous.shape() {
                let current = motion::smoothed_luma(&frame)?;
                let ratio = match &state.previous_luma {
                    Some(baseline) => motion::changed_fraction(&current, baseline),
                    None => motion::changed_fraction(&current, &motion::smoothed_luma(previous)?),
                };
                state.last_change_ratio = ratio;
                metrics::gauge!("motion_change_ratio").set(ratio);

                if ratio < config.motion_threshold {
                    state.skip_count += 1;
                    if state.skip_count % 10 == 1 {
                        debug!(
                            "Motion below threshold: {:.6} < {}, skipped {} frames",
                            ratio, config.motion_threshold, state.skip_count
                        );
                    }
                    return Ok(Transformed::Skip);
                }
                if state.skip_count > 0 {
                    debug!(
                        "Motion detected: {:.6} >= {}, sent frame after {} skipped frames",
                        ratio, config.motion_threshold, state.skip_count
                    );
                }
                state.skip_count = 0;
                luma = Some(current);
            }
            // Shapes differ: nothing to compare against, let the frame through
        }
    }

    let output = if config.grayscale {
        let gray = DynamicImage::ImageLuma8(frame.to_luma()?);
        // Back to three channels so encoders always see a color-shaped buffer
        frame.with_image(DynamicImage::ImageRgb8(gray.to_rgb8()))?
    } else {
        frame.clone()
    };

    state.previous_luma = match luma {
        Some(luma) => Some(luma),
        None if config.motion_detection => Some(motion::smoothed_luma(&frame)?),
        None => None,
    };
    state.previous = Some(frame);
    Ok(Transformed::Publish(output))
}

fn resize(frame: &Frame, target: Resolution) -> Result<Frame, FrameError> {
    if frame.width() == target.width && frame.height() == target.height {
        return Ok(frame.clone());
    }
    let resized = frame
        .to_image()?
        .resize_exact(target.width, target.height, FilterType::Triangle);
    frame.with_image(resized)
}

/// Stock transform owning its configuration and motion state
#[derive(Debug)]
pub struct DefaultTransform {
    config: TransformConfig,
    state: TransformState,
}

impl DefaultTransform {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            config,
            state: TransformState::default(),
        }
    }
}

impl FrameTransform for DefaultTransform {
    fn apply(&mut self, frame: Frame) -> Result<Transformed, FrameError> {
        apply(frame, &self.config, &mut self.state)
    }

    fn last_change_ratio(&self) -> f64 {
        self.state.last_change_ratio
    }

    fn skip_count(&self) -> u32 {
        self.state.skip_count
    }
}
