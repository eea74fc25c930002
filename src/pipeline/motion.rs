//! Frame-difference motion measure

use image::imageops;
use image::GrayImage;

use crate::capture::Frame;
use crate::error::FrameError;

/// Gaussian sigma matching a 5x5 smoothing kernel
pub const BLUR_SIGMA: f32 = 1.1;

/// Absolute intensity difference above which a pixel counts as changed
pub const DIFF_CUTOFF: u8 = 25;

/// Intensity image, smoothed so sensor noise does not register as motion.
/// This is what consecutive frames are compared on.
pub fn smoothed_luma(frame: &Frame) -> Result<GrayImage, FrameError> {
    Ok(imageops::blur(&frame.to_luma()?, BLUR_SIGMA))
}

/// Fraction of pixels whose smoothed intensity moved by more than
/// [`DIFF_CUTOFF`]. Both images must have the same dimensions.
pub fn changed_fraction(current: &GrayImage, previous: &GrayImage) -> f64 {
    let total = current.width() as usize * current.height() as usize;
    if total == 0 {
        return 0.0;
    }

    let changed = current
        .as_raw()
        .iter()
        .zip(previous.as_raw())
        .filter(|(a, b)| a.abs_diff(**b) > DIFF_CUTOFF)
        .count();

    changed as f64 / total as f64
}
