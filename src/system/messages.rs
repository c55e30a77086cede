//! Inter-thread message types.
//!
//! These types are sent between the producers, the tracker engine, and the
//! output consumers via channels.

use image::{GrayImage, RgbImage};

/// A synchronized pair of monochrome frames.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Left image.
    pub cam0: GrayImage,
    /// Right image.
    pub cam1: GrayImage,
}

/// One tracked feature in undistorted normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureObservation {
    pub id: u64,
    /// Left camera, normalized x.
    pub u0: f64,
    /// Left camera, normalized y.
    pub v0: f64,
    /// Right camera, normalized x.
    pub u1: f64,
    /// Right camera, normalized y.
    pub v1: f64,
}

/// Per-frame measurement record consumed by the downstream estimator.
#[derive(Debug, Clone)]
pub struct FeatureMeasurement {
    pub timestamp: f64,
    pub features: Vec<FeatureObservation>,
}

/// Per-frame pipeline statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingInfo {
    pub timestamp: f64,
    /// Features carried in from the previous frame.
    pub before_tracking: usize,
    /// Survivors of temporal optical flow.
    pub after_tracking: usize,
    /// Survivors of stereo matching.
    pub after_matching: usize,
    /// Survivors of both cameras' RANSAC.
    pub after_ransac: usize,
}

/// Rendered side-by-side debug view, produced only when a subscriber exists.
#[derive(Debug, Clone)]
pub struct DebugFrame {
    pub timestamp: f64,
    pub image: RgbImage,
}
