//! The feature tracking pipeline.
//!
//! Per stereo frame: temporal optical flow seeded by the gyro rotation,
//! stereo re-matching gated by the epipolar constraint, two-point RANSAC per
//! camera, then grid-based replenishment and pruning.

pub mod engine;
pub mod grid;
pub mod output;
pub mod ransac;
pub mod stereo;

pub use engine::TrackerEngine;
pub use grid::{FeatureId, FeatureMetaData, GridFeatures};
