//! Processor configuration.
//!
//! All parameters are read once at initialization and are immutable
//! afterwards. Defaults follow the reference tuning for a 20 Hz stereo rig.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Tuning parameters of the feature tracking pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Number of grid rows the image plane is partitioned into.
    pub grid_row: usize,
    /// Number of grid columns the image plane is partitioned into.
    pub grid_col: usize,
    /// Replenishment target per grid cell.
    pub grid_min_feature_num: usize,
    /// Pruning ceiling per grid cell.
    pub grid_max_feature_num: usize,
    /// Pyramid depth for optical flow (levels beyond the base image).
    pub pyramid_levels: usize,
    /// Optical flow integration window, in pixels (odd).
    pub patch_size: usize,
    /// FAST corner detector intensity threshold.
    pub fast_threshold: f32,
    /// Iteration cap for the optical flow solver.
    pub max_iteration: usize,
    /// Convergence epsilon for the optical flow solver, in pixels.
    pub track_precision: f64,
    /// Two-point RANSAC inlier threshold, in pixels.
    pub ransac_threshold: f64,
    /// Stereo epipolar inlier threshold, in pixels.
    pub stereo_threshold: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            grid_row: 4,
            grid_col: 4,
            grid_min_feature_num: 2,
            grid_max_feature_num: 4,
            pyramid_levels: 3,
            patch_size: 31,
            fast_threshold: 20.0,
            max_iteration: 30,
            track_precision: 0.01,
            ransac_threshold: 3.0,
            stereo_threshold: 3.0,
        }
    }
}

impl ProcessorConfig {
    /// Load a configuration from a YAML file. Missing keys keep their
    /// defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Echo every parameter at INFO, once, after loading.
    pub fn log_summary(&self) {
        info!("grid_row: {}", self.grid_row);
        info!("grid_col: {}", self.grid_col);
        info!("grid_min_feature_num: {}", self.grid_min_feature_num);
        info!("grid_max_feature_num: {}", self.grid_max_feature_num);
        info!("pyramid_levels: {}", self.pyramid_levels);
        info!("patch_size: {}", self.patch_size);
        info!("fast_threshold: {}", self.fast_threshold);
        info!("max_iteration: {}", self.max_iteration);
        info!("track_precision: {}", self.track_precision);
        info!("ransac_threshold: {}", self.ransac_threshold);
        info!("stereo_threshold: {}", self.stereo_threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_tuning() {
        let config = ProcessorConfig::default();
        assert_eq!(config.grid_row, 4);
        assert_eq!(config.grid_col, 4);
        assert_eq!(config.grid_min_feature_num, 2);
        assert_eq!(config.grid_max_feature_num, 4);
        assert_eq!(config.pyramid_levels, 3);
        assert_eq!(config.patch_size, 31);
        assert_eq!(config.max_iteration, 30);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ProcessorConfig = serde_yaml::from_str("grid_row: 5\nfast_threshold: 10.0\n").unwrap();
        assert_eq!(config.grid_row, 5);
        assert_eq!(config.fast_threshold, 10.0);
        assert_eq!(config.grid_col, 4);
        assert_eq!(config.patch_size, 31);
    }
}
