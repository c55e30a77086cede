//! Stereo matching of left-image points into the right image.
//!
//! Right-image locations are seeded by rotating each undistorted left point
//! through the stereo rectification rotation and re-distorting with the
//! right camera's model, refined by optical flow, then gated by the epipolar
//! constraint of the fixed extrinsics.

use std::sync::Arc;

use nalgebra::{Point2, Vector3};

use crate::camera::StereoCalibration;
use crate::config::ProcessorConfig;
use crate::vision::optical_flow::{self, LkParams};
use crate::vision::Pyramid;

pub struct StereoMatcher {
    calib: Arc<StereoCalibration>,
    lk_params: LkParams,
    stereo_threshold: f64,
}

impl StereoMatcher {
    pub fn new(calib: Arc<StereoCalibration>, config: &ProcessorConfig) -> Self {
        Self {
            calib,
            lk_params: LkParams {
                win_size: config.patch_size,
                max_level: config.pyramid_levels,
                max_iter: config.max_iteration,
                epsilon: config.track_precision,
            },
            stereo_threshold: config.stereo_threshold,
        }
    }

    /// Match `cam0_points` into the right image.
    ///
    /// Returns the right-image locations and an inlier mask of the input
    /// length.
    pub fn match_points(
        &self,
        cam0_pyramid: &Pyramid,
        cam1_pyramid: &Pyramid,
        cam0_points: &[Point2<f64>],
    ) -> (Vec<Point2<f64>>, Vec<bool>) {
        if cam0_points.is_empty() {
            return (Vec::new(), Vec::new());
        }

        // Seed the right-image locations by projecting through the stereo
        // rotation; the baseline-induced disparity is left to the optical
        // flow refinement.
        let r_cam0_cam1 = self.calib.r_cam0_cam1();
        let cam0_points_rectified =
            self.calib
                .cam0
                .undistort_points(cam0_points, &r_cam0_cam1, [1.0, 1.0, 0.0, 0.0]);
        let initial_cam1_points = self.calib.cam1.distort_points(&cam0_points_rectified);

        let (cam1_points, mut inlier_markers) = optical_flow::track(
            cam0_pyramid,
            cam1_pyramid,
            cam0_points,
            &initial_cam1_points,
            &self.lk_params,
        );

        for (marker, pt) in inlier_markers.iter_mut().zip(cam1_points.iter()) {
            if *marker && !self.calib.cam1.contains(pt) {
                *marker = false;
            }
        }

        // Epipolar gate: corresponding points must lie on conjugate lines of
        // the essential matrix within the threshold.
        let essential = self.calib.essential();
        let cam0_undistorted = self.calib.cam0.undistort_to_normalized(cam0_points);
        let cam1_undistorted = self.calib.cam1.undistort_to_normalized(&cam1_points);
        let norm_pixel_unit = self.calib.stereo_norm_pixel_unit();

        for i in 0..cam0_points.len() {
            if !inlier_markers[i] {
                continue;
            }
            let pt0 = Vector3::new(cam0_undistorted[i].x, cam0_undistorted[i].y, 1.0);
            let pt1 = Vector3::new(cam1_undistorted[i].x, cam1_undistorted[i].y, 1.0);
            let epipolar_line = essential * pt0;
            let error = pt1.dot(&epipolar_line).abs()
                / (epipolar_line.x * epipolar_line.x + epipolar_line.y * epipolar_line.y).sqrt();
            if error > self.stereo_threshold * norm_pixel_unit {
                inlier_markers[i] = false;
            }
        }

        (cam1_points, inlier_markers)
    }
}
