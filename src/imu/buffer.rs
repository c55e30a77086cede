//! Append-only inertial buffer with frame-interval integration.
//!
//! The producer thread appends, the tracker engine slices a frame interval,
//! averages the angular velocity and erases everything it consumed. The
//! buffer itself carries no lock; callers share it behind a
//! `parking_lot::Mutex`.

use std::collections::VecDeque;

use nalgebra::{Matrix3, Vector3};

use crate::camera::StereoCalibration;
use crate::geometry::exp_so3;
use crate::imu::ImuSample;

/// Samples are admitted starting this long before the previous frame.
const INTERVAL_START_MARGIN: f64 = 0.01;
/// Samples are admitted up to this long after the current frame.
const INTERVAL_END_MARGIN: f64 = 0.005;

/// Inertial ingress depth; the oldest samples are dropped on overflow, so a
/// stalled consumer cannot grow the buffer without bound.
const MAX_PENDING_SAMPLES: usize = 50;

/// Ordered buffer of raw IMU samples.
#[derive(Debug, Default)]
pub struct ImuBuffer {
    samples: VecDeque<ImuSample>,
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, dropping the oldest entry when full.
    pub fn push(&mut self, sample: ImuSample) {
        if self.samples.len() >= MAX_PENDING_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean angular velocity over `[prev_ts − 10 ms, curr_ts + 5 ms]`,
    /// exponentiated into the inter-frame rotation of each camera.
    ///
    /// The returned matrices take a vector expressed in the previous camera
    /// frame into the current camera frame (hence the transpose of the body
    /// rotation). All samples up to the end of the interval, including stale
    /// ones from before it, are erased. An empty selection yields identity.
    pub fn relative_camera_rotations(
        &mut self,
        calib: &StereoCalibration,
        prev_ts: f64,
        curr_ts: f64,
    ) -> (Matrix3<f64>, Matrix3<f64>) {
        let begin = self
            .samples
            .iter()
            .position(|s| s.timestamp - prev_ts >= -INTERVAL_START_MARGIN)
            .unwrap_or(self.samples.len());
        let end = begin
            + self
                .samples
                .iter()
                .skip(begin)
                .position(|s| s.timestamp - curr_ts >= INTERVAL_END_MARGIN)
                .unwrap_or(self.samples.len() - begin);

        let mut mean_ang_vel = Vector3::zeros();
        if end > begin {
            for sample in self.samples.iter().skip(begin).take(end - begin) {
                mean_ang_vel += sample.angular_velocity;
            }
            mean_ang_vel /= (end - begin) as f64;
        }

        let cam0_mean_ang_vel = calib.r_cam0_imu.transpose() * mean_ang_vel;
        let cam1_mean_ang_vel = calib.r_cam1_imu.transpose() * mean_ang_vel;

        let dt = curr_ts - prev_ts;
        let cam0_r_p_c = exp_so3(&(cam0_mean_ang_vel * dt)).transpose();
        let cam1_r_p_c = exp_so3(&(cam1_mean_ang_vel * dt)).transpose();

        self.samples.drain(..end);

        (cam0_r_p_c, cam1_r_p_c)
    }
}
