//! Stereo rig calibration.
//!
//! Written once at initialization, read-shared afterwards. Rotations follow
//! the convention of the source calibration files: `r_cam0_imu` takes a
//! vector expressed in the cam0 frame into the IMU frame, so its transpose
//! maps IMU-frame angular velocity into the camera frame.

use nalgebra::{Matrix3, Matrix4, Vector3};
use tracing::info;

use crate::geometry::skew;

use super::CameraModel;

/// Immutable calibration of the stereo rig and its mounting on the IMU.
#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub cam0: CameraModel,
    pub cam1: CameraModel,
    pub r_cam0_imu: Matrix3<f64>,
    pub t_cam0_imu: Vector3<f64>,
    pub r_cam1_imu: Matrix3<f64>,
    pub t_cam1_imu: Vector3<f64>,
}

impl StereoCalibration {
    /// Build the rig from the two camera models plus the homogeneous
    /// transforms `T_imu_cam0` (IMU frame to cam0 frame) and `T_cam0_cam1`
    /// (cam0 frame to cam1 frame).
    pub fn new(
        cam0: CameraModel,
        cam1: CameraModel,
        t_imu_cam0: &Matrix4<f64>,
        t_cam0_cam1: &Matrix4<f64>,
    ) -> Self {
        let (r_imu_cam0, t_imu_cam0_vec) = split_transform(t_imu_cam0);
        let r_cam0_imu = r_imu_cam0.transpose();
        let t_cam0_imu = -r_imu_cam0.transpose() * t_imu_cam0_vec;

        let t_imu_cam1 = t_cam0_cam1 * t_imu_cam0;
        let (r_imu_cam1, t_imu_cam1_vec) = split_transform(&t_imu_cam1);
        let r_cam1_imu = r_imu_cam1.transpose();
        let t_cam1_imu = -r_imu_cam1.transpose() * t_imu_cam1_vec;

        Self {
            cam0,
            cam1,
            r_cam0_imu,
            t_cam0_imu,
            r_cam1_imu,
            t_cam1_imu,
        }
    }

    /// Rotation taking a vector in the cam0 frame to the cam1 frame.
    pub fn r_cam0_cam1(&self) -> Matrix3<f64> {
        self.r_cam1_imu.transpose() * self.r_cam0_imu
    }

    /// Position of the cam0 origin expressed in the cam1 frame.
    pub fn t_cam0_cam1(&self) -> Vector3<f64> {
        self.r_cam1_imu.transpose() * (self.t_cam0_imu - self.t_cam1_imu)
    }

    /// Essential matrix of the stereo pair, `E = [t]× R`.
    pub fn essential(&self) -> Matrix3<f64> {
        skew(&self.t_cam0_cam1()) * self.r_cam0_cam1()
    }

    /// One pixel expressed in normalized units, `1/f̄`, with the focal length
    /// averaged over both cameras.
    pub fn stereo_norm_pixel_unit(&self) -> f64 {
        4.0 / (self.cam0.intrinsics[0]
            + self.cam0.intrinsics[1]
            + self.cam1.intrinsics[0]
            + self.cam1.intrinsics[1])
    }

    /// Echo the calibration at INFO, once, after loading.
    pub fn log_summary(&self) {
        info!("cam0_resolution: {}, {}", self.cam0.width, self.cam0.height);
        info!(
            "cam0_intrinsics: {:?} distortion_model: {:?} coefficients: {:?}",
            self.cam0.intrinsics, self.cam0.distortion_model, self.cam0.distortion_coeffs
        );
        info!("cam1_resolution: {}, {}", self.cam1.width, self.cam1.height);
        info!(
            "cam1_intrinsics: {:?} distortion_model: {:?} coefficients: {:?}",
            self.cam1.intrinsics, self.cam1.distortion_model, self.cam1.distortion_coeffs
        );
        info!("baseline: {:.4} m", self.t_cam0_cam1().norm());
    }
}

fn split_transform(t: &Matrix4<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    (
        t.fixed_view::<3, 3>(0, 0).into_owned(),
        t.fixed_view::<3, 1>(0, 3).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::DistortionModel;
    use approx::assert_relative_eq;

    fn pinhole(width: u32, height: u32) -> CameraModel {
        CameraModel::new(
            width,
            height,
            [400.0, 400.0, 320.0, 240.0],
            DistortionModel::RadTan,
            [0.0; 4],
        )
    }

    /// A rig with the IMU coincident with cam0 and cam1 offset by a pure
    /// baseline along x.
    fn horizontal_rig(baseline: f64) -> StereoCalibration {
        let t_imu_cam0 = Matrix4::identity();
        let mut t_cam0_cam1 = Matrix4::identity();
        t_cam0_cam1[(0, 3)] = -baseline;
        StereoCalibration::new(pinhole(640, 480), pinhole(640, 480), &t_imu_cam0, &t_cam0_cam1)
    }

    #[test]
    fn test_horizontal_rig_extrinsics() {
        let calib = horizontal_rig(0.11);

        assert_relative_eq!(calib.r_cam0_cam1(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(
            calib.t_cam0_cam1(),
            Vector3::new(-0.11, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_essential_annihilates_corresponding_points() {
        let calib = horizontal_rig(0.11);
        let e = calib.essential();

        // A point at depth z projects to the same normalized y in both
        // cameras; any such pair must satisfy the epipolar constraint.
        let z = 4.0;
        let p = Vector3::new(0.3, -0.2, 1.0);
        let p_right = Vector3::new(0.3 - 0.11 / z, -0.2, 1.0);

        let residual = p_right.dot(&(e * p));
        assert_relative_eq!(residual, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_norm_pixel_unit_is_inverse_mean_focal() {
        let calib = horizontal_rig(0.1);
        assert_relative_eq!(calib.stereo_norm_pixel_unit(), 1.0 / 400.0, epsilon = 1e-12);
    }
}
