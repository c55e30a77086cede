//! Pinhole camera model with radial-tangential or equidistant distortion.
//!
//! Converts between raw pixel coordinates and rectified normalized
//! coordinates. Both directions operate on point slices so the callers can
//! batch whole feature sets.

mod calibration;

pub use calibration::StereoCalibration;

use std::sync::Once;

use nalgebra::{Matrix3, Point2, Vector3};
use tracing::warn;

/// Distortion models understood by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionModel {
    /// 4-parameter Brown radial-tangential model (k1, k2, p1, p2).
    RadTan,
    /// 4-parameter fisheye model (k1..k4) over the incidence angle.
    Equidistant,
}

static UNKNOWN_MODEL_WARNING: Once = Once::new();

impl DistortionModel {
    /// Parse a calibration tag. Unrecognized tags fall back to `RadTan` and
    /// warn once per process.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "radtan" | "radial-tangential" | "plumb_bob" => Self::RadTan,
            "equidistant" => Self::Equidistant,
            other => {
                UNKNOWN_MODEL_WARNING.call_once(|| {
                    warn!("The model {} is unrecognized, use radtan instead...", other);
                });
                Self::RadTan
            }
        }
    }
}

/// A single calibrated camera.
#[derive(Debug, Clone)]
pub struct CameraModel {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Intrinsics `[fx, fy, cx, cy]`.
    pub intrinsics: [f64; 4],
    pub distortion_model: DistortionModel,
    pub distortion_coeffs: [f64; 4],
}

/// Number of fixed-point iterations used to invert the distortion models.
const UNDISTORT_ITERATIONS: usize = 8;

impl CameraModel {
    pub fn new(
        width: u32,
        height: u32,
        intrinsics: [f64; 4],
        distortion_model: DistortionModel,
        distortion_coeffs: [f64; 4],
    ) -> Self {
        Self {
            width,
            height,
            intrinsics,
            distortion_model,
            distortion_coeffs,
        }
    }

    /// The 3×3 intrinsic matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        let [fx, fy, cx, cy] = self.intrinsics;
        Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
    }

    /// Whether a pixel lies inside the image rectangle.
    pub fn contains(&self, pt: &Point2<f64>) -> bool {
        pt.x >= 0.0
            && pt.x <= (self.width - 1) as f64
            && pt.y >= 0.0
            && pt.y <= (self.height - 1) as f64
    }

    /// Undistort pixels into the rectified frame defined by `rectification`
    /// and re-project with `new_intrinsics`.
    ///
    /// With the identity rectification and unit intrinsics this yields
    /// normalized coordinates, i.e. `K⁻¹ [u v 1]ᵀ` with the distortion
    /// removed.
    pub fn undistort_points(
        &self,
        pts: &[Point2<f64>],
        rectification: &Matrix3<f64>,
        new_intrinsics: [f64; 4],
    ) -> Vec<Point2<f64>> {
        let [fx, fy, cx, cy] = self.intrinsics;
        let [fx_new, fy_new, cx_new, cy_new] = new_intrinsics;

        pts.iter()
            .map(|pt| {
                let distorted = Point2::new((pt.x - cx) / fx, (pt.y - cy) / fy);
                let normalized = match self.distortion_model {
                    DistortionModel::RadTan => {
                        invert_radtan(&distorted, &self.distortion_coeffs)
                    }
                    DistortionModel::Equidistant => {
                        invert_equidistant(&distorted, &self.distortion_coeffs)
                    }
                };
                let rectified =
                    rectification * Vector3::new(normalized.x, normalized.y, 1.0);
                let x = rectified.x / rectified.z;
                let y = rectified.y / rectified.z;
                Point2::new(fx_new * x + cx_new, fy_new * y + cy_new)
            })
            .collect()
    }

    /// Undistort pixels straight into normalized coordinates.
    pub fn undistort_to_normalized(&self, pts: &[Point2<f64>]) -> Vec<Point2<f64>> {
        self.undistort_points(pts, &Matrix3::identity(), [1.0, 1.0, 0.0, 0.0])
    }

    /// Forward-project normalized points through the distortion model into
    /// pixel coordinates.
    pub fn distort_points(&self, pts: &[Point2<f64>]) -> Vec<Point2<f64>> {
        let [fx, fy, cx, cy] = self.intrinsics;

        pts.iter()
            .map(|pt| {
                let distorted = match self.distortion_model {
                    DistortionModel::RadTan => apply_radtan(pt, &self.distortion_coeffs),
                    DistortionModel::Equidistant => {
                        apply_equidistant(pt, &self.distortion_coeffs)
                    }
                };
                Point2::new(fx * distorted.x + cx, fy * distorted.y + cy)
            })
            .collect()
    }
}

/// Forward Brown model: normalized point -> distorted normalized point.
fn apply_radtan(pt: &Point2<f64>, coeffs: &[f64; 4]) -> Point2<f64> {
    let [k1, k2, p1, p2] = *coeffs;
    let (x, y) = (pt.x, pt.y);
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
    Point2::new(
        x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
        y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
}

/// Iterative inverse of the Brown model.
fn invert_radtan(distorted: &Point2<f64>, coeffs: &[f64; 4]) -> Point2<f64> {
    let [k1, k2, p1, p2] = *coeffs;
    let (xd, yd) = (distorted.x, distorted.y);
    let mut x = xd;
    let mut y = yd;
    for _ in 0..UNDISTORT_ITERATIONS {
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        x = (xd - dx) / radial;
        y = (yd - dy) / radial;
    }
    Point2::new(x, y)
}

/// Forward fisheye model over the incidence angle θ.
fn apply_equidistant(pt: &Point2<f64>, coeffs: &[f64; 4]) -> Point2<f64> {
    let [k1, k2, k3, k4] = *coeffs;
    let r = (pt.x * pt.x + pt.y * pt.y).sqrt();
    if r < 1e-12 {
        return *pt;
    }
    let theta = r.atan();
    let theta2 = theta * theta;
    let theta_d =
        theta * (1.0 + k1 * theta2 + k2 * theta2.powi(2) + k3 * theta2.powi(3) + k4 * theta2.powi(4));
    let scale = theta_d / r;
    Point2::new(pt.x * scale, pt.y * scale)
}

/// Fixed-point inverse of the fisheye angle polynomial.
fn invert_equidistant(distorted: &Point2<f64>, coeffs: &[f64; 4]) -> Point2<f64> {
    let [k1, k2, k3, k4] = *coeffs;
    let theta_d = (distorted.x * distorted.x + distorted.y * distorted.y).sqrt();
    if theta_d < 1e-12 {
        return *distorted;
    }
    let mut theta = theta_d;
    for _ in 0..UNDISTORT_ITERATIONS {
        let theta2 = theta * theta;
        let polynomial = 1.0
            + k1 * theta2
            + k2 * theta2.powi(2)
            + k3 * theta2.powi(3)
            + k4 * theta2.powi(4);
        theta = theta_d / polynomial;
    }
    let scale = theta.tan() / theta_d;
    Point2::new(distorted.x * scale, distorted.y * scale)
}
