//! SO(3) utilities for short-horizon gyro integration.
//!
//! Provides skew-symmetric matrix construction and the Rodrigues exponential
//! used to turn a mean angular velocity into an inter-frame rotation.

use nalgebra::{Matrix3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rodrigues exponential: maps an axis-angle vector φ to a rotation matrix.
///
/// ```text
/// exp(φ) = I + sin|φ|/|φ| [φ]× + (1 - cos|φ|)/|φ|² [φ]×²
/// ```
///
/// For small angles (|φ| < ε) the first-order approximation `I + [φ]×` is
/// used instead.
pub fn exp_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + skew(phi);
    }

    let theta_sq = theta * theta;
    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity()
        + (theta.sin() / theta) * skew_phi
        + ((1.0 - theta.cos()) / theta_sq) * skew_phi_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_identity_at_zero() {
        let r = exp_so3(&Vector3::zeros());
        assert_relative_eq!(r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_quarter_turn_about_z() {
        let r = exp_so3(&Vector3::new(0.0, 0.0, FRAC_PI_2));
        let rotated = r * Vector3::new(1.0, 0.0, 0.0);

        assert_relative_eq!(rotated, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_is_orthonormal() {
        let r = exp_so3(&Vector3::new(0.3, -0.2, 0.5));

        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_inverse_is_transpose() {
        let phi = Vector3::new(0.1, 0.2, 0.3);
        let r = exp_so3(&phi);
        let r_inv = exp_so3(&-phi);

        assert_relative_eq!(r.transpose(), r_inv, epsilon = 1e-10);
    }
}
