//! Sparse pyramidal Lucas–Kanade tracking.
//!
//! Coarse-to-fine Gauss–Newton on a fixed template window. Callers always
//! provide an initial guess for the tracked location (the rotation-predicted
//! point for temporal tracking, the extrinsics-projected point for stereo
//! matching); the solver refines it level by level.

use nalgebra::Point2;
use rayon::prelude::*;

use super::Pyramid;

/// Minimum accepted eigenvalue of the window-averaged structure tensor.
const MIN_EIGEN_THRESHOLD: f32 = 1e-4;

/// Solver parameters.
#[derive(Debug, Clone)]
pub struct LkParams {
    /// Integration window size in pixels (odd).
    pub win_size: usize,
    /// Highest pyramid level used (level count is `max_level + 1`).
    pub max_level: usize,
    /// Gauss–Newton iteration cap per level.
    pub max_iter: usize,
    /// Convergence epsilon on the incremental update, in pixels.
    pub epsilon: f64,
}

/// Track `prev_pts` from `prev` into `next`, starting from `initial_pts`.
///
/// Returns the refined locations and a per-point success flag. Output length
/// equals input length; failed points keep their initial location.
pub fn track(
    prev: &Pyramid,
    next: &Pyramid,
    prev_pts: &[Point2<f64>],
    initial_pts: &[Point2<f64>],
    params: &LkParams,
) -> (Vec<Point2<f64>>, Vec<bool>) {
    assert_eq!(prev_pts.len(), initial_pts.len());
    assert!(prev.num_levels() > params.max_level);
    assert!(next.num_levels() > params.max_level);

    let results: Vec<(Point2<f64>, bool)> = prev_pts
        .par_iter()
        .zip(initial_pts.par_iter())
        .map(|(pt, init)| track_feature(prev, next, pt, init, params))
        .collect();

    let mut next_pts = Vec::with_capacity(results.len());
    let mut status = Vec::with_capacity(results.len());
    for (pt, ok) in results {
        next_pts.push(pt);
        status.push(ok);
    }
    (next_pts, status)
}

fn track_feature(
    prev: &Pyramid,
    next: &Pyramid,
    pt: &Point2<f64>,
    init: &Point2<f64>,
    params: &LkParams,
) -> (Point2<f64>, bool) {
    let half = (params.win_size / 2) as isize;
    let win_pixels = params.win_size * params.win_size;

    let top_scale = 1.0 / (1u32 << params.max_level) as f32;
    let mut dx = (init.x - pt.x) as f32 * top_scale;
    let mut dy = (init.y - pt.y) as f32 * top_scale;

    let mut template = vec![0.0f32; win_pixels];
    let mut grad_x_patch = vec![0.0f32; win_pixels];
    let mut grad_y_patch = vec![0.0f32; win_pixels];

    for level in (0..=params.max_level).rev() {
        let scale = 1.0 / (1u32 << level) as f32;
        let xc = pt.x as f32 * scale;
        let yc = pt.y as f32 * scale;

        if level < params.max_level {
            dx *= 2.0;
            dy *= 2.0;
        }

        let prev_plane = &prev.levels[level];
        let next_plane = &next.levels[level];
        let grad_x = &prev.grad_x[level];
        let grad_y = &prev.grad_y[level];

        // Template and structure tensor around the source point.
        let mut a = 0.0f32;
        let mut b = 0.0f32;
        let mut c = 0.0f32;
        let mut idx = 0;
        for wy in -half..=half {
            for wx in -half..=half {
                let px = xc + wx as f32;
                let py = yc + wy as f32;
                let intensity = prev_plane.bilinear(px, py);
                let gx = grad_x.bilinear(px, py);
                let gy = grad_y.bilinear(px, py);
                template[idx] = intensity;
                grad_x_patch[idx] = gx;
                grad_y_patch[idx] = gy;
                a += gx * gx;
                b += gx * gy;
                c += gy * gy;
                idx += 1;
            }
        }

        let det = a * c - b * b;
        if det.abs() < 1e-7 {
            return (*init, false);
        }
        let trace = a + c;
        let delta = a - c;
        let lambda_min = (trace - (delta * delta + 4.0 * b * b).sqrt()) * 0.5;
        if lambda_min / (win_pixels as f32) < MIN_EIGEN_THRESHOLD {
            return (*init, false);
        }
        let inv_det = 1.0 / det;

        for _ in 0..params.max_iter {
            let xn = xc + dx;
            let yn = yc + dy;

            let mut d = 0.0f32;
            let mut e = 0.0f32;
            let mut idx = 0;
            for wy in -half..=half {
                for wx in -half..=half {
                    let residual =
                        next_plane.bilinear(xn + wx as f32, yn + wy as f32) - template[idx];
                    d -= grad_x_patch[idx] * residual;
                    e -= grad_y_patch[idx] * residual;
                    idx += 1;
                }
            }

            let step_x = inv_det * (c * d - b * e);
            let step_y = inv_det * (-b * d + a * e);
            dx += step_x;
            dy += step_y;

            if !dx.is_finite() || !dy.is_finite() {
                return (*init, false);
            }
            if ((step_x * step_x + step_y * step_y) as f64) < params.epsilon * params.epsilon {
                break;
            }
        }
    }

    let tracked = Point2::new(pt.x + dx as f64, pt.y + dy as f64);
    (tracked, tracked.x.is_finite() && tracked.y.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn textured_image(size: u32, shift_x: f32, shift_y: f32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let xf = x as f32 - shift_x;
            let yf = y as f32 - shift_y;
            let v = 128.0
                + 50.0 * (0.13 * xf).sin()
                + 50.0 * (0.17 * yf).cos()
                + 25.0 * (0.07 * (xf + yf)).sin();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    fn params() -> LkParams {
        LkParams {
            win_size: 21,
            max_level: 3,
            max_iter: 30,
            epsilon: 0.01,
        }
    }

    #[test]
    fn test_zero_motion_stays_put() {
        let pyramid = Pyramid::build(&textured_image(128, 0.0, 0.0), 3);
        let pts = vec![Point2::new(64.0, 64.0), Point2::new(40.0, 80.0)];

        let (tracked, status) = track(&pyramid, &pyramid, &pts, &pts, &params());

        for (p, (t, ok)) in pts.iter().zip(tracked.iter().zip(status.iter())) {
            assert!(ok);
            assert!((t.x - p.x).abs() < 0.1 && (t.y - p.y).abs() < 0.1);
        }
    }

    #[test]
    fn test_recovers_translation() {
        let prev = Pyramid::build(&textured_image(128, 0.0, 0.0), 3);
        let next = Pyramid::build(&textured_image(128, 5.0, -3.0), 3);
        let pts = vec![Point2::new(64.0, 64.0)];

        let (tracked, status) = track(&prev, &next, &pts, &pts, &params());

        assert!(status[0]);
        assert!((tracked[0].x - 69.0).abs() < 0.5, "dx = {}", tracked[0].x - 64.0);
        assert!((tracked[0].y - 61.0).abs() < 0.5, "dy = {}", tracked[0].y - 64.0);
    }

    #[test]
    fn test_initial_guess_speeds_convergence_to_large_motion() {
        let prev = Pyramid::build(&textured_image(128, 0.0, 0.0), 3);
        let next = Pyramid::build(&textured_image(128, 14.0, 0.0), 3);
        let pts = vec![Point2::new(56.0, 64.0)];
        let init = vec![Point2::new(69.0, 64.0)];

        let (tracked, status) = track(&prev, &next, &pts, &init, &params());

        assert!(status[0]);
        assert!((tracked[0].x - 70.0).abs() < 0.5);
    }

    #[test]
    fn test_flat_region_is_rejected() {
        let flat = Pyramid::build(&GrayImage::from_pixel(128, 128, image::Luma([127])), 3);
        let pts = vec![Point2::new(64.0, 64.0)];

        let (_, status) = track(&flat, &flat, &pts, &pts, &params());
        assert!(!status[0]);
    }
}
