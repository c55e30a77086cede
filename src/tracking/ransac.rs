//! Two-point RANSAC for temporal outlier rejection.
//!
//! With the inter-frame rotation known from gyro integration, the epipolar
//! residual of a matched pair is linear in the unknown translation:
//!
//! ```text
//! a(i)·t_x + b(i)·t_y + c(i)·t_z = 0
//! a(i) = y₁ᵢ − y₂ᵢ
//! b(i) = −(x₁ᵢ − x₂ᵢ)
//! c(i) = x₁ᵢ·y₂ᵢ − y₁ᵢ·x₂ᵢ
//! ```
//!
//! so two correspondences determine the translation up to scale.

use std::time::{Duration, Instant};

use nalgebra::{Matrix2, Matrix3, Point2, Vector2, Vector3};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{error, warn};

use crate::camera::CameraModel;

/// Displacements beyond this many pixels are rejected before sampling.
const MAX_DISPLACEMENT_PIXELS: f64 = 50.0;

/// Minimum spacing of degenerate-motion warnings.
const DEGENERATE_WARNING_PERIOD: Duration = Duration::from_secs(1);

static LAST_DEGENERATE_WARNING: Mutex<Option<Instant>> = Mutex::new(None);

fn warn_degenerate_motion() {
    let mut last = LAST_DEGENERATE_WARNING.lock();
    match *last {
        Some(instant) if instant.elapsed() < DEGENERATE_WARNING_PERIOD => {}
        _ => {
            *last = Some(Instant::now());
            warn!("Degenerated motion...");
        }
    }
}

/// A hypothesis must explain at least this fraction of the input.
const MIN_INLIER_FRACTION: f64 = 0.2;

/// Identify the matched pairs of `pts1` (time t−1) and `pts2` (time t),
/// both raw pixels of a single camera, that are consistent with one unknown
/// translation under the known rotation `r_p_c`.
///
/// Returns a mask of the original input length. A size mismatch between the
/// two sets is a caller contract violation: it is logged and everything is
/// marked outlier.
pub fn two_point_ransac(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
    r_p_c: &Matrix3<f64>,
    camera: &CameraModel,
    inlier_error: f64,
    success_probability: f64,
    rng: &mut impl Rng,
) -> Vec<bool> {
    if pts1.len() != pts2.len() {
        error!(
            "Sets of different size ({} and {}) are used...",
            pts1.len(),
            pts2.len()
        );
        return vec![false; pts1.len()];
    }
    let n = pts1.len();
    if n == 0 {
        return Vec::new();
    }

    // One pixel expressed in normalized units.
    let mut norm_pixel_unit = 2.0 / (camera.intrinsics[0] + camera.intrinsics[1]);
    let iter_num = ((1.0 - success_probability).ln() / (1.0f64 - 0.7 * 0.7).ln()).ceil() as usize;

    let mut markers = vec![true; n];

    let mut pts1_undistorted = camera.undistort_to_normalized(pts1);
    let mut pts2_undistorted = camera.undistort_to_normalized(pts2);

    // Compensate the previous points with the known rotation so only the
    // translation separates the two sets.
    for pt in pts1_undistorted.iter_mut() {
        let rotated = r_p_c * Vector3::new(pt.x, pt.y, 1.0);
        pt.x = rotated.x;
        pt.y = rotated.y;
    }

    // Rescale both sets so the mean magnitude is √2; conditions the 2×2
    // solves when points cluster near the principal point.
    let magnitude_sum: f64 = pts1_undistorted
        .iter()
        .chain(pts2_undistorted.iter())
        .map(|p| p.coords.norm())
        .sum();
    if magnitude_sum > f64::EPSILON {
        let scaling_factor = (2 * n) as f64 / magnitude_sum * 2.0_f64.sqrt();
        for pt in pts1_undistorted.iter_mut().chain(pts2_undistorted.iter_mut()) {
            pt.coords *= scaling_factor;
        }
        norm_pixel_unit *= scaling_factor;
    }

    let pts_diff: Vec<Vector2<f64>> = pts1_undistorted
        .iter()
        .zip(pts2_undistorted.iter())
        .map(|(p1, p2)| p1.coords - p2.coords)
        .collect();

    // Reject pairs with an obviously large displacement; the mean of the
    // remainder decides whether the motion is degenerate.
    let mut mean_pt_distance = 0.0;
    let mut raw_inlier_cntr = 0usize;
    for (i, diff) in pts_diff.iter().enumerate() {
        let distance = diff.norm();
        if distance > MAX_DISPLACEMENT_PIXELS * norm_pixel_unit {
            markers[i] = false;
        } else {
            mean_pt_distance += distance;
            raw_inlier_cntr += 1;
        }
    }

    // Too few survivors can happen under fast rotation; give up outright.
    if raw_inlier_cntr < 3 {
        return vec![false; n];
    }
    mean_pt_distance /= raw_inlier_cntr as f64;

    // Near-pure rotation leaves nothing for the translation model to
    // explain; fall back to a plain displacement gate.
    if mean_pt_distance < norm_pixel_unit {
        warn_degenerate_motion();
        for (i, diff) in pts_diff.iter().enumerate() {
            if !markers[i] {
                continue;
            }
            if diff.norm() > inlier_error * norm_pixel_unit {
                markers[i] = false;
            }
        }
        return markers;
    }

    // Coefficient rows of the translation model, one per pair.
    let coeff: Vec<Vector3<f64>> = pts_diff
        .iter()
        .enumerate()
        .map(|(i, diff)| {
            Vector3::new(
                diff.y,
                -diff.x,
                pts1_undistorted[i].x * pts2_undistorted[i].y
                    - pts1_undistorted[i].y * pts2_undistorted[i].x,
            )
        })
        .collect();

    let raw_inlier_idx: Vec<usize> = markers
        .iter()
        .enumerate()
        .filter_map(|(i, &m)| if m { Some(i) } else { None })
        .collect();

    let threshold = inlier_error * norm_pixel_unit;
    let mut best_inlier_set: Vec<usize> = Vec::new();

    for _ in 0..iter_num {
        // Draw two distinct survivors in one shot: an index plus a positive
        // offset modulo the survivor count.
        let m = raw_inlier_idx.len();
        let first = rng.gen_range(0..m);
        let second = (first + rng.gen_range(1..m)) % m;
        let pair_idx1 = raw_inlier_idx[first];
        let pair_idx2 = raw_inlier_idx[second];

        let (model, base) = match solve_two_rows(&coeff[pair_idx1], &coeff[pair_idx2]) {
            Some(solution) => solution,
            None => continue,
        };

        let inlier_set: Vec<usize> = (0..n)
            .filter(|&i| markers[i] && (coeff[i].dot(&model)).abs() < threshold)
            .collect();

        if (inlier_set.len() as f64) < MIN_INLIER_FRACTION * n as f64 {
            continue;
        }

        // Refit on the hypothesis' inliers with the same pinning choice and
        // rescore with the refined model; keep whichever support set is
        // larger.
        let mut final_set = inlier_set;
        if let Some(better) = refit_least_squares(&coeff, &final_set, base) {
            let refined_set: Vec<usize> = (0..n)
                .filter(|&i| markers[i] && (coeff[i].dot(&better)).abs() < threshold)
                .collect();
            if refined_set.len() > final_set.len() {
                final_set = refined_set;
            }
        }

        if final_set.len() > best_inlier_set.len() {
            best_inlier_set = final_set;
        }
    }

    let mut result = vec![false; n];
    for idx in best_inlier_set {
        result[idx] = true;
    }
    result
}

/// Solve the 2×3 system of two coefficient rows for the translation, pinning
/// the component whose column has the smallest L1 norm to 1 so the remaining
/// 2×2 sub-system is built from the two largest columns. Returns the model
/// and the pinned column.
fn solve_two_rows(row1: &Vector3<f64>, row2: &Vector3<f64>) -> Option<(Vector3<f64>, usize)> {
    let l1_norms = [
        row1.x.abs() + row2.x.abs(),
        row1.y.abs() + row2.y.abs(),
        row1.z.abs() + row2.z.abs(),
    ];
    let mut base = 0;
    for candidate in 1..3 {
        if l1_norms[candidate] < l1_norms[base] {
            base = candidate;
        }
    }

    let (a, rhs) = match base {
        0 => (
            Matrix2::new(row1.y, row1.z, row2.y, row2.z),
            Vector2::new(-row1.x, -row2.x),
        ),
        1 => (
            Matrix2::new(row1.x, row1.z, row2.x, row2.z),
            Vector2::new(-row1.y, -row2.y),
        ),
        _ => (
            Matrix2::new(row1.x, row1.y, row2.x, row2.y),
            Vector2::new(-row1.z, -row2.z),
        ),
    };

    let solution = a.try_inverse()? * rhs;
    let model = match base {
        0 => Vector3::new(1.0, solution.x, solution.y),
        1 => Vector3::new(solution.x, 1.0, solution.y),
        _ => Vector3::new(solution.x, solution.y, 1.0),
    };
    Some((model, base))
}

/// Least-squares refit over an inlier set, keeping the pinned component of
/// the minimal solve.
fn refit_least_squares(
    coeff: &[Vector3<f64>],
    inlier_set: &[usize],
    base: usize,
) -> Option<Vector3<f64>> {
    // Normal equations of the n×2 system formed by the two free columns.
    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    for &i in inlier_set {
        let row = coeff[i];
        let (u, v, w) = match base {
            0 => (row.y, row.z, row.x),
            1 => (row.x, row.z, row.y),
            _ => (row.x, row.y, row.z),
        };
        ata[(0, 0)] += u * u;
        ata[(0, 1)] += u * v;
        ata[(1, 0)] += u * v;
        ata[(1, 1)] += v * v;
        atb.x -= u * w;
        atb.y -= v * w;
    }

    let solution = ata.try_inverse()? * atb;
    Some(match base {
        0 => Vector3::new(1.0, solution.x, solution.y),
        1 => Vector3::new(solution.x, 1.0, solution.y),
        _ => Vector3::new(solution.x, solution.y, 1.0),
    })
}
