//! End-to-end scenarios for the tracker engine: cold start on textureless and
//! textured frames, a static sequence, a gyro-compensated rotation, and an
//! injected stereo mismatch.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix4, Vector3};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vio_frontend::camera::{CameraModel, DistortionModel, StereoCalibration};
use vio_frontend::config::ProcessorConfig;
use vio_frontend::geometry::exp_so3;
use vio_frontend::imu::{ImuBuffer, ImuSample};
use vio_frontend::system::messages::{FeatureMeasurement, StereoFrame, TrackingInfo};
use vio_frontend::tracking::TrackerEngine;

const WIDTH: u32 = 256;
const HEIGHT: u32 = 192;
const INTRINSICS: [f64; 4] = [200.0, 200.0, 128.0, 96.0];
const FRAME_INTERVAL: f64 = 0.05;

fn rig() -> Arc<StereoCalibration> {
    let cam = CameraModel::new(
        WIDTH,
        HEIGHT,
        INTRINSICS,
        DistortionModel::RadTan,
        [0.0; 4],
    );
    let mut t_cam0_cam1 = Matrix4::identity();
    t_cam0_cam1[(0, 3)] = -0.1;
    Arc::new(StereoCalibration::new(
        cam.clone(),
        cam,
        &Matrix4::identity(),
        &t_cam0_cam1,
    ))
}

struct Harness {
    engine: TrackerEngine,
    imu_buffer: Arc<Mutex<ImuBuffer>>,
    features: Receiver<FeatureMeasurement>,
    info: Receiver<TrackingInfo>,
}

impl Harness {
    fn new() -> Self {
        let (feature_tx, feature_rx) = unbounded();
        let (info_tx, info_rx) = unbounded();
        let imu_buffer = Arc::new(Mutex::new(ImuBuffer::new()));
        let engine = TrackerEngine::new(
            ProcessorConfig::default(),
            rig(),
            imu_buffer.clone(),
            feature_tx,
            info_tx,
            None,
        );
        Self {
            engine,
            imu_buffer,
            features: feature_rx,
            info: info_rx,
        }
    }

    fn step(&mut self, frame: &StereoFrame) -> (FeatureMeasurement, TrackingInfo) {
        self.engine.process_frame(frame);
        (
            self.features.recv().expect("measurement emitted"),
            self.info.recv().expect("tracking info emitted"),
        )
    }
}

/// A dark canvas with one bright square per grid cell; every square corner is
/// a FAST corner.
fn squares_scene() -> GrayImage {
    let mut image = GrayImage::from_pixel(WIDTH, HEIGHT, image::Luma([15]));
    for row in 0..4u32 {
        for col in 0..4u32 {
            let x0 = col * 64 + 18 + (row * 5) % 13;
            let y0 = row * 48 + 12 + (col * 7) % 11;
            let intensity = 150 + 20 * ((row + col) % 4) as u8;
            for y in y0..y0 + 12 {
                for x in x0..x0 + 12 {
                    image.put_pixel(x, y, image::Luma([intensity]));
                }
            }
        }
    }
    image
}

/// `squares_scene` with the listed cells' squares drawn at a per-cell offset
/// instead of their true location.
fn squares_scene_with_displaced_cells(displaced: &[(u32, u32, i32, i32)]) -> GrayImage {
    let mut image = GrayImage::from_pixel(WIDTH, HEIGHT, image::Luma([15]));
    for row in 0..4u32 {
        for col in 0..4u32 {
            let mut x0 = (col * 64 + 18 + (row * 5) % 13) as i32;
            let mut y0 = (row * 48 + 12 + (col * 7) % 11) as i32;
            if let Some(&(_, _, dx, dy)) = displaced.iter().find(|d| d.0 == row && d.1 == col) {
                x0 += dx;
                y0 += dy;
            }
            let intensity = 150 + 20 * ((row + col) % 4) as u8;
            for y in y0..y0 + 12 {
                for x in x0..x0 + 12 {
                    image.put_pixel(x as u32, y as u32, image::Luma([intensity]));
                }
            }
        }
    }
    image
}

fn stereo_frame(image: &GrayImage, timestamp: f64) -> StereoFrame {
    StereoFrame {
        timestamp,
        cam0: image.clone(),
        cam1: image.clone(),
    }
}

fn bilinear_u8(image: &GrayImage, x: f64, y: f64) -> u8 {
    let xf = x.clamp(0.0, (image.width() - 1) as f64);
    let yf = y.clamp(0.0, (image.height() - 1) as f64);
    let x0 = xf.floor() as u32;
    let y0 = yf.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let alpha = xf - x0 as f64;
    let beta = yf - y0 as f64;

    let sample = |x: u32, y: u32| image.get_pixel(x, y).0[0] as f64;
    let value = (1.0 - alpha) * (1.0 - beta) * sample(x0, y0)
        + alpha * (1.0 - beta) * sample(x1, y0)
        + (1.0 - alpha) * beta * sample(x0, y1)
        + alpha * beta * sample(x1, y1);
    value.round() as u8
}

/// Warp an image with the homography of a pure camera rotation, so that
/// content at `H p` in the output matches `p` in the input.
fn warp_by_rotation(image: &GrayImage, r_p_c: &Matrix3<f64>) -> GrayImage {
    let [fx, fy, cx, cy] = INTRINSICS;
    let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
    let k_inv = Matrix3::new(
        1.0 / fx,
        0.0,
        -cx / fx,
        0.0,
        1.0 / fy,
        -cy / fy,
        0.0,
        0.0,
        1.0,
    );
    let h = k * r_p_c * k_inv;
    let h_inv = h.try_inverse().expect("rotation homography is invertible");

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let source = h_inv * Vector3::new(x as f64, y as f64, 1.0);
        image::Luma([bilinear_u8(
            image,
            source.x / source.z,
            source.y / source.z,
        )])
    })
}

#[test]
fn cold_start_on_textureless_image_emits_nothing() {
    let mut harness = Harness::new();
    let gray = GrayImage::from_pixel(WIDTH, HEIGHT, image::Luma([128]));

    let (measurement, info) = harness.step(&stereo_frame(&gray, 0.0));
    assert!(measurement.features.is_empty());
    assert_eq!(info.before_tracking, 0);
    assert_eq!(info.after_ransac, 0);

    // The engine is out of its first-frame state and survives another empty
    // frame.
    let (measurement, _) = harness.step(&stereo_frame(&gray, FRAME_INTERVAL));
    assert!(measurement.features.is_empty());
}

#[test]
fn cold_start_on_dense_corners_fills_every_cell_to_the_minimum() {
    let mut harness = Harness::new();
    let config = ProcessorConfig::default();

    let (measurement, info) = harness.step(&stereo_frame(&squares_scene(), 0.0));

    // One square per cell gives each cell enough stereo-matched corners to
    // reach the replenishment target exactly.
    let expected = config.grid_row * config.grid_col * config.grid_min_feature_num;
    assert_eq!(measurement.features.len(), expected);

    // First frame reports defined-zero counters.
    assert_eq!(info.before_tracking, 0);
    assert_eq!(info.after_tracking, 0);
    assert_eq!(info.after_matching, 0);
    assert_eq!(info.after_ransac, 0);

    // Ids are unique at birth.
    let mut ids: Vec<u64> = measurement.features.iter().map(|f| f.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), expected);
}

#[test]
fn static_scene_keeps_identities_across_frames() {
    let mut harness = Harness::new();
    let scene = squares_scene();

    let (first, _) = harness.step(&stereo_frame(&scene, 0.0));
    let mut prev_ids: Vec<u64> = first.features.iter().map(|f| f.id).collect();
    prev_ids.sort_unstable();

    for i in 1..5 {
        let (measurement, info) = harness.step(&stereo_frame(&scene, i as f64 * FRAME_INTERVAL));
        let mut ids: Vec<u64> = measurement.features.iter().map(|f| f.id).collect();
        ids.sort_unstable();

        // Zero motion takes the degenerate branch: nothing is lost, nothing
        // is replaced.
        assert_eq!(ids, prev_ids, "ids changed at frame {}", i);
        assert_eq!(info.before_tracking, prev_ids.len());
        assert_eq!(info.after_tracking, prev_ids.len());
        assert_eq!(info.after_matching, prev_ids.len());
        assert_eq!(info.after_ransac, prev_ids.len());
        prev_ids = ids;
    }
}

#[test]
fn gyro_compensated_rotation_retains_most_features() {
    let mut harness = Harness::new();
    let scene = squares_scene();

    let (first, _) = harness.step(&stereo_frame(&scene, 0.0));
    let first_ids: Vec<u64> = first.features.iter().map(|f| f.id).collect();
    assert!(!first_ids.is_empty());

    // Constant roll about the optical axis; the engine integrates the mean
    // rate over the frame interval and transposes, so the warp below uses
    // exactly the rotation the engine will predict with.
    let angular_velocity = Vector3::new(0.0, 0.0, 0.6);
    let r_p_c = exp_so3(&(angular_velocity * FRAME_INTERVAL)).transpose();
    let rotated = {
        let mut frame = stereo_frame(&warp_by_rotation(&scene, &r_p_c), FRAME_INTERVAL);
        frame.cam1 = frame.cam0.clone();
        frame
    };

    {
        let mut buffer = harness.imu_buffer.lock();
        for i in 0..10 {
            buffer.push(ImuSample {
                timestamp: 0.0025 + i as f64 * 0.005,
                angular_velocity,
                linear_acceleration: Vector3::zeros(),
            });
        }
    }

    let (measurement, _) = harness.step(&rotated);
    let curr_ids: Vec<u64> = measurement.features.iter().map(|f| f.id).collect();

    let retained = first_ids.iter().filter(|id| curr_ids.contains(id)).count();
    assert!(
        retained as f64 >= 0.8 * first_ids.len() as f64,
        "only {}/{} features survived the rotation",
        retained,
        first_ids.len()
    );

    // Replenished features must not reuse old ids.
    let max_first = *first_ids.iter().max().unwrap();
    for id in &curr_ids {
        assert!(first_ids.contains(id) || *id > max_first);
    }
}

#[test]
fn injected_stereo_mismatch_is_rejected_before_the_ransac() {
    let mut harness = Harness::new();
    let scene = squares_scene();

    let (first, _) = harness.step(&stereo_frame(&scene, 0.0));
    assert_eq!(first.features.len(), 32);

    // Displace the right-image squares of ~20% of the cells by a random
    // offset with a vertical component; every feature in those cells gets a
    // stereo pair off its epipolar line.
    let mut rng = StdRng::seed_from_u64(29);
    let mut cells: Vec<(u32, u32)> = Vec::new();
    while cells.len() < 3 {
        let cell = (rng.gen_range(0..4u32), rng.gen_range(0..4u32));
        if !cells.contains(&cell) {
            cells.push(cell);
        }
    }
    let displaced: Vec<(u32, u32, i32, i32)> = cells
        .iter()
        .map(|&(row, col)| {
            let dx = rng.gen_range(-4..=4);
            let magnitude = rng.gen_range(5..=8);
            let dy = if rng.gen_bool(0.5) { magnitude } else { -magnitude };
            (row, col, dx, dy)
        })
        .collect();

    // The ids living in the displaced cells, recovered from the first
    // frame's normalized measurement.
    let [fx, fy, cx, cy] = INTRINSICS;
    let mismatched: Vec<u64> = first
        .features
        .iter()
        .filter(|f| {
            let col = ((f.u0 * fx + cx) / 64.0) as u32;
            let row = ((f.v0 * fy + cy) / 48.0) as u32;
            cells.contains(&(row, col))
        })
        .map(|f| f.id)
        .collect();
    assert_eq!(mismatched.len(), 2 * cells.len());

    let frame = StereoFrame {
        timestamp: FRAME_INTERVAL,
        cam0: scene.clone(),
        cam1: squares_scene_with_displaced_cells(&displaced),
    };
    let (measurement, info) = harness.step(&frame);

    // The temporal flow still tracks everything (the left image is
    // unchanged); the mismatched pairs must die at the stereo matching
    // stage, before the RANSAC ever sees them.
    assert_eq!(info.after_tracking, 32);
    let rejected = info.after_tracking - info.after_matching;
    assert!(
        rejected >= mismatched.len(),
        "only {} of {} mismatched pairs rejected at the stereo stage",
        rejected,
        mismatched.len()
    );
    assert!(
        info.after_matching >= 24,
        "clean pairs were lost: {} matched",
        info.after_matching
    );
    for feature in &measurement.features {
        assert!(
            !mismatched.contains(&feature.id),
            "mismatched feature {} survived to the output",
            feature.id
        );
    }
}

#[test]
fn feature_count_never_exceeds_the_grid_ceiling() {
    let mut harness = Harness::new();
    let scene = squares_scene();
    let config = ProcessorConfig::default();
    let ceiling = config.grid_row * config.grid_col * config.grid_max_feature_num;

    for i in 0..4 {
        let (measurement, _) = harness.step(&stereo_frame(&scene, i as f64 * FRAME_INTERVAL));
        assert!(measurement.features.len() <= ceiling);
    }
}
