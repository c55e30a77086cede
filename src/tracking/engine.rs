//! The tracker engine: per-frame state machine of the front-end.
//!
//! First frame: detect FAST corners, stereo-match them, seed the grid.
//! Every later frame: track the previous left points with gyro-compensated
//! optical flow, re-match them in stereo, reject temporal outliers with
//! two-point RANSAC in both cameras, replenish under-populated grid cells
//! and prune over-populated ones, then emit the measurement record.
//!
//! The engine is strictly single-threaded with respect to its mutable state;
//! each frame is processed to completion before the next begins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nalgebra::{Matrix3, Point2, Vector3};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::camera::StereoCalibration;
use crate::config::ProcessorConfig;
use crate::imu::ImuBuffer;
use crate::system::messages::{DebugFrame, FeatureMeasurement, StereoFrame, TrackingInfo};
use crate::system::SharedState;
use crate::tracking::grid::{cell_code, FeatureId, FeatureMetaData, GridFeatures};
use crate::tracking::output::encode_measurement;
use crate::tracking::ransac::two_point_ransac;
use crate::tracking::stereo::StereoMatcher;
use crate::vision::fast::{self, Corner};
use crate::vision::optical_flow::{self, LkParams};
use crate::vision::Pyramid;
use crate::viz::debug_image;

const RANSAC_SUCCESS_PROBABILITY: f64 = 0.99;

/// Period of the per-frame tracking diagnostic.
const DIAGNOSTIC_PERIOD: Duration = Duration::from_millis(500);
/// Period of degradation warnings.
const WARNING_PERIOD: Duration = Duration::from_secs(1);

/// A stereo-matched detection that has not been admitted to the grid yet.
struct NewFeature {
    cam0_point: Point2<f64>,
    cam1_point: Point2<f64>,
    response: f32,
}

/// Simple wall-clock rate limiter for log output.
struct Throttle {
    period: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    fn ready(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.period => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

pub struct TrackerEngine {
    config: ProcessorConfig,
    calib: Arc<StereoCalibration>,
    imu_buffer: Arc<Mutex<ImuBuffer>>,
    matcher: StereoMatcher,
    lk_params: LkParams,

    is_first_frame: bool,
    next_feature_id: FeatureId,
    prev_timestamp: f64,

    prev_cam0_pyramid: Option<Pyramid>,
    curr_cam0_pyramid: Option<Pyramid>,
    curr_cam1_pyramid: Option<Pyramid>,

    prev_features: GridFeatures,
    curr_features: GridFeatures,

    before_tracking: usize,
    after_tracking: usize,
    after_matching: usize,
    after_ransac: usize,

    /// Frames each feature id has been observed in, for the shutdown
    /// statistics dump.
    feature_lifetime: HashMap<FeatureId, usize>,

    rng: StdRng,
    diagnostic_throttle: Throttle,
    unsynced_throttle: Throttle,

    feature_tx: Sender<FeatureMeasurement>,
    info_tx: Sender<TrackingInfo>,
    debug_tx: Option<Sender<DebugFrame>>,
}

impl TrackerEngine {
    pub fn new(
        config: ProcessorConfig,
        calib: Arc<StereoCalibration>,
        imu_buffer: Arc<Mutex<ImuBuffer>>,
        feature_tx: Sender<FeatureMeasurement>,
        info_tx: Sender<TrackingInfo>,
        debug_tx: Option<Sender<DebugFrame>>,
    ) -> Self {
        let matcher = StereoMatcher::new(calib.clone(), &config);
        let lk_params = LkParams {
            win_size: config.patch_size,
            max_level: config.pyramid_levels,
            max_iter: config.max_iteration,
            epsilon: config.track_precision,
        };
        let prev_features = GridFeatures::new(config.grid_row, config.grid_col);
        let curr_features = GridFeatures::new(config.grid_row, config.grid_col);

        Self {
            config,
            calib,
            imu_buffer,
            matcher,
            lk_params,
            is_first_frame: true,
            next_feature_id: 0,
            prev_timestamp: 0.0,
            prev_cam0_pyramid: None,
            curr_cam0_pyramid: None,
            curr_cam1_pyramid: None,
            prev_features,
            curr_features,
            before_tracking: 0,
            after_tracking: 0,
            after_matching: 0,
            after_ransac: 0,
            feature_lifetime: HashMap::new(),
            rng: StdRng::from_entropy(),
            diagnostic_throttle: Throttle::new(DIAGNOSTIC_PERIOD),
            unsynced_throttle: Throttle::new(WARNING_PERIOD),
            feature_tx,
            info_tx,
            debug_tx,
        }
    }

    /// Consume stereo frames until the channel closes or shutdown is
    /// requested.
    pub fn run(mut self, frames: Receiver<StereoFrame>, shared: Arc<SharedState>) {
        info!("Tracker engine started");
        while let Ok(frame) = frames.recv() {
            if shared.is_shutdown_requested() {
                break;
            }
            self.process_frame(&frame);
        }
        self.log_lifetime_statistics();
        info!("Tracker engine stopped");
    }

    /// Run one stereo frame through the full pipeline.
    pub fn process_frame(&mut self, frame: &StereoFrame) {
        self.before_tracking = 0;
        self.after_tracking = 0;
        self.after_matching = 0;
        self.after_ransac = 0;

        // Pyramids are shared by the temporal tracker and the stereo matcher.
        self.curr_cam0_pyramid = Some(Pyramid::build(&frame.cam0, self.config.pyramid_levels));
        self.curr_cam1_pyramid = Some(Pyramid::build(&frame.cam1, self.config.pyramid_levels));

        if self.is_first_frame {
            self.initialize_first_frame();
            self.is_first_frame = false;
        } else {
            self.track_features(frame.timestamp);
            self.add_new_features(frame.timestamp);
            self.prune_grid_features();
        }

        if let Some(debug_tx) = &self.debug_tx {
            let image = debug_image::draw_features_stereo(
                frame,
                &self.prev_features,
                &self.curr_features,
                self.config.grid_row,
                self.config.grid_col,
            );
            let _ = debug_tx.try_send(DebugFrame {
                timestamp: frame.timestamp,
                image,
            });
        }

        self.update_feature_lifetime();
        self.publish(frame.timestamp);

        // Promote current to previous and start the next frame empty.
        self.prev_timestamp = frame.timestamp;
        self.prev_cam0_pyramid = self.curr_cam0_pyramid.take();
        self.curr_cam1_pyramid = None;
        std::mem::swap(&mut self.prev_features, &mut self.curr_features);
        self.curr_features.reset();
    }

    /// Cell extents for the current frame; recomputed per frame so a
    /// resolution change cannot leave the grid inconsistent.
    fn cell_extents(&self) -> Option<(f64, f64)> {
        let base = self.curr_cam0_pyramid.as_ref().map(Pyramid::base)?;
        Some((
            base.width as f64 / self.config.grid_col as f64,
            base.height as f64 / self.config.grid_row as f64,
        ))
    }

    /// Detect corners on the first left image, stereo-match them, and keep
    /// the strongest detections per grid cell.
    fn initialize_first_frame(&mut self) {
        let corners = match self.curr_cam0_pyramid.as_ref() {
            Some(pyramid) => fast::detect(pyramid.base(), self.config.fast_threshold, None),
            None => return,
        };

        let (_, mut buckets) = self.stereo_match_candidates(&corners);

        let min_per_cell = self.config.grid_min_feature_num;
        for (code, bucket) in buckets.iter_mut().enumerate() {
            for candidate in bucket.drain(..).take(min_per_cell) {
                self.admit_feature(code, candidate);
            }
        }
    }

    /// Track the previous frame's features into the current frame.
    fn track_features(&mut self, timestamp: f64) {
        let Some((cell_width, cell_height)) = self.cell_extents() else {
            return;
        };

        let (cam0_r_p_c, cam1_r_p_c) = self.imu_buffer.lock().relative_camera_rotations(
            &self.calib,
            self.prev_timestamp,
            timestamp,
        );

        let mut prev_ids: Vec<FeatureId> = Vec::new();
        let mut prev_lifetime: Vec<usize> = Vec::new();
        let mut prev_cam0_points: Vec<Point2<f64>> = Vec::new();
        let mut prev_cam1_points: Vec<Point2<f64>> = Vec::new();
        for feature in self.prev_features.features() {
            prev_ids.push(feature.id);
            prev_lifetime.push(feature.lifetime);
            prev_cam0_points.push(feature.cam0_point);
            prev_cam1_points.push(feature.cam1_point);
        }

        self.before_tracking = prev_cam0_points.len();
        if prev_ids.is_empty() {
            return;
        }

        let Some(prev_pyramid) = self.prev_cam0_pyramid.as_ref() else {
            return;
        };
        let (Some(cam0_pyramid), Some(cam1_pyramid)) =
            (self.curr_cam0_pyramid.as_ref(), self.curr_cam1_pyramid.as_ref())
        else {
            return;
        };

        // Rotation-only prediction seeds the temporal flow.
        let predicted = predict_feature_tracking(
            &prev_cam0_points,
            &cam0_r_p_c,
            self.calib.cam0.intrinsics,
        );

        let (curr_cam0_points, mut track_inliers) = optical_flow::track(
            prev_pyramid,
            cam0_pyramid,
            &prev_cam0_points,
            &predicted,
            &self.lk_params,
        );

        for (marker, pt) in track_inliers.iter_mut().zip(curr_cam0_points.iter()) {
            if *marker && !self.calib.cam0.contains(pt) {
                *marker = false;
            }
        }

        let prev_tracked_ids = retain_marked(&prev_ids, &track_inliers);
        let prev_tracked_lifetime = retain_marked(&prev_lifetime, &track_inliers);
        let prev_tracked_cam0 = retain_marked(&prev_cam0_points, &track_inliers);
        let prev_tracked_cam1 = retain_marked(&prev_cam1_points, &track_inliers);
        let curr_tracked_cam0 = retain_marked(&curr_cam0_points, &track_inliers);

        self.after_tracking = curr_tracked_cam0.len();

        // Outlier removal closes a loop over both cameras and both frames:
        // stereo matching in the current frame, then RANSAC on each camera's
        // temporal pair. The previous frame's stereo match is trusted.
        let (curr_cam1_points, match_inliers) =
            self.matcher
                .match_points(cam0_pyramid, cam1_pyramid, &curr_tracked_cam0);

        let prev_matched_ids = retain_marked(&prev_tracked_ids, &match_inliers);
        let prev_matched_lifetime = retain_marked(&prev_tracked_lifetime, &match_inliers);
        let prev_matched_cam0 = retain_marked(&prev_tracked_cam0, &match_inliers);
        let prev_matched_cam1 = retain_marked(&prev_tracked_cam1, &match_inliers);
        let curr_matched_cam0 = retain_marked(&curr_tracked_cam0, &match_inliers);
        let curr_matched_cam1 = retain_marked(&curr_cam1_points, &match_inliers);

        self.after_matching = curr_matched_cam0.len();

        let cam0_ransac_inliers = two_point_ransac(
            &prev_matched_cam0,
            &curr_matched_cam0,
            &cam0_r_p_c,
            &self.calib.cam0,
            self.config.ransac_threshold,
            RANSAC_SUCCESS_PROBABILITY,
            &mut self.rng,
        );
        let cam1_ransac_inliers = two_point_ransac(
            &prev_matched_cam1,
            &curr_matched_cam1,
            &cam1_r_p_c,
            &self.calib.cam1,
            self.config.ransac_threshold,
            RANSAC_SUCCESS_PROBABILITY,
            &mut self.rng,
        );

        for i in 0..curr_matched_cam0.len() {
            if !cam0_ransac_inliers[i] || !cam1_ransac_inliers[i] {
                continue;
            }
            let code = cell_code(
                &curr_matched_cam0[i],
                cell_width,
                cell_height,
                self.config.grid_row,
                self.config.grid_col,
            );
            self.curr_features.insert(
                code,
                FeatureMetaData {
                    id: prev_matched_ids[i],
                    lifetime: prev_matched_lifetime[i] + 1,
                    response: 0.0,
                    cam0_point: curr_matched_cam0[i],
                    cam1_point: curr_matched_cam1[i],
                },
            );
            self.after_ransac += 1;
        }

        let prev_feature_num = self.prev_features.num_features();
        let curr_feature_num = self.curr_features.num_features();
        if self.diagnostic_throttle.ready() {
            info!(
                "candidates: {}; track: {}; match: {}; ransac: {}/{}={:.3}",
                self.before_tracking,
                self.after_tracking,
                self.after_matching,
                curr_feature_num,
                prev_feature_num,
                curr_feature_num as f64 / (prev_feature_num as f64 + 1e-5),
            );
        }
    }

    /// Detect new corners away from existing features and fill
    /// under-populated cells with the strongest stereo-matched ones.
    fn add_new_features(&mut self, timestamp: f64) {
        let Some((cell_width, cell_height)) = self.cell_extents() else {
            return;
        };

        let corners = {
            let Some(base) = self.curr_cam0_pyramid.as_ref().map(Pyramid::base) else {
                return;
            };

            // Mask out a 5x5 neighborhood around every held feature so the
            // detector cannot re-find what is already tracked.
            let mut mask = vec![1u8; base.width * base.height];
            for feature in self.curr_features.features() {
                let x = feature.cam0_point.x as isize;
                let y = feature.cam0_point.y as isize;
                for my in (y - 2).max(0)..(y + 3).min(base.height as isize) {
                    for mx in (x - 2).max(0)..(x + 3).min(base.width as isize) {
                        mask[my as usize * base.width + mx as usize] = 0;
                    }
                }
            }

            let mut detections = fast::detect(base, self.config.fast_threshold, Some(&mask));

            // Cap each cell's candidates at the pruning ceiling before the
            // (comparatively expensive) stereo matching.
            let mut sieve: Vec<Vec<Corner>> = vec![Vec::new(); self.curr_features.num_cells()];
            for corner in detections.drain(..) {
                let code = cell_code(
                    &Point2::new(corner.x, corner.y),
                    cell_width,
                    cell_height,
                    self.config.grid_row,
                    self.config.grid_col,
                );
                sieve[code].push(corner);
            }
            let mut kept = Vec::new();
            for mut bucket in sieve {
                if bucket.len() > self.config.grid_max_feature_num {
                    bucket.sort_by(|a, b| b.response.total_cmp(&a.response));
                    bucket.truncate(self.config.grid_max_feature_num);
                }
                kept.extend(bucket);
            }
            kept
        };

        let detected_new_features = corners.len();
        let (matched_new_features, mut buckets) = self.stereo_match_candidates(&corners);

        if matched_new_features < 5
            && (matched_new_features as f64) < 0.1 * detected_new_features as f64
            && self.unsynced_throttle.ready()
        {
            warn!("Images at [{:.6}] seems unsynced...", timestamp);
        }

        let min_per_cell = self.config.grid_min_feature_num;
        for code in 0..buckets.len() {
            let occupancy = self.curr_features.cell(code).len();
            if occupancy >= min_per_cell {
                continue;
            }
            let vacancy = min_per_cell - occupancy;
            for candidate in buckets[code].drain(..).take(vacancy) {
                self.admit_feature(code, candidate);
            }
        }
    }

    /// Truncate over-full cells, keeping the longest-lived features.
    fn prune_grid_features(&mut self) {
        self.curr_features
            .prune_overflow(self.config.grid_max_feature_num);
    }

    /// Stereo-match candidate corners and bucket the survivors by grid cell,
    /// strongest response first. Returns the number of matches.
    fn stereo_match_candidates(&self, corners: &[Corner]) -> (usize, Vec<Vec<NewFeature>>) {
        let mut buckets: Vec<Vec<NewFeature>> =
            (0..self.curr_features.num_cells()).map(|_| Vec::new()).collect();

        let (Some(cam0_pyramid), Some(cam1_pyramid)) =
            (self.curr_cam0_pyramid.as_ref(), self.curr_cam1_pyramid.as_ref())
        else {
            return (0, buckets);
        };
        let base = cam0_pyramid.base();
        let cell_width = base.width as f64 / self.config.grid_col as f64;
        let cell_height = base.height as f64 / self.config.grid_row as f64;

        let cam0_points: Vec<Point2<f64>> =
            corners.iter().map(|c| Point2::new(c.x, c.y)).collect();
        let (cam1_points, inlier_markers) =
            self.matcher
                .match_points(cam0_pyramid, cam1_pyramid, &cam0_points);

        let mut matched = 0usize;
        for (i, &is_inlier) in inlier_markers.iter().enumerate() {
            if !is_inlier {
                continue;
            }
            matched += 1;
            let code = cell_code(
                &cam0_points[i],
                cell_width,
                cell_height,
                self.config.grid_row,
                self.config.grid_col,
            );
            buckets[code].push(NewFeature {
                cam0_point: cam0_points[i],
                cam1_point: cam1_points[i],
                response: corners[i].response,
            });
        }

        for bucket in buckets.iter_mut() {
            bucket.sort_by(|a, b| b.response.total_cmp(&a.response));
        }

        (matched, buckets)
    }

    /// Give a matched candidate a fresh id and insert it into the current
    /// store.
    fn admit_feature(&mut self, code: usize, candidate: NewFeature) {
        let feature = FeatureMetaData {
            id: self.next_feature_id,
            lifetime: 1,
            response: candidate.response,
            cam0_point: candidate.cam0_point,
            cam1_point: candidate.cam1_point,
        };
        self.next_feature_id += 1;
        self.curr_features.insert(code, feature);
    }

    /// Emit the measurement and statistics records for the current frame.
    fn publish(&mut self, timestamp: f64) {
        let measurement = encode_measurement(timestamp, &self.curr_features, &self.calib);
        if self.feature_tx.try_send(measurement).is_err() {
            debug!("Feature measurement dropped (consumer not keeping up)");
        }

        let tracking_info = TrackingInfo {
            timestamp,
            before_tracking: self.before_tracking,
            after_tracking: self.after_tracking,
            after_matching: self.after_matching,
            after_ransac: self.after_ransac,
        };
        let _ = self.info_tx.try_send(tracking_info);
    }

    fn update_feature_lifetime(&mut self) {
        for feature in self.curr_features.features() {
            *self.feature_lifetime.entry(feature.id).or_insert(0) += 1;
        }
    }

    /// Histogram of observed feature lifetimes, dumped once on shutdown.
    fn log_lifetime_statistics(&self) {
        let mut histogram: HashMap<usize, usize> = HashMap::new();
        for &frames in self.feature_lifetime.values() {
            *histogram.entry(frames).or_insert(0) += 1;
        }
        let mut entries: Vec<(usize, usize)> = histogram.into_iter().collect();
        entries.sort_unstable();
        debug!("Feature lifetime statistics:");
        for (frames, count) in entries {
            debug!("{} : {}", frames, count);
        }
    }
}

/// Predict where tracked points land in the current frame from the
/// inter-frame rotation alone, via the infinite-depth homography
/// `H = K R K⁻¹`. The translation is absorbed by the optical flow
/// refinement; this is a seed, not a measurement.
fn predict_feature_tracking(
    input_pts: &[Point2<f64>],
    r_p_c: &Matrix3<f64>,
    intrinsics: [f64; 4],
) -> Vec<Point2<f64>> {
    if input_pts.is_empty() {
        return Vec::new();
    }

    let [fx, fy, cx, cy] = intrinsics;
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

    input_pts
        .iter()
        .map(|pt| {
            let p = h * Vector3::new(pt.x, pt.y, 1.0);
            Point2::new(p.x / p.z, p.y / p.z)
        })
        .collect()
}

/// Keep the elements whose marker is set.
fn retain_marked<T: Clone>(items: &[T], markers: &[bool]) -> Vec<T> {
    debug_assert_eq!(items.len(), markers.len());
    items
        .iter()
        .zip(markers.iter())
        .filter_map(|(item, &keep)| if keep { Some(item.clone()) } else { None })
        .collect()
}
