//! Front-end facade: owns the tracker thread and the ingress/egress queues.
//!
//! Two producer streams (stereo pairs, inertial samples) drive the single
//! consumer engine. Stereo pairs go through a bounded channel; inertial
//! samples go into a mutex-guarded buffer that the engine trims as it
//! integrates.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::camera::StereoCalibration;
use crate::config::ProcessorConfig;
use crate::imu::{ImuBuffer, ImuSample};
use crate::tracking::TrackerEngine;

use super::messages::{DebugFrame, FeatureMeasurement, StereoFrame, TrackingInfo};
use super::shared_state::SharedState;

/// Depth of the stereo-pair ingress queue; the producer blocks when full.
const STEREO_QUEUE_DEPTH: usize = 10;
/// Depth of the outgoing measurement queue.
const FEATURE_QUEUE_DEPTH: usize = 3;
/// Depth of the outgoing statistics queue.
const INFO_QUEUE_DEPTH: usize = 3;
/// Depth of the debug image queue.
const DEBUG_QUEUE_DEPTH: usize = 1;

/// The running front-end.
pub struct FrontendSystem {
    shared: Arc<SharedState>,
    imu_buffer: Arc<Mutex<ImuBuffer>>,
    frame_tx: Option<Sender<StereoFrame>>,
    feature_rx: Receiver<FeatureMeasurement>,
    info_rx: Receiver<TrackingInfo>,
    debug_rx: Option<Receiver<DebugFrame>>,
    engine_handle: Option<JoinHandle<()>>,
}

impl FrontendSystem {
    /// Spawn the engine thread without a debug subscriber.
    pub fn new(config: ProcessorConfig, calib: Arc<StereoCalibration>) -> Self {
        Self::with_options(config, calib, false)
    }

    /// Spawn the engine thread with debug rendering enabled; the images
    /// arrive on [`FrontendSystem::debug_images`].
    pub fn with_debug(config: ProcessorConfig, calib: Arc<StereoCalibration>) -> Self {
        Self::with_options(config, calib, true)
    }

    fn with_options(config: ProcessorConfig, calib: Arc<StereoCalibration>, debug: bool) -> Self {
        let shared = SharedState::new();
        let imu_buffer = Arc::new(Mutex::new(ImuBuffer::new()));

        let (frame_tx, frame_rx) = bounded::<StereoFrame>(STEREO_QUEUE_DEPTH);
        let (feature_tx, feature_rx) = bounded::<FeatureMeasurement>(FEATURE_QUEUE_DEPTH);
        let (info_tx, info_rx) = bounded::<TrackingInfo>(INFO_QUEUE_DEPTH);
        let (debug_tx, debug_rx) = if debug {
            let (tx, rx) = bounded::<DebugFrame>(DEBUG_QUEUE_DEPTH);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let engine = TrackerEngine::new(
            config,
            calib,
            imu_buffer.clone(),
            feature_tx,
            info_tx,
            debug_tx,
        );

        let engine_shared = shared.clone();
        let engine_handle = thread::spawn(move || engine.run(frame_rx, engine_shared));

        Self {
            shared,
            imu_buffer,
            frame_tx: Some(frame_tx),
            feature_rx,
            info_rx,
            debug_rx,
            engine_handle: Some(engine_handle),
        }
    }

    /// Buffer an inertial sample.
    ///
    /// The ingress accepts everything; samples predating the first stereo
    /// frame never fall inside an integration window and are erased by the
    /// buffer's trim when the first frame interval is integrated.
    pub fn feed_imu(&self, sample: ImuSample) {
        self.imu_buffer.lock().push(sample);
    }

    /// Enqueue a stereo pair, blocking while the ingress queue is full.
    pub fn feed_stereo(&self, frame: StereoFrame) -> Result<()> {
        self.frame_tx
            .as_ref()
            .context("Front-end already shut down")?
            .send(frame)
            .context("Tracker engine is gone")
    }

    /// Per-frame feature measurements.
    pub fn measurements(&self) -> &Receiver<FeatureMeasurement> {
        &self.feature_rx
    }

    /// Per-frame tracking statistics.
    pub fn tracking_info(&self) -> &Receiver<TrackingInfo> {
        &self.info_rx
    }

    /// Rendered debug frames, present when constructed via `with_debug`.
    pub fn debug_images(&self) -> Option<&Receiver<DebugFrame>> {
        self.debug_rx.as_ref()
    }

    /// Finish processing queued frames and join the engine thread.
    pub fn shutdown(&mut self) {
        // Closing the ingress channel lets the engine drain and exit.
        self.frame_tx.take();
        if let Some(handle) = self.engine_handle.take() {
            let _ = handle.join();
        }
    }

    /// Immediately request the engine to stop after its current frame.
    pub fn abort(&mut self) {
        self.shared.request_shutdown();
        self.shutdown();
    }
}

impl Drop for FrontendSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
