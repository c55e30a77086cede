//! Flags shared between the producer threads and the tracker engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared state of the running front-end.
///
/// Calibration and configuration are immutable after construction and are
/// shared separately; only the coordination flags live here.
#[derive(Debug, Default)]
pub struct SharedState {
    /// Request the engine to finish its current frame and exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
