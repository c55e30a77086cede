use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use vio_frontend::config::ProcessorConfig;
use vio_frontend::io::euroc::EurocDataset;
use vio_frontend::system::FrontendSystem;

fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let dataset_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/euroc/MH_01_easy/mav0".to_string());
    let config = match std::env::args().nth(2) {
        Some(path) => ProcessorConfig::from_yaml(path)?,
        None => ProcessorConfig::default(),
    };

    info!("===========================================");
    config.log_summary();

    let dataset = EurocDataset::new(&dataset_path)?;
    debug!(
        "Loaded {} stereo frames, {} IMU samples",
        dataset.len(),
        dataset.imu_entries.len()
    );
    dataset.calibration.log_summary();
    info!("===========================================");

    let calibration = Arc::new(dataset.calibration.clone());
    let mut system = FrontendSystem::new(config, calibration);

    let mut imu_idx = 0usize;
    let mut total_features = 0usize;

    for i in 0..dataset.len() {
        let frame = dataset.stereo_frame(i)?;

        // Everything the engine may integrate for this frame has to be
        // buffered before the frame is handed over.
        while imu_idx < dataset.imu_entries.len()
            && dataset.imu_entries[imu_idx].timestamp < frame.timestamp + 0.01
        {
            system.feed_imu(dataset.imu_entries[imu_idx]);
            imu_idx += 1;
        }

        let timestamp = frame.timestamp;
        system.feed_stereo(frame)?;

        // Offline run: wait for the frame's statistics so the inertial feed
        // stays aligned with the engine's frame boundary.
        let Ok(tracking_info) = system.tracking_info().recv() else {
            break;
        };

        for measurement in system.measurements().try_iter() {
            total_features += measurement.features.len();
            debug!(
                "Frame at {:.6}: {} features emitted",
                measurement.timestamp,
                measurement.features.len()
            );
        }

        if i % 100 == 0 {
            info!(
                "Frame {}/{} (ts={:.6}): track {} -> match {} -> ransac {}",
                i,
                dataset.len(),
                timestamp,
                tracking_info.after_tracking,
                tracking_info.after_matching,
                tracking_info.after_ransac
            );
        }
    }

    system.shutdown();
    for measurement in system.measurements().try_iter() {
        total_features += measurement.features.len();
    }

    info!(
        "Done! Processed {} frames, {} feature observations",
        dataset.len(),
        total_features
    );

    Ok(())
}
