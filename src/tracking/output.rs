//! Measurement encoding for the downstream estimator.

use crate::camera::StereoCalibration;
use crate::system::messages::{FeatureMeasurement, FeatureObservation};
use crate::tracking::GridFeatures;

/// Convert the accepted feature set into an outgoing measurement record with
/// undistorted normalized coordinates.
pub fn encode_measurement(
    timestamp: f64,
    features: &GridFeatures,
    calib: &StereoCalibration,
) -> FeatureMeasurement {
    let mut ids = Vec::with_capacity(features.num_features());
    let mut cam0_points = Vec::with_capacity(features.num_features());
    let mut cam1_points = Vec::with_capacity(features.num_features());
    for feature in features.features() {
        ids.push(feature.id);
        cam0_points.push(feature.cam0_point);
        cam1_points.push(feature.cam1_point);
    }

    let cam0_undistorted = calib.cam0.undistort_to_normalized(&cam0_points);
    let cam1_undistorted = calib.cam1.undistort_to_normalized(&cam1_points);

    let observations = ids
        .iter()
        .zip(cam0_undistorted.iter().zip(cam1_undistorted.iter()))
        .map(|(&id, (p0, p1))| FeatureObservation {
            id,
            u0: p0.x,
            v0: p0.y,
            u1: p1.x,
            v1: p1.y,
        })
        .collect();

    FeatureMeasurement {
        timestamp,
        features: observations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, DistortionModel};
    use crate::tracking::FeatureMetaData;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Point2};

    fn rig() -> StereoCalibration {
        let cam = CameraModel::new(
            640,
            480,
            [400.0, 400.0, 320.0, 240.0],
            DistortionModel::RadTan,
            [0.0; 4],
        );
        let mut t_cam0_cam1 = Matrix4::identity();
        t_cam0_cam1[(0, 3)] = -0.1;
        StereoCalibration::new(cam.clone(), cam, &Matrix4::identity(), &t_cam0_cam1)
    }

    #[test]
    fn test_encodes_normalized_coordinates_in_cell_order() {
        let calib = rig();
        let mut store = GridFeatures::new(4, 4);
        store.insert(
            5,
            FeatureMetaData {
                id: 42,
                lifetime: 3,
                response: 1.0,
                cam0_point: Point2::new(400.0, 280.0),
                cam1_point: Point2::new(360.0, 280.0),
            },
        );
        store.insert(
            2,
            FeatureMetaData {
                id: 7,
                lifetime: 1,
                response: 1.0,
                cam0_point: Point2::new(320.0, 240.0),
                cam1_point: Point2::new(300.0, 240.0),
            },
        );

        let measurement = encode_measurement(17.5, &store, &calib);

        assert_eq!(measurement.timestamp, 17.5);
        assert_eq!(measurement.features.len(), 2);
        // Cell 2 precedes cell 5.
        assert_eq!(measurement.features[0].id, 7);
        assert_eq!(measurement.features[1].id, 42);

        assert_relative_eq!(measurement.features[0].u0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(measurement.features[0].v0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(measurement.features[0].u1, -0.05, epsilon = 1e-12);
        assert_relative_eq!(measurement.features[1].u0, 0.2, epsilon = 1e-12);
        assert_relative_eq!(measurement.features[1].v0, 0.1, epsilon = 1e-12);
    }
}
