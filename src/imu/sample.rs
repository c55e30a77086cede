use nalgebra::Vector3;

/// Single IMU measurement.
///
/// Only the angular velocity drives the tracker; the linear acceleration is
/// carried through untouched for downstream consumers.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Angular velocity in rad/s, IMU frame.
    pub angular_velocity: Vector3<f64>,
    /// Linear acceleration in m/s², IMU frame.
    pub linear_acceleration: Vector3<f64>,
}
