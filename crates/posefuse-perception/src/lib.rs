//! `posefuse-perception` – estimation core.
//!
//! Turns calibrated sensor readings into a single fused robot pose.
//!
//! # Modules
//!
//! - [`transform`] – Coordinate Transform: tag detections, odometry and IMU
//!   readings into world-frame [`Measurement`][posefuse_types::Measurement]s.
//! - [`sensor`] – Sensor Adapter Registry: per-sensor conversion and noise
//!   matrices, projection onto the rows a reading can support.
//! - [`filter`] – Kalman Filter Core with `predict` / `update` / `reset`.
//! - [`strategy`] – [`PoseEstimationStrategy`][strategy::PoseEstimationStrategy]
//!   with Kalman and windowed (average, weighted average, median, trend line)
//!   implementations.
//! - [`linalg`] – shared matrix helpers and angle wrapping.

pub mod filter;
pub mod linalg;
pub mod sensor;
pub mod strategy;
pub mod transform;

pub use filter::{KalmanFilter, TransitionModel};
pub use sensor::{PreparedMeasurement, SensorModel, SensorModelConfig, SensorRegistry};
pub use strategy::{PoseEstimationStrategy, StrategyKind, build_strategy};
pub use transform::{
    CameraConfig, ImuFrame, ImuFrameConfig, OdometryFrame, OdometryFrameConfig, TagConfig,
    TagSolver,
};
