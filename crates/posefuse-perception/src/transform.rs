//! Coordinate Transform.
//!
//! Converts raw sensor observations into state-space [`Measurement`]s in the
//! world frame using static extrinsic calibration.
//!
//! | Source | Conversion |
//! |---|---|
//! | AprilTag | `robot_in_world = tag_in_world ∘ (camera_in_robot ∘ tag_in_camera)⁻¹` |
//! | Odometry | `world = offset ∘ local`, with a re-anchoring offset |
//! | IMU | `theta = yaw + yaw_offset − drift_rate · (t − t_first)` |
//!
//! All frames use the body convention: x forward, y left, z up. Tag
//! detections arrive in the camera *optical* convention (x right, y down,
//! z forward) and are rotated into the body convention first.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use posefuse_perception::transform::{CameraConfig, TagConfig, TagSolver};
//! use posefuse_types::DetectedTag;
//!
//! let tags = vec![TagConfig { id: 1, x: 5.0, y: 0.0, z: 0.0, direction: [1.0, 0.0, 0.0] }];
//! let mut cameras = HashMap::new();
//! cameras.insert("front".to_string(), CameraConfig { position: [0.0; 3], direction: [1.0, 0.0, 0.0] });
//! let solver = TagSolver::from_config(&tags, &cameras).unwrap();
//!
//! // Tag seen 5 m straight ahead, facing the camera.
//! let detection = DetectedTag {
//!     tag_id: 1,
//!     rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
//!     translation: [0.0, 0.0, 5.0],
//!     confidence: 10.0,
//! };
//! let m = solver.solve("front", 0.0, &detection, None).unwrap();
//! assert!(m.observation[0].abs() < 1e-9);
//! assert!((m.range_m.unwrap() - 5.0).abs() < 1e-9);
//! ```

use std::collections::HashMap;

use nalgebra::{
    Isometry2, Isometry3, Matrix3, Rotation3, Translation2, Translation3, UnitComplex,
    UnitQuaternion, Vector2, Vector3,
};
use posefuse_types::{
    DetectedTag, ImuReading, Measurement, OdometryReading, PoseError, SensorKind, SkipReason,
    index,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::linalg::wrap_angle;

/// Largest tolerated ‖RᵀR − I‖ for a detected rotation.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-3;

// ────────────────────────────────────────────────────────────────────────────
// Frame helpers
// ────────────────────────────────────────────────────────────────────────────

/// Rotation taking camera optical axes (x right, y down, z forward) to body
/// axes (x forward, y left, z up).
pub fn optical_to_body() -> Matrix3<f64> {
    Matrix3::new(
        0.0, 0.0, 1.0, //
        -1.0, 0.0, 0.0, //
        0.0, -1.0, 0.0,
    )
}

/// Pose whose x-axis points along `direction` with z kept as close to world
/// up as possible.
pub fn pose_from_direction(position: [f64; 3], direction: [f64; 3]) -> Result<Isometry3<f64>, PoseError> {
    let dir = Vector3::from(direction);
    if !(dir.iter().all(|v| v.is_finite()) && dir.norm() > 1e-9) {
        return Err(PoseError::Config(format!(
            "direction vector {direction:?} must be finite and non-zero"
        )));
    }
    if position.iter().any(|v| !v.is_finite()) {
        return Err(PoseError::Config(format!("position {position:?} must be finite")));
    }
    let x_axis = dir.normalize();
    let y_axis = Vector3::z().cross(&x_axis);
    if y_axis.norm() < 1e-9 {
        return Err(PoseError::Config(format!(
            "direction vector {direction:?} must not be vertical"
        )));
    }
    let y_axis = y_axis.normalize();
    let z_axis = x_axis.cross(&y_axis);
    let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x_axis, y_axis, z_axis]));
    Ok(Isometry3::from_parts(
        Translation3::from(Vector3::from(position)),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ))
}

/// Heading of a 3-D pose: the yaw of its x-axis.
pub fn heading_of(pose: &Isometry3<f64>) -> f64 {
    let x_axis = pose.rotation * Vector3::x();
    x_axis.y.atan2(x_axis.x)
}

fn checked_rotation(rows: &[[f64; 3]; 3]) -> Result<Matrix3<f64>, SkipReason> {
    let r = Matrix3::from_fn(|i, j| rows[i][j]);
    let error = (r.transpose() * r - Matrix3::identity()).norm();
    let det = r.determinant();
    // NaN entries fail both comparisons.
    if !(error <= ORTHONORMAL_TOLERANCE) || !(det > 0.0) {
        return Err(SkipReason::DegenerateRotation(format!(
            "‖RᵀR − I‖ = {error:.2e}, det = {det:.3}"
        )));
    }
    Ok(r)
}

// ────────────────────────────────────────────────────────────────────────────
// AprilTag
// ────────────────────────────────────────────────────────────────────────────

/// World pose of one fiducial. `direction` is the tag's x-axis in the world
/// (pointing into the tag face).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    pub direction: [f64; 3],
}

/// Extrinsic pose of a camera relative to the robot body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub position: [f64; 3],
    pub direction: [f64; 3],
}

/// Solves robot world poses from tag detections.
#[derive(Debug, Clone)]
pub struct TagSolver {
    tags_in_world: HashMap<u32, Isometry3<f64>>,
    cameras_in_robot: HashMap<String, Isometry3<f64>>,
}

impl TagSolver {
    pub fn from_config(
        tags: &[TagConfig],
        cameras: &HashMap<String, CameraConfig>,
    ) -> Result<Self, PoseError> {
        let mut tags_in_world = HashMap::with_capacity(tags.len());
        for tag in tags {
            let pose = pose_from_direction([tag.x, tag.y, tag.z], tag.direction)
                .map_err(|e| PoseError::Config(format!("tag {}: {e}", tag.id)))?;
            if tags_in_world.insert(tag.id, pose).is_some() {
                return Err(PoseError::Config(format!("tag {} is listed twice", tag.id)));
            }
        }
        let cameras_in_robot = cameras
            .iter()
            .map(|(id, cam)| {
                pose_from_direction(cam.position, cam.direction)
                    .map(|pose| (id.clone(), pose))
                    .map_err(|e| PoseError::Config(format!("camera '{id}': {e}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            tags_in_world,
            cameras_in_robot,
        })
    }

    pub fn has_camera(&self, camera_id: &str) -> bool {
        self.cameras_in_robot.contains_key(camera_id)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.cameras_in_robot.keys().map(String::as_str)
    }

    pub fn tag_count(&self) -> usize {
        self.tags_in_world.len()
    }

    /// Turn one detection into a measurement.
    ///
    /// With `known_heading` set, the robot heading is taken from it and only
    /// the position is observed.
    pub fn solve(
        &self,
        camera_id: &str,
        timestamp: f64,
        detection: &DetectedTag,
        known_heading: Option<f64>,
    ) -> Result<Measurement, SkipReason> {
        let camera_in_robot = self
            .cameras_in_robot
            .get(camera_id)
            .ok_or_else(|| SkipReason::UnknownSensor {
                kind: SensorKind::AprilTag,
                sensor_id: camera_id.to_string(),
            })?;
        let tag_in_world = self
            .tags_in_world
            .get(&detection.tag_id)
            .ok_or(SkipReason::UnknownTag(detection.tag_id))?;

        let r_optical = checked_rotation(&detection.rotation).inspect_err(|reason| {
            warn!(camera_id, tag_id = detection.tag_id, %reason, "discarding tag detection");
        })?;
        let t_optical = Vector3::from(detection.translation);
        if t_optical.iter().any(|v| !v.is_finite()) {
            return Err(SkipReason::DegenerateRotation("non-finite translation".into()));
        }

        let m = optical_to_body();
        let r_body = Rotation3::from_matrix_unchecked(m * r_optical * m.transpose());
        let tag_in_camera = Isometry3::from_parts(
            Translation3::from(m * t_optical),
            UnitQuaternion::from_rotation_matrix(&r_body),
        );
        let tag_in_robot = camera_in_robot * tag_in_camera;
        let range = tag_in_robot.translation.vector.norm();

        let base = Measurement::new(SensorKind::AprilTag, camera_id, timestamp)
            .with_confidence(detection.confidence)
            .with_range(range);

        let measurement = match known_heading {
            Some(theta) => {
                let robot_rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), theta);
                let position =
                    tag_in_world.translation.vector - robot_rotation * tag_in_robot.translation.vector;
                base.observe(index::X, position.x).observe(index::Y, position.y)
            }
            None => {
                let robot_in_world = tag_in_world * tag_in_robot.inverse();
                let position = robot_in_world.translation.vector;
                base.observe(index::X, position.x)
                    .observe(index::Y, position.y)
                    .observe(index::THETA, wrap_angle(heading_of(&robot_in_world)))
            }
        };
        Ok(measurement)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Odometry
// ────────────────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// Placement of an odometry source's local frame in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometryFrameConfig {
    /// World position the local origin reading corresponds to.
    #[serde(default)]
    pub global_position: [f64; 2],
    /// Local reading that corresponds to `global_position`.
    #[serde(default)]
    pub local_position: [f64; 2],
    #[serde(default)]
    pub yaw_offset: f64,
    /// Squared distance (m²) between odometry and the estimate that triggers
    /// a re-anchor. Zero or negative disables drift correction.
    #[serde(default)]
    pub max_r2_drift: f64,
    #[serde(default = "default_true")]
    pub use_position: bool,
    #[serde(default = "default_true")]
    pub use_rotation: bool,
}

impl Default for OdometryFrameConfig {
    fn default() -> Self {
        Self {
            global_position: [0.0; 2],
            local_position: [0.0; 2],
            yaw_offset: 0.0,
            max_r2_drift: 0.0,
            use_position: true,
            use_rotation: true,
        }
    }
}

/// Running local-to-world correction for one odometry source.
#[derive(Debug, Clone)]
pub struct OdometryFrame {
    config: OdometryFrameConfig,
    offset: Isometry2<f64>,
    last_local: Option<Isometry2<f64>>,
    reanchors: u64,
}

impl OdometryFrame {
    pub fn new(config: OdometryFrameConfig) -> Self {
        let offset = Isometry2::from_parts(
            Translation2::from(Vector2::from(config.global_position)),
            UnitComplex::new(config.yaw_offset),
        ) * Isometry2::translation(-config.local_position[0], -config.local_position[1]);
        Self {
            config,
            offset,
            last_local: None,
            reanchors: 0,
        }
    }

    pub fn config(&self) -> &OdometryFrameConfig {
        &self.config
    }

    /// Number of times the offset has been re-anchored.
    pub fn reanchor_count(&self) -> u64 {
        self.reanchors
    }

    /// Convert a reading into the world frame. `estimate` is the current
    /// fused position, used for drift correction.
    pub fn transform(&mut self, reading: &OdometryReading, estimate: Option<[f64; 2]>) -> Measurement {
        let local = Isometry2::new(Vector2::from(reading.position), reading.heading_rad);
        self.last_local = Some(local);

        if self.config.max_r2_drift > 0.0
            && let Some(estimate) = estimate
        {
            let world = self.offset * local;
            let drift = (world.translation.vector - Vector2::from(estimate)).norm_squared();
            if drift > self.config.max_r2_drift {
                debug!(
                    sensor_id = %reading.sensor_id,
                    drift_r2 = drift,
                    limit = self.config.max_r2_drift,
                    "odometry drifted, re-anchoring to estimate"
                );
                let rotated_local = self.offset.rotation * local.translation.vector;
                self.offset = Isometry2::from_parts(
                    Translation2::from(Vector2::from(estimate) - rotated_local),
                    self.offset.rotation,
                );
                self.reanchors += 1;
            }
        }

        let world = self.offset * local;
        let velocity = self.offset.rotation * Vector2::from(reading.velocity);

        let mut m = Measurement::new(SensorKind::Odometry, reading.sensor_id.as_str(), reading.timestamp)
            .observe(index::VX, velocity.x)
            .observe(index::VY, velocity.y);
        if self.config.use_position {
            m = m
                .observe(index::X, world.translation.vector.x)
                .observe(index::Y, world.translation.vector.y);
        }
        if self.config.use_rotation {
            m = m.observe(index::THETA, wrap_angle(world.rotation.angle()));
        }
        m
    }

    /// Move the offset so the last local reading maps onto `(x, y, theta)`.
    /// Before any reading, the configured local origin is used instead.
    pub fn reanchor(&mut self, x: f64, y: f64, theta: f64) {
        let local = self.last_local.unwrap_or_else(|| {
            Isometry2::translation(self.config.local_position[0], self.config.local_position[1])
        });
        self.offset = Isometry2::new(Vector2::new(x, y), theta) * local.inverse();
        self.reanchors += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// IMU
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuFrameConfig {
    #[serde(default)]
    pub yaw_offset: f64,
    /// Gyro bias in rad/s subtracted from the reported yaw over time.
    #[serde(default)]
    pub drift_rate: f64,
    #[serde(default = "default_true")]
    pub use_rotation: bool,
    #[serde(default = "default_true")]
    pub use_velocity: bool,
    /// Observe x/y from readings that carry a position.
    #[serde(default)]
    pub use_position: bool,
}

impl Default for ImuFrameConfig {
    fn default() -> Self {
        Self {
            yaw_offset: 0.0,
            drift_rate: 0.0,
            use_rotation: true,
            use_velocity: true,
            use_position: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImuFrame {
    config: ImuFrameConfig,
    first_timestamp: Option<f64>,
}

impl ImuFrame {
    pub fn new(config: ImuFrameConfig) -> Self {
        Self {
            config,
            first_timestamp: None,
        }
    }

    /// Velocity and position, when reported, are taken to be in the world
    /// frame already.
    pub fn transform(&mut self, reading: &ImuReading) -> Measurement {
        let first = *self.first_timestamp.get_or_insert(reading.timestamp);
        let elapsed = (reading.timestamp - first).max(0.0);

        let mut m = Measurement::new(SensorKind::Imu, reading.sensor_id.as_str(), reading.timestamp);
        if self.config.use_rotation {
            let theta = reading.yaw_rad + self.config.yaw_offset - self.config.drift_rate * elapsed;
            m = m.observe(index::THETA, wrap_angle(theta));
        }
        if self.config.use_velocity
            && let Some([vx, vy]) = reading.velocity
        {
            m = m.observe(index::VX, vx).observe(index::VY, vy);
        }
        if self.config.use_position
            && let Some([x, y]) = reading.position
        {
            m = m.observe(index::X, x).observe(index::Y, y);
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_6, PI};

    const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    fn solver(tags: Vec<TagConfig>, camera: CameraConfig) -> TagSolver {
        let mut cameras = HashMap::new();
        cameras.insert("front".to_string(), camera);
        TagSolver::from_config(&tags, &cameras).unwrap()
    }

    fn forward_camera() -> CameraConfig {
        CameraConfig {
            position: [0.0; 3],
            direction: [1.0, 0.0, 0.0],
        }
    }

    fn tag(id: u32, x: f64, y: f64, direction: [f64; 3]) -> TagConfig {
        TagConfig { id, x, y, z: 0.0, direction }
    }

    /// Express a body-convention tag pose in the optical convention.
    fn optical_detection(tag_id: u32, r_body: Matrix3<f64>, t_body: Vector3<f64>) -> DetectedTag {
        let m = optical_to_body();
        let r = m.transpose() * r_body * m;
        let t = m.transpose() * t_body;
        DetectedTag {
            tag_id,
            rotation: [
                [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
            ],
            translation: [t.x, t.y, t.z],
            confidence: 20.0,
        }
    }

    fn straight_ahead(tag_id: u32, distance: f64) -> DetectedTag {
        DetectedTag {
            tag_id,
            rotation: IDENTITY,
            translation: [0.0, 0.0, distance],
            confidence: 20.0,
        }
    }

    #[test]
    fn optical_to_body_is_a_proper_rotation() {
        let m = optical_to_body();
        assert_relative_eq!(m.determinant(), 1.0);
        // Optical forward (z) is body forward (x).
        assert_relative_eq!(m * Vector3::z(), Vector3::x());
        // Optical down (y) is body down (-z).
        assert_relative_eq!(m * Vector3::y(), -Vector3::z());
    }

    #[test]
    fn pose_from_direction_builds_orthonormal_frame() {
        let pose = pose_from_direction([1.0, 2.0, 0.5], [0.0, 2.0, 0.0]).unwrap();
        assert_relative_eq!(heading_of(&pose), FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation * Vector3::z(), Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(pose.translation.vector, Vector3::new(1.0, 2.0, 0.5));
    }

    #[test]
    fn pose_from_direction_rejects_degenerate_directions() {
        assert!(pose_from_direction([0.0; 3], [0.0; 3]).is_err());
        assert!(pose_from_direction([0.0; 3], [0.0, 0.0, 1.0]).is_err());
        assert!(pose_from_direction([f64::NAN, 0.0, 0.0], [1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn tag_straight_ahead_puts_robot_in_front_of_tag() {
        let s = solver(vec![tag(1, 5.0, 0.0, [1.0, 0.0, 0.0])], forward_camera());
        let m = s.solve("front", 1.0, &straight_ahead(1, 5.0), None).unwrap();
        assert_relative_eq!(m.observation[index::X], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::Y], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::THETA], 0.0, epsilon = 1e-9);
        assert_eq!(m.observed, [true, true, false, false, true]);
        assert_relative_eq!(m.range_m.unwrap(), 5.0, epsilon = 1e-9);
        assert_eq!(m.confidence, Some(20.0));
    }

    #[test]
    fn tag_solve_follows_robot_heading() {
        // Robot at (1, 2) facing +y sees a tag 5 m ahead.
        let s = solver(vec![tag(4, 1.0, 7.0, [0.0, 1.0, 0.0])], forward_camera());
        let m = s.solve("front", 0.0, &straight_ahead(4, 5.0), None).unwrap();
        assert_relative_eq!(m.observation[index::X], 1.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::Y], 2.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::THETA], FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn tag_solve_recovers_rotated_robot() {
        // Robot at the origin turned 30° left; tag at (5, 0) facing it.
        let heading = FRAC_PI_6;
        let r_world_robot = Rotation3::from_axis_angle(&Vector3::z_axis(), heading);
        let r_body = r_world_robot.inverse().into_inner();
        let t_body = r_world_robot.inverse() * Vector3::new(5.0, 0.0, 0.0);

        let s = solver(vec![tag(2, 5.0, 0.0, [1.0, 0.0, 0.0])], forward_camera());
        let m = s.solve("front", 0.0, &optical_detection(2, r_body, t_body), None).unwrap();
        assert_relative_eq!(m.observation[index::X], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::Y], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::THETA], heading, epsilon = 1e-9);
    }

    #[test]
    fn camera_extrinsics_are_applied() {
        let mounted = CameraConfig {
            position: [0.3, 0.0, 0.2],
            direction: [1.0, 0.0, 0.0],
        };
        let s = solver(vec![tag(1, 5.0, 0.0, [1.0, 0.0, 0.0])], mounted);
        let m = s.solve("front", 0.0, &straight_ahead(1, 5.0), None).unwrap();
        assert_relative_eq!(m.observation[index::X], -0.3, epsilon = 1e-9);

        let left = CameraConfig {
            position: [0.0; 3],
            direction: [0.0, 1.0, 0.0],
        };
        let s = solver(vec![tag(1, 0.0, 2.0, [0.0, 1.0, 0.0])], left);
        let m = s.solve("front", 0.0, &straight_ahead(1, 2.0), None).unwrap();
        assert_relative_eq!(m.observation[index::X], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::Y], 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::THETA], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn known_heading_observes_position_only() {
        let s = solver(vec![tag(1, 1.0, 7.0, [0.0, 1.0, 0.0])], forward_camera());
        let m = s.solve("front", 0.0, &straight_ahead(1, 5.0), Some(FRAC_PI_2)).unwrap();
        assert_eq!(m.observed, [true, true, false, false, false]);
        assert_relative_eq!(m.observation[index::X], 1.0, epsilon = 1e-9);
        assert_relative_eq!(m.observation[index::Y], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn unknown_tag_and_camera_are_skipped() {
        let s = solver(vec![tag(1, 5.0, 0.0, [1.0, 0.0, 0.0])], forward_camera());
        assert_eq!(
            s.solve("front", 0.0, &straight_ahead(99, 5.0), None).unwrap_err(),
            SkipReason::UnknownTag(99)
        );
        assert!(matches!(
            s.solve("rear", 0.0, &straight_ahead(1, 5.0), None).unwrap_err(),
            SkipReason::UnknownSensor { kind: SensorKind::AprilTag, .. }
        ));
    }

    #[test]
    fn degenerate_rotations_are_skipped() {
        let s = solver(vec![tag(1, 5.0, 0.0, [1.0, 0.0, 0.0])], forward_camera());
        let mut scaled = straight_ahead(1, 5.0);
        scaled.rotation = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]];
        assert!(matches!(
            s.solve("front", 0.0, &scaled, None),
            Err(SkipReason::DegenerateRotation(_))
        ));

        let mut reflected = straight_ahead(1, 5.0);
        reflected.rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]];
        assert!(matches!(
            s.solve("front", 0.0, &reflected, None),
            Err(SkipReason::DegenerateRotation(_))
        ));

        let mut nan = straight_ahead(1, 5.0);
        nan.rotation[0][0] = f64::NAN;
        assert!(s.solve("front", 0.0, &nan, None).is_err());
    }

    #[test]
    fn duplicate_tag_ids_are_rejected() {
        let tags = vec![tag(1, 0.0, 0.0, [1.0, 0.0, 0.0]), tag(1, 1.0, 0.0, [1.0, 0.0, 0.0])];
        assert!(TagSolver::from_config(&tags, &HashMap::new()).is_err());
    }

    fn odom(position: [f64; 2], heading: f64) -> OdometryReading {
        OdometryReading {
            sensor_id: "swerve".into(),
            timestamp: 0.0,
            position,
            velocity: [1.0, 0.0],
            heading_rad: heading,
        }
    }

    #[test]
    fn odometry_offset_maps_local_into_world() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig {
            global_position: [1.0, 2.0],
            yaw_offset: FRAC_PI_2,
            ..Default::default()
        });
        let m = frame.transform(&odom([1.0, 0.0], 0.0), None);
        assert_relative_eq!(m.observation[index::X], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::Y], 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::VX], 0.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::VY], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::THETA], FRAC_PI_2, epsilon = 1e-12);
        assert_eq!(m.observed, [true; 5]);
    }

    #[test]
    fn odometry_local_position_is_subtracted() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig {
            global_position: [3.0, 0.0],
            local_position: [10.0, 10.0],
            ..Default::default()
        });
        let m = frame.transform(&odom([10.0, 11.0], 0.0), None);
        assert_relative_eq!(m.observation[index::X], 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::Y], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn odometry_drift_reanchors_to_estimate() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig {
            max_r2_drift: 1.0,
            ..Default::default()
        });
        let m = frame.transform(&odom([0.0, 0.0], 0.0), Some([10.0, 10.0]));
        assert_relative_eq!(m.observation[index::X], 10.0, epsilon = 1e-12);
        assert_eq!(frame.reanchor_count(), 1);

        let m = frame.transform(&odom([1.0, 0.0], 0.0), Some([10.5, 10.0]));
        assert_relative_eq!(m.observation[index::X], 11.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::Y], 10.0, epsilon = 1e-12);
        assert_eq!(frame.reanchor_count(), 1);
    }

    #[test]
    fn odometry_drift_disabled_when_threshold_not_positive() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig::default());
        let m = frame.transform(&odom([0.0, 0.0], 0.0), Some([100.0, 0.0]));
        assert_relative_eq!(m.observation[index::X], 0.0);
        assert_eq!(frame.reanchor_count(), 0);
    }

    #[test]
    fn odometry_reanchor_to_explicit_pose() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig::default());
        frame.transform(&odom([2.0, 0.0], 0.0), None);
        frame.reanchor(5.0, 5.0, FRAC_PI_2);

        let m = frame.transform(&odom([2.0, 0.0], 0.0), None);
        assert_relative_eq!(m.observation[index::X], 5.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::Y], 5.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::THETA], FRAC_PI_2, epsilon = 1e-12);

        let m = frame.transform(&odom([3.0, 0.0], 0.0), None);
        assert_relative_eq!(m.observation[index::X], 5.0, epsilon = 1e-12);
        assert_relative_eq!(m.observation[index::Y], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn odometry_flags_limit_observed_components() {
        let mut frame = OdometryFrame::new(OdometryFrameConfig {
            use_position: false,
            use_rotation: false,
            ..Default::default()
        });
        let m = frame.transform(&odom([1.0, 1.0], 1.0), None);
        assert_eq!(m.observed, [false, false, true, true, false]);
    }

    #[test]
    fn imu_applies_offset_and_drift() {
        let mut frame = ImuFrame::new(ImuFrameConfig {
            yaw_offset: 0.2,
            drift_rate: 0.01,
            ..Default::default()
        });
        let reading = |t: f64| ImuReading {
            sensor_id: "navx".into(),
            timestamp: t,
            yaw_rad: 0.1,
            velocity: None,
            position: None,
        };
        let m = frame.transform(&reading(5.0));
        assert_relative_eq!(m.observation[index::THETA], 0.3, epsilon = 1e-12);
        assert_eq!(m.observed, [false, false, false, false, true]);

        let m = frame.transform(&reading(15.0));
        assert_relative_eq!(m.observation[index::THETA], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn imu_wraps_heading_and_observes_velocity() {
        let mut frame = ImuFrame::new(ImuFrameConfig {
            yaw_offset: PI,
            ..Default::default()
        });
        let m = frame.transform(&ImuReading {
            sensor_id: "navx".into(),
            timestamp: 0.0,
            yaw_rad: 0.5,
            velocity: Some([0.4, -0.2]),
            position: None,
        });
        assert_relative_eq!(m.observation[index::THETA], 0.5 - PI, epsilon = 1e-12);
        assert_eq!(m.observed, [false, false, true, true, true]);
        assert_relative_eq!(m.observation[index::VY], -0.2);
    }

    #[test]
    fn imu_position_is_observed_only_when_enabled() {
        let reading = ImuReading {
            sensor_id: "navx".into(),
            timestamp: 0.0,
            yaw_rad: 0.0,
            velocity: None,
            position: Some([1.5, -2.0]),
        };

        let m = ImuFrame::new(ImuFrameConfig::default()).transform(&reading);
        assert!(!m.observed[index::X] && !m.observed[index::Y]);

        let mut frame = ImuFrame::new(ImuFrameConfig {
            use_position: true,
            ..Default::default()
        });
        let m = frame.transform(&reading);
        assert_eq!(m.observed, [true, true, false, false, true]);
        assert_relative_eq!(m.observation[index::X], 1.5);
        assert_relative_eq!(m.observation[index::Y], -2.0);

        let m = frame.transform(&ImuReading { position: None, ..reading });
        assert_eq!(m.observed, [false, false, false, false, true]);
    }
}
