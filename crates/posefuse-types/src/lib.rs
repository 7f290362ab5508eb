use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Dimension of the canonical state vector `[x, y, vx, vy, theta]`.
pub const STATE_DIM: usize = 5;

/// Indices into the canonical state vector.
pub mod index {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const VX: usize = 2;
    pub const VY: usize = 3;
    pub const THETA: usize = 4;
}

/// The closed set of sensor families the fusion engine understands.
///
/// Dispatch over this enum is always exhaustive, so adding a new family is a
/// compile error everywhere a case would otherwise be silently missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Fiducial detections from a calibrated camera.
    AprilTag,
    /// Wheel odometry.
    Odometry,
    /// Inertial measurement unit (heading, optionally velocity).
    Imu,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::AprilTag, SensorKind::Odometry, SensorKind::Imu];
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::AprilTag => write!(f, "april_tag"),
            SensorKind::Odometry => write!(f, "odometry"),
            SensorKind::Imu => write!(f, "imu"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Raw sensor messages
// ────────────────────────────────────────────────────────────────────────────

/// One tag seen by a camera, expressed in the camera's optical frame
/// (x right, y down, z forward).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedTag {
    pub tag_id: u32,
    /// Row-major rotation of the tag relative to the camera.
    pub rotation: [[f64; 3]; 3],
    /// Translation of the tag relative to the camera (metres).
    pub translation: [f64; 3],
    /// Detector decision margin / confidence.
    pub confidence: f64,
}

/// All tags detected in a single camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDetectionFrame {
    pub camera_id: String,
    /// Capture time in seconds.
    pub timestamp: f64,
    pub tags: Vec<DetectedTag>,
}

/// Cumulative pose reported by an odometry source in its own local frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometryReading {
    pub sensor_id: String,
    pub timestamp: f64,
    pub position: [f64; 2],
    /// Velocity in the odometry local frame (m/s).
    pub velocity: [f64; 2],
    pub heading_rad: f64,
}

/// Orientation (and optionally velocity) from an IMU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    pub sensor_id: String,
    pub timestamp: f64,
    pub yaw_rad: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f64; 2]>,
    /// World position, for IMUs that integrate their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
}

/// Trusted override that force-resets the filter to a known pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPositionCommand {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub theta_rad: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f64; 2]>,
    /// Row-major covariance. Falls back to the configured initial covariance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance: Option<Vec<Vec<f64>>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Measurement
// ────────────────────────────────────────────────────────────────────────────

/// A sensor reading converted into the state-space basis.
///
/// Created per incoming message, consumed once by the scheduler and then
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub timestamp: f64,
    pub kind: SensorKind,
    pub sensor_id: String,
    /// Observation expressed as a full state vector (length [`STATE_DIM`]).
    pub observation: Vec<f64>,
    /// Which state components this reading actually observes.
    pub observed: [bool; STATE_DIM],
    pub confidence: Option<f64>,
    /// Distance between the robot and the observed landmark, when known.
    pub range_m: Option<f64>,
}

impl Measurement {
    /// Observes nothing yet; callers fill in components with [`Measurement::observe`].
    pub fn new(kind: SensorKind, sensor_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            timestamp,
            kind,
            sensor_id: sensor_id.into(),
            observation: vec![0.0; STATE_DIM],
            observed: [false; STATE_DIM],
            confidence: None,
            range_m: None,
        }
    }

    pub fn observe(mut self, index: usize, value: f64) -> Self {
        self.observation[index] = value;
        self.observed[index] = true;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_range(mut self, range_m: f64) -> Self {
        self.range_m = Some(range_m);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// The fused robot pose emitted on the output topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotPose {
    pub sequence: u64,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub theta_rad: f64,
    /// `[cos θ, sin θ]`, for consumers that avoid angle wraparound.
    pub direction: [f64; 2],
    /// Scalar uncertainty reported by the active strategy (lower is better).
    pub uncertainty: f64,
    /// Row-major state covariance.
    pub covariance: Vec<f64>,
    pub strategy: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the topic bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "posefuse-runtime::publisher"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    TagDetections(TagDetectionFrame),
    Odometry(OdometryReading),
    Imu(ImuReading),
    SetPosition(SetPositionCommand),
    RobotPosition(RobotPose),
    FusionSkipped {
        kind: SensorKind,
        sensor_id: String,
        reason: String,
    },
}

impl EventPayload {
    /// Sensor timestamp carried by the payload, used to order merged input.
    pub fn sensor_timestamp(&self) -> Option<f64> {
        match self {
            EventPayload::TagDetections(frame) => Some(frame.timestamp),
            EventPayload::Odometry(reading) => Some(reading.timestamp),
            EventPayload::Imu(reading) => Some(reading.timestamp),
            EventPayload::SetPosition(cmd) => Some(cmd.timestamp),
            EventPayload::RobotPosition(pose) => Some(pose.timestamp),
            EventPayload::FusionSkipped { .. } => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Fatal errors. Raised during startup validation or by the transport layer;
/// never produced by the per-measurement path.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoseError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Dimension Mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: String,
        found: String,
    },

    #[error("No sensor model configured for {kind} sensor '{sensor_id}'")]
    MissingSensorModel { kind: SensorKind, sensor_id: String },

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

/// Why a measurement was dropped. Recoverable: the state is left untouched.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    #[error("out-of-order timestamp (dt = {dt:.4} s)")]
    Stale { dt: f64 },

    #[error("confidence {confidence} below threshold {threshold}")]
    LowConfidence { confidence: f64, threshold: f64 },

    #[error("tag range {distance:.3} m beyond discard distance {limit} m")]
    BeyondDiscardDistance { distance: f64, limit: f64 },

    #[error("tag {0} is not in the tag position table")]
    UnknownTag(u32),

    #[error("no calibration for {kind} sensor '{sensor_id}'")]
    UnknownSensor { kind: SensorKind, sensor_id: String },

    #[error("degenerate rotation: {0}")]
    DegenerateRotation(String),

    #[error("innovation covariance ill-conditioned (condition number {condition:e})")]
    IllConditioned { condition: f64 },

    #[error("measurement observes no configured state component")]
    NothingObserved,

    #[error("measurement shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{0} input is disabled")]
    SourceDisabled(SensorKind),

    #[error("non-finite value in {0}")]
    NonFinite(String),
}

impl SkipReason {
    /// Stable short label, used as a metrics/counter key.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Stale { .. } => "stale",
            SkipReason::LowConfidence { .. } => "low_confidence",
            SkipReason::BeyondDiscardDistance { .. } => "beyond_discard_distance",
            SkipReason::UnknownTag(_) => "unknown_tag",
            SkipReason::UnknownSensor { .. } => "unknown_sensor",
            SkipReason::DegenerateRotation(_) => "degenerate_rotation",
            SkipReason::IllConditioned { .. } => "ill_conditioned",
            SkipReason::NothingObserved => "nothing_observed",
            SkipReason::ShapeMismatch(_) => "shape_mismatch",
            SkipReason::SourceDisabled(_) => "source_disabled",
            SkipReason::NonFinite(_) => "non_finite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_kind_serializes_snake_case() {
        let json = serde_json::to_string(&SensorKind::AprilTag).unwrap();
        assert_eq!(json, "\"april_tag\"");
        let back: SensorKind = serde_json::from_str("\"imu\"").unwrap();
        assert_eq!(back, SensorKind::Imu);
    }

    #[test]
    fn sensor_kind_display_matches_serde_name() {
        for kind in SensorKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn measurement_builder_marks_observed_components() {
        let m = Measurement::new(SensorKind::Imu, "navx", 1.5)
            .observe(index::THETA, 0.25)
            .with_confidence(0.9);
        assert_eq!(m.observed, [false, false, false, false, true]);
        assert_eq!(m.observation[index::THETA], 0.25);
        assert_eq!(m.confidence, Some(0.9));
        assert!(m.range_m.is_none());
    }

    #[test]
    fn event_payload_roundtrip_preserves_tags() {
        let event = Event::new(
            "camera::front_right",
            EventPayload::TagDetections(TagDetectionFrame {
                camera_id: "front_right".into(),
                timestamp: 12.5,
                tags: vec![DetectedTag {
                    tag_id: 7,
                    rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                    translation: [0.0, 0.0, 2.0],
                    confidence: 40.0,
                }],
            }),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        match back.payload {
            EventPayload::TagDetections(frame) => {
                assert_eq!(frame.tags.len(), 1);
                assert_eq!(frame.tags[0].tag_id, 7);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn imu_reading_velocity_is_optional_on_the_wire() {
        let reading: ImuReading =
            serde_json::from_str(r#"{"sensor_id":"navx","timestamp":3.0,"yaw_rad":0.5}"#).unwrap();
        assert!(reading.velocity.is_none());
        assert!(reading.position.is_none());
    }

    #[test]
    fn sensor_timestamp_extracts_from_inputs() {
        let payload = EventPayload::Imu(ImuReading {
            sensor_id: "navx".into(),
            timestamp: 4.25,
            yaw_rad: 0.0,
            velocity: None,
            position: None,
        });
        assert_eq!(payload.sensor_timestamp(), Some(4.25));
        let skipped = EventPayload::FusionSkipped {
            kind: SensorKind::Imu,
            sensor_id: "navx".into(),
            reason: "x".into(),
        };
        assert_eq!(skipped.sensor_timestamp(), None);
    }

    #[test]
    fn pose_error_display() {
        let err = PoseError::MissingSensorModel {
            kind: SensorKind::Odometry,
            sensor_id: "swerve".into(),
        };
        assert!(err.to_string().contains("odometry"));
        assert!(err.to_string().contains("swerve"));
    }

    #[test]
    fn skip_reason_labels_are_distinct() {
        let reasons = [
            SkipReason::Stale { dt: -0.1 },
            SkipReason::LowConfidence { confidence: 0.1, threshold: 1.0 },
            SkipReason::BeyondDiscardDistance { distance: 9.0, limit: 5.0 },
            SkipReason::UnknownTag(3),
            SkipReason::UnknownSensor { kind: SensorKind::Imu, sensor_id: "x".into() },
            SkipReason::DegenerateRotation("det".into()),
            SkipReason::IllConditioned { condition: 1e20 },
            SkipReason::NothingObserved,
            SkipReason::ShapeMismatch("z".into()),
            SkipReason::SourceDisabled(SensorKind::Imu),
        ];
        let mut labels: Vec<_> = reasons.iter().map(SkipReason::label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), reasons.len());
    }
}
