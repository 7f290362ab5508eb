//! [`FusionConfig`] – the startup configuration of the fusion engine.
//!
//! One TOML document describes the filter, the per-sensor models, the
//! calibration tables and the scheduler. Every section is optional; missing
//! fields fall back to the defaults below. See `config/posefuse.toml` for an
//! annotated sample.
//!
//! | Section | Contents |
//! |---|---|
//! | `[filter]` | initial state and covariance, transition, process noise, strategy |
//! | `[gating]` | confidence floor, discard distance, filter-rotation mode |
//! | `[sources]` | `enable_tags` / `enable_odom` / `enable_imu` |
//! | `[topics]` | bus topic names |
//! | `[sensors.<kind>.<id>]` | conversion and noise matrices per sensor |
//! | `[[tags]]`, `[cameras.<id>]` | AprilTag world poses and camera extrinsics |
//! | `[odometry.<id>]`, `[imu.<id>]` | frame placement of each odometry / IMU source |
//! | `[scheduler]` | queue capacity, idle timer, liveness timeout |
//!
//! [`FusionConfig::validate`] is called once by
//! [`FusionEngine::from_config`][crate::engine::FusionEngine::from_config];
//! every error it reports is fatal at startup.

use std::collections::HashMap;

use posefuse_middleware::topics;
use posefuse_perception::linalg::{matrix_from_rows, vector_from_slice};
use posefuse_perception::{
    CameraConfig, ImuFrameConfig, OdometryFrameConfig, SensorModelConfig, StrategyKind, TagConfig,
};
use posefuse_types::{PoseError, STATE_DIM, SensorKind};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Root
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub gating: GatingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
    #[serde(default = "default_cameras")]
    pub cameras: HashMap<String, CameraConfig>,
    #[serde(default = "default_odometry_frames")]
    pub odometry: HashMap<String, OdometryFrameConfig>,
    #[serde(default = "default_imu_frames")]
    pub imu: HashMap<String, ImuFrameConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            gating: GatingConfig::default(),
            sources: SourcesConfig::default(),
            topics: TopicsConfig::default(),
            sensors: SensorsConfig::default(),
            tags: Vec::new(),
            cameras: default_cameras(),
            odometry: default_odometry_frames(),
            imu: default_imu_frames(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

/// Filter initialisation. Matrices are written as lists of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Samples kept by the windowed strategies.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// `[x, y, vx, vy, theta]`.
    #[serde(default = "default_initial_state")]
    pub initial_state: Vec<f64>,
    #[serde(default = "default_initial_covariance")]
    pub initial_covariance: Vec<Vec<f64>>,
    /// Transition for one `time_step_initial`; rescaled to the actual `dt`.
    #[serde(default = "default_state_transition")]
    pub state_transition_matrix: Vec<Vec<f64>>,
    #[serde(default = "default_time_step")]
    pub time_step_initial: f64,
    #[serde(default = "default_process_noise")]
    pub process_noise_matrix: Vec<Vec<f64>>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            history_window: default_history_window(),
            initial_state: default_initial_state(),
            initial_covariance: default_initial_covariance(),
            state_transition_matrix: default_state_transition(),
            time_step_initial: default_time_step(),
            process_noise_matrix: default_process_noise(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatingConfig {
    #[serde(default = "default_confidence_threshold")]
    pub tag_confidence_threshold: f64,
    /// Metres between robot and tag beyond which a detection is dropped.
    #[serde(default = "default_discard_distance")]
    pub april_tag_discard_distance: f64,
    /// Solve tags with the filter's heading once odometry or IMU supplied one.
    #[serde(default)]
    pub tag_use_filter_rotation: bool,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            tag_confidence_threshold: default_confidence_threshold(),
            april_tag_discard_distance: default_discard_distance(),
            tag_use_filter_rotation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub enable_tags: bool,
    #[serde(default)]
    pub enable_odom: bool,
    #[serde(default)]
    pub enable_imu: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            enable_tags: true,
            enable_odom: false,
            enable_imu: false,
        }
    }
}

impl SourcesConfig {
    pub fn is_enabled(&self, kind: SensorKind) -> bool {
        match kind {
            SensorKind::AprilTag => self.enable_tags,
            SensorKind::Odometry => self.enable_odom,
            SensorKind::Imu => self.enable_imu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub tag_input: String,
    pub odometry_input: String,
    pub imu_input: String,
    pub set_position: String,
    pub robot_position_output: String,
    pub fusion_diagnostics: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            tag_input: topics::TAG_INPUT.to_string(),
            odometry_input: topics::ODOMETRY_INPUT.to_string(),
            imu_input: topics::IMU_INPUT.to_string(),
            set_position: topics::SET_POSITION.to_string(),
            robot_position_output: topics::ROBOT_POSITION_OUTPUT.to_string(),
            fusion_diagnostics: topics::FUSION_DIAGNOSTICS.to_string(),
        }
    }
}

impl TopicsConfig {
    /// Input topic carrying readings of `kind`.
    pub fn input_for(&self, kind: SensorKind) -> &str {
        match kind {
            SensorKind::AprilTag => &self.tag_input,
            SensorKind::Odometry => &self.odometry_input,
            SensorKind::Imu => &self.imu_input,
        }
    }
}

/// Sensor models keyed by sensor id (camera id for AprilTags).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorsConfig {
    #[serde(default = "default_tag_models")]
    pub april_tag: HashMap<String, SensorModelConfig>,
    #[serde(default = "default_odometry_models")]
    pub odometry: HashMap<String, SensorModelConfig>,
    #[serde(default = "default_imu_models")]
    pub imu: HashMap<String, SensorModelConfig>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            april_tag: default_tag_models(),
            odometry: default_odometry_models(),
            imu: default_imu_models(),
        }
    }
}

impl SensorsConfig {
    pub fn table(&self, kind: SensorKind) -> &HashMap<String, SensorModelConfig> {
        match kind {
            SensorKind::AprilTag => &self.april_tag,
            SensorKind::Odometry => &self.odometry,
            SensorKind::Imu => &self.imu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Per-topic broadcast capacity; slower consumers lose the oldest messages.
    pub queue_capacity: usize,
    /// Idle tick period when no input arrives.
    pub idle_timeout_ms: u64,
    /// Extrapolate the pose to the wall clock on idle ticks.
    pub idle_predict: bool,
    /// A source with no message for this long is reported silent.
    pub sensor_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: posefuse_middleware::DEFAULT_CAPACITY,
            idle_timeout_ms: 100,
            idle_predict: false,
            sensor_timeout_ms: 1000,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Defaults
// ────────────────────────────────────────────────────────────────────────────

const DEFAULT_CAMERA: &str = "front_right";
const DEFAULT_ODOMETRY: &str = "swerve";
const DEFAULT_IMU: &str = "navx";

fn default_true() -> bool {
    true
}
fn default_history_window() -> usize {
    10
}
fn default_time_step() -> f64 {
    0.1
}
fn default_confidence_threshold() -> f64 {
    1.0
}
fn default_discard_distance() -> f64 {
    1000.0
}
fn default_initial_state() -> Vec<f64> {
    vec![0.0; STATE_DIM]
}

fn diagonal(values: [f64; STATE_DIM]) -> Vec<Vec<f64>> {
    (0..STATE_DIM)
        .map(|r| (0..STATE_DIM).map(|c| if r == c { values[r] } else { 0.0 }).collect())
        .collect()
}

fn default_initial_covariance() -> Vec<Vec<f64>> {
    diagonal([10.0, 10.0, 2.0, 2.0, 1.0])
}

fn default_process_noise() -> Vec<Vec<f64>> {
    diagonal([0.01, 0.01, 0.1, 0.1, 0.01])
}

fn default_state_transition() -> Vec<Vec<f64>> {
    let mut f = diagonal([1.0; STATE_DIM]);
    f[0][2] = 0.1;
    f[1][3] = 0.1;
    f
}

fn default_tag_models() -> HashMap<String, SensorModelConfig> {
    HashMap::from([(
        DEFAULT_CAMERA.to_string(),
        SensorModelConfig::diagonal([0.5, 0.5, 1000.0, 1000.0, 1000.0]),
    )])
}

fn default_odometry_models() -> HashMap<String, SensorModelConfig> {
    HashMap::from([(
        DEFAULT_ODOMETRY.to_string(),
        SensorModelConfig::diagonal([0.05, 0.05, 0.01, 0.01, 0.02]),
    )])
}

fn default_imu_models() -> HashMap<String, SensorModelConfig> {
    HashMap::from([(
        DEFAULT_IMU.to_string(),
        SensorModelConfig::diagonal([0.5, 0.5, 0.01, 0.01, 0.2]),
    )])
}

fn default_cameras() -> HashMap<String, CameraConfig> {
    let h = std::f64::consts::FRAC_1_SQRT_2;
    HashMap::from([(
        DEFAULT_CAMERA.to_string(),
        CameraConfig {
            position: [h * 0.2, -h * 0.2, 0.0],
            direction: [h, -h, 0.0],
        },
    )])
}

fn default_odometry_frames() -> HashMap<String, OdometryFrameConfig> {
    HashMap::from([(DEFAULT_ODOMETRY.to_string(), OdometryFrameConfig::default())])
}

fn default_imu_frames() -> HashMap<String, ImuFrameConfig> {
    HashMap::from([(DEFAULT_IMU.to_string(), ImuFrameConfig::default())])
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

impl FusionConfig {
    /// Check shapes, scalar ranges and cross-table references.
    pub fn validate(&self) -> Result<(), PoseError> {
        let f = &self.filter;
        vector_from_slice("initial_state", &f.initial_state, STATE_DIM)?;
        let square = (Some(STATE_DIM), Some(STATE_DIM));
        matrix_from_rows("initial_covariance", &f.initial_covariance, square)?;
        matrix_from_rows("state_transition_matrix", &f.state_transition_matrix, square)?;
        matrix_from_rows("process_noise_matrix", &f.process_noise_matrix, square)?;
        if !(f.time_step_initial > 0.0) {
            return Err(PoseError::Config(format!(
                "time_step_initial must be positive, got {}",
                f.time_step_initial
            )));
        }
        if f.history_window == 0 {
            return Err(PoseError::Config("history_window must be at least 1".into()));
        }

        if !self.gating.tag_confidence_threshold.is_finite() {
            return Err(PoseError::Config("tag_confidence_threshold must be finite".into()));
        }
        if !(self.gating.april_tag_discard_distance > 0.0) {
            return Err(PoseError::Config(format!(
                "april_tag_discard_distance must be positive, got {}",
                self.gating.april_tag_discard_distance
            )));
        }

        if self.scheduler.queue_capacity == 0 {
            return Err(PoseError::Config("scheduler.queue_capacity must be at least 1".into()));
        }
        if self.scheduler.idle_timeout_ms == 0 {
            return Err(PoseError::Config("scheduler.idle_timeout_ms must be at least 1".into()));
        }

        self.validate_topics()?;
        self.validate_sources()
    }

    fn validate_topics(&self) -> Result<(), PoseError> {
        let t = &self.topics;
        let all = [
            ("tag_input", &t.tag_input),
            ("odometry_input", &t.odometry_input),
            ("imu_input", &t.imu_input),
            ("set_position", &t.set_position),
            ("robot_position_output", &t.robot_position_output),
            ("fusion_diagnostics", &t.fusion_diagnostics),
        ];
        if let Some((name, _)) = all.iter().find(|(_, topic)| topic.trim().is_empty()) {
            return Err(PoseError::Config(format!("topics.{name} is empty")));
        }
        for (i, (name, topic)) in all.iter().enumerate() {
            if let Some((other, _)) = all[i + 1..].iter().find(|(_, t)| t == topic) {
                return Err(PoseError::Config(format!(
                    "topics.{name} and topics.{other} share the topic '{topic}'"
                )));
            }
        }
        Ok(())
    }

    fn validate_sources(&self) -> Result<(), PoseError> {
        if self.sources.enable_tags {
            if self.cameras.is_empty() {
                return Err(PoseError::Config("enable_tags is set but no camera is configured".into()));
            }
            let mut cameras: Vec<&String> = self.cameras.keys().collect();
            cameras.sort();
            for id in cameras {
                self.require_model(SensorKind::AprilTag, id)?;
            }
        }
        if self.sources.enable_odom {
            if self.odometry.is_empty() {
                return Err(PoseError::Config("enable_odom is set but no odometry frame is configured".into()));
            }
            let mut ids: Vec<&String> = self.odometry.keys().collect();
            ids.sort();
            for id in ids {
                self.require_model(SensorKind::Odometry, id)?;
            }
        }
        if self.sources.enable_imu {
            if self.imu.is_empty() {
                return Err(PoseError::Config("enable_imu is set but no IMU frame is configured".into()));
            }
            let mut ids: Vec<&String> = self.imu.keys().collect();
            ids.sort();
            for id in ids {
                self.require_model(SensorKind::Imu, id)?;
            }
        }
        Ok(())
    }

    fn require_model(&self, kind: SensorKind, sensor_id: &str) -> Result<(), PoseError> {
        if self.sensors.table(kind).contains_key(sensor_id) {
            Ok(())
        } else {
            Err(PoseError::MissingSensorModel {
                kind,
                sensor_id: sensor_id.to_string(),
            })
        }
    }

    /// Sensor ids of every enabled source, as `(kind, id)` pairs sorted by
    /// kind then id.
    pub fn enabled_sensors(&self) -> Vec<(SensorKind, String)> {
        let mut out = Vec::new();
        for kind in SensorKind::ALL {
            if !self.sources.is_enabled(kind) {
                continue;
            }
            let mut ids: Vec<String> = match kind {
                SensorKind::AprilTag => self.cameras.keys().cloned().collect(),
                SensorKind::Odometry => self.odometry.keys().cloned().collect(),
                SensorKind::Imu => self.imu.keys().cloned().collect(),
            };
            ids.sort();
            out.extend(ids.into_iter().map(|id| (kind, id)));
        }
        out
    }
}
