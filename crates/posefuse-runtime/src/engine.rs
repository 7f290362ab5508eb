//! [`FusionEngine`] – the single-writer fusion context.
//!
//! The engine owns the active [`PoseEstimationStrategy`], the sensor
//! registry, the coordinate transforms and the acceptance gate. Each reading
//! goes through the same pipeline:
//!
//! ```text
//! enabled? ─► stale? ─► transform ─► gate ─► project ─► checkpoint
//!                                                         │
//!            Idle ◄── update (roll back on error) ◄── predict(dt)
//! ```
//!
//! Nothing before the checkpoint mutates the estimate, so a rejected reading
//! leaves the state untouched. `last_update` (the staleness baseline)
//! advances only on accepted readings and on [`FusionEngine::set_position`].
//!
//! # Example
//!
//! ```
//! use posefuse_runtime::config::FusionConfig;
//! use posefuse_runtime::engine::{FusionEngine, FusionOutcome};
//! use posefuse_types::OdometryReading;
//!
//! let mut cfg = FusionConfig::default();
//! cfg.sources.enable_odom = true;
//! let mut engine = FusionEngine::from_config(&cfg).unwrap();
//!
//! let outcome = engine.ingest_odometry(&OdometryReading {
//!     sensor_id: "swerve".into(),
//!     timestamp: 0.5,
//!     position: [1.0, 2.0],
//!     velocity: [0.0, 0.0],
//!     heading_rad: 0.0,
//! });
//! assert!(matches!(outcome, FusionOutcome::Accepted(_)));
//! assert!(engine.pose().x > 0.5);
//! ```

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector};
use posefuse_kernel::MeasurementGate;
use posefuse_perception::linalg::{matrix_from_rows, vector_from_slice, wrap_angle};
use posefuse_perception::{
    ImuFrame, KalmanFilter, OdometryFrame, PoseEstimationStrategy, SensorRegistry, TagSolver,
    TransitionModel, build_strategy,
};
use posefuse_types::{
    ImuReading, Measurement, OdometryReading, PoseError, RobotPose, STATE_DIM, SensorKind,
    SetPositionCommand, SkipReason, TagDetectionFrame, index,
};
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{FusionConfig, SourcesConfig};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Where the engine is within the handling of one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SchedulerPhase {
    #[default]
    Idle,
    Predicting,
    Updating,
}

/// Result of feeding one reading (or one tag detection) to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutcome {
    /// The estimate moved; the new pose is attached.
    Accepted(RobotPose),
    /// The reading was dropped and the estimate is unchanged.
    Skipped {
        kind: SensorKind,
        sensor_id: String,
        reason: SkipReason,
    },
}

impl FusionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FusionOutcome::Accepted(_))
    }
}

/// Running counters, returned by the scheduler on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub accepted: u64,
    /// Skips keyed by [`SkipReason::label`].
    pub skipped: BTreeMap<String, u64>,
    /// Messages lost to bus lag.
    pub dropped: u64,
    pub resets: u64,
    pub idle_predictions: u64,
}

impl FusionStats {
    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ────────────────────────────────────────────────────────────────────────────

pub struct FusionEngine {
    strategy: Box<dyn PoseEstimationStrategy>,
    registry: SensorRegistry,
    solver: TagSolver,
    odometry: HashMap<String, OdometryFrame>,
    imu: HashMap<String, ImuFrame>,
    gate: MeasurementGate,
    sources: SourcesConfig,
    tag_use_filter_rotation: bool,
    initial_covariance: DMatrix<f64>,
    /// Sensor time of the last accepted reading or reset.
    last_update: Option<f64>,
    /// Sensor time the estimate corresponds to (moves ahead on idle predicts).
    predicted_to: Option<f64>,
    /// An odometry or IMU heading has been folded in.
    has_rotation: bool,
    phase: SchedulerPhase,
    sequence: u64,
    stats: FusionStats,
}

impl FusionEngine {
    /// Validate `config` and build every component. All errors are fatal.
    pub fn from_config(config: &FusionConfig) -> Result<Self, PoseError> {
        config.validate()?;
        let f = &config.filter;
        let square = (Some(STATE_DIM), Some(STATE_DIM));

        let state = vector_from_slice("initial_state", &f.initial_state, STATE_DIM)?;
        let covariance = matrix_from_rows("initial_covariance", &f.initial_covariance, square)?;
        let transition = TransitionModel::new(
            matrix_from_rows("state_transition_matrix", &f.state_transition_matrix, square)?,
            f.time_step_initial,
        )?;
        let process_noise = matrix_from_rows("process_noise_matrix", &f.process_noise_matrix, square)?;
        let filter = KalmanFilter::new(state, covariance.clone(), transition, process_noise)?;
        let strategy = build_strategy(f.strategy, filter, f.history_window)?;

        let registry = SensorRegistry::from_configs(
            SensorKind::ALL
                .into_iter()
                .map(|kind| (kind, config.sensors.table(kind))),
        )?;
        registry.validate(STATE_DIM)?;

        let solver = TagSolver::from_config(&config.tags, &config.cameras)?;
        let odometry = config
            .odometry
            .iter()
            .map(|(id, cfg)| (id.clone(), OdometryFrame::new(cfg.clone())))
            .collect();
        let imu = config
            .imu
            .iter()
            .map(|(id, cfg)| (id.clone(), ImuFrame::new(cfg.clone())))
            .collect();
        let gate = MeasurementGate::standard(
            config.gating.tag_confidence_threshold,
            config.gating.april_tag_discard_distance,
        );

        info!(
            strategy = strategy.name(),
            tags = solver.tag_count(),
            sensors = registry.len(),
            enable_tags = config.sources.enable_tags,
            enable_odom = config.sources.enable_odom,
            enable_imu = config.sources.enable_imu,
            "fusion engine initialised"
        );

        Ok(Self {
            strategy,
            registry,
            solver,
            odometry,
            imu,
            gate,
            sources: config.sources,
            tag_use_filter_rotation: config.gating.tag_use_filter_rotation,
            initial_covariance: covariance,
            last_update: None,
            predicted_to: None,
            has_rotation: false,
            phase: SchedulerPhase::Idle,
            sequence: 0,
            stats: FusionStats::default(),
        })
    }

    // ── Ingestion ───────────────────────────────────────────────────────────

    /// Fuse every detection of one camera frame in order. An empty frame
    /// yields no outcomes.
    pub fn ingest_tags(&mut self, frame: &TagDetectionFrame) -> Vec<FusionOutcome> {
        let kind = SensorKind::AprilTag;
        if let Err(reason) = self.admit(kind, frame.timestamp) {
            return vec![self.skip(kind, &frame.camera_id, reason)];
        }
        frame
            .tags
            .iter()
            .map(|detection| {
                let known_heading = (self.tag_use_filter_rotation && self.has_rotation)
                    .then(|| self.strategy.state()[index::THETA]);
                let solved =
                    self.solver
                        .solve(&frame.camera_id, frame.timestamp, detection, known_heading);
                match solved {
                    Ok(measurement) => self.apply(measurement),
                    Err(reason) => self.skip(kind, &frame.camera_id, reason),
                }
            })
            .collect()
    }

    pub fn ingest_odometry(&mut self, reading: &OdometryReading) -> FusionOutcome {
        let kind = SensorKind::Odometry;
        if let Err(reason) = self.admit(kind, reading.timestamp) {
            return self.skip(kind, &reading.sensor_id, reason);
        }
        if !all_finite(&[reading.position, reading.velocity], &[reading.heading_rad]) {
            return self.skip(kind, &reading.sensor_id, SkipReason::NonFinite("odometry reading".into()));
        }
        let estimate = self.estimate_position();
        let Some(mut tentative) = self.odometry.get(&reading.sensor_id).cloned() else {
            return self.skip(kind, &reading.sensor_id, unknown_sensor(kind, &reading.sensor_id));
        };
        // The frame only keeps this reading (and any re-anchor) if it is fused.
        let outcome = self.apply(tentative.transform(reading, estimate));
        if outcome.is_accepted() {
            self.odometry.insert(reading.sensor_id.clone(), tentative);
        }
        outcome
    }

    pub fn ingest_imu(&mut self, reading: &ImuReading) -> FusionOutcome {
        let kind = SensorKind::Imu;
        if let Err(reason) = self.admit(kind, reading.timestamp) {
            return self.skip(kind, &reading.sensor_id, reason);
        }
        let vectors: Vec<[f64; 2]> = reading.velocity.into_iter().chain(reading.position).collect();
        if !all_finite(&vectors, &[reading.yaw_rad]) {
            return self.skip(kind, &reading.sensor_id, SkipReason::NonFinite("imu reading".into()));
        }
        let Some(mut tentative) = self.imu.get(&reading.sensor_id).cloned() else {
            return self.skip(kind, &reading.sensor_id, unknown_sensor(kind, &reading.sensor_id));
        };
        let outcome = self.apply(tentative.transform(reading));
        if outcome.is_accepted() {
            self.imu.insert(reading.sensor_id.clone(), tentative);
        }
        outcome
    }

    /// Trusted override: reset the estimate to the commanded pose.
    ///
    /// Velocity defaults to zero and covariance to the configured initial
    /// covariance. Odometry frames are re-anchored onto the new pose.
    pub fn set_position(&mut self, command: &SetPositionCommand) -> Result<RobotPose, PoseError> {
        if !command.timestamp.is_finite() {
            return Err(PoseError::Config(format!(
                "set-position timestamp {} is not finite",
                command.timestamp
            )));
        }
        let [vx, vy] = command.velocity.unwrap_or([0.0, 0.0]);
        if !all_finite(&[[command.x, command.y], [vx, vy]], &[command.theta_rad]) {
            return Err(PoseError::Config("set-position pose is not finite".into()));
        }
        let theta = wrap_angle(command.theta_rad);
        let state = vector_from_slice(
            "set-position state",
            &[command.x, command.y, vx, vy, theta],
            STATE_DIM,
        )?;
        let covariance = match &command.covariance {
            Some(rows) => matrix_from_rows("set-position covariance", rows, (Some(STATE_DIM), Some(STATE_DIM)))?,
            None => self.initial_covariance.clone(),
        };
        self.strategy.reset(state, covariance)?;

        for frame in self.odometry.values_mut() {
            frame.reanchor(command.x, command.y, theta);
        }
        self.last_update = Some(command.timestamp);
        self.predicted_to = Some(command.timestamp);
        self.has_rotation = true;
        self.stats.resets += 1;

        info!(
            x = command.x,
            y = command.y,
            theta,
            timestamp = command.timestamp,
            "position reset"
        );
        Ok(self.emit())
    }

    /// Extrapolate the estimate `dt` seconds ahead without a measurement.
    ///
    /// Returns `None` before the first accepted reading or reset, or when
    /// `dt` is not positive. `dt` is wall-clock time, so sensor timestamps
    /// are assumed to advance at wall-clock rate.
    pub fn idle_predict(&mut self, dt: f64) -> Option<RobotPose> {
        let predicted_to = self.predicted_to?;
        if !(dt > 0.0) {
            return None;
        }
        self.phase = SchedulerPhase::Predicting;
        self.strategy.predict(dt);
        self.phase = SchedulerPhase::Idle;
        self.predicted_to = Some(predicted_to + dt);
        self.stats.idle_predictions += 1;
        trace!(dt, "idle predict");
        Some(self.emit())
    }

    /// Count messages lost to bus lag.
    pub fn record_dropped(&mut self, n: u64) {
        self.stats.dropped += n;
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Current estimate; the sequence is that of the last emitted pose.
    pub fn pose(&self) -> RobotPose {
        self.build_pose(self.sequence)
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn last_update(&self) -> Option<f64> {
        self.last_update
    }

    pub fn sources(&self) -> SourcesConfig {
        self.sources
    }

    // ── Pipeline ────────────────────────────────────────────────────────────

    /// Source and ordering checks that need nothing but the timestamp.
    fn admit(&self, kind: SensorKind, timestamp: f64) -> Result<(), SkipReason> {
        if !self.sources.is_enabled(kind) {
            return Err(SkipReason::SourceDisabled(kind));
        }
        if !timestamp.is_finite() {
            return Err(SkipReason::Stale { dt: f64::NAN });
        }
        match self.last_update {
            Some(last) if timestamp < last => Err(SkipReason::Stale {
                dt: timestamp - last,
            }),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, measurement: Measurement) -> FusionOutcome {
        let kind = measurement.kind;
        let sensor_id = measurement.sensor_id.clone();
        match self.try_apply(measurement) {
            Ok(pose) => FusionOutcome::Accepted(pose),
            Err(reason) => self.skip(kind, &sensor_id, reason),
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(kind = %measurement.kind, sensor_id = %measurement.sensor_id, t = measurement.timestamp)
    )]
    fn try_apply(&mut self, measurement: Measurement) -> Result<RobotPose, SkipReason> {
        let observed_finite = measurement
            .observed
            .iter()
            .zip(&measurement.observation)
            .all(|(&used, v)| !used || v.is_finite());
        if !observed_finite {
            return Err(SkipReason::NonFinite("measurement".into()));
        }
        self.gate.check(&measurement)?;
        let prepared = self
            .registry
            .get(measurement.kind, &measurement.sensor_id)
            .ok_or_else(|| unknown_sensor(measurement.kind, &measurement.sensor_id))?
            .project(&measurement)?;

        let dt = self
            .predicted_to
            .map_or(0.0, |t| (measurement.timestamp - t).max(0.0));
        let checkpoint = self.strategy.snapshot();

        self.phase = SchedulerPhase::Predicting;
        self.strategy.predict(dt);
        self.phase = SchedulerPhase::Updating;
        let result = self.strategy.update(&prepared);
        self.phase = SchedulerPhase::Idle;

        if let Err(reason) = result {
            self.strategy = checkpoint;
            return Err(reason);
        }

        self.last_update = Some(measurement.timestamp);
        self.predicted_to = Some(
            self.predicted_to
                .map_or(measurement.timestamp, |t| t.max(measurement.timestamp)),
        );
        if measurement.kind != SensorKind::AprilTag && prepared.observed[index::THETA] {
            self.has_rotation = true;
        }
        self.stats.accepted += 1;
        debug!(
            kind = %measurement.kind,
            sensor_id = %measurement.sensor_id,
            timestamp = measurement.timestamp,
            dt,
            rows = prepared.z.len(),
            "measurement fused"
        );
        Ok(self.emit())
    }

    fn skip(&mut self, kind: SensorKind, sensor_id: &str, reason: SkipReason) -> FusionOutcome {
        *self.stats.skipped.entry(reason.label().to_string()).or_default() += 1;
        match reason {
            SkipReason::IllConditioned { .. }
            | SkipReason::DegenerateRotation(_)
            | SkipReason::UnknownSensor { .. }
            | SkipReason::ShapeMismatch(_)
            | SkipReason::NonFinite(_) => {
                warn!(%kind, sensor_id, %reason, "measurement skipped");
            }
            SkipReason::Stale { .. }
            | SkipReason::LowConfidence { .. }
            | SkipReason::BeyondDiscardDistance { .. }
            | SkipReason::UnknownTag(_)
            | SkipReason::NothingObserved
            | SkipReason::SourceDisabled(_) => {
                debug!(%kind, sensor_id, %reason, "measurement skipped");
            }
        }
        FusionOutcome::Skipped {
            kind,
            sensor_id: sensor_id.to_string(),
            reason,
        }
    }

    /// Position used for odometry drift correction, once anything has been
    /// fused.
    fn estimate_position(&self) -> Option<[f64; 2]> {
        self.last_update.map(|_| {
            let x = self.strategy.state();
            [x[index::X], x[index::Y]]
        })
    }

    fn emit(&mut self) -> RobotPose {
        self.sequence += 1;
        self.build_pose(self.sequence)
    }

    fn build_pose(&self, sequence: u64) -> RobotPose {
        let x: DVector<f64> = self.strategy.state();
        let p: DMatrix<f64> = self.strategy.covariance();
        let theta = x[index::THETA];
        RobotPose {
            sequence,
            timestamp: self.predicted_to.unwrap_or(0.0),
            x: x[index::X],
            y: x[index::Y],
            vx: x[index::VX],
            vy: x[index::VY],
            theta_rad: theta,
            direction: [theta.cos(), theta.sin()],
            uncertainty: self.strategy.uncertainty(),
            covariance: (0..p.nrows())
                .flat_map(|r| (0..p.ncols()).map(move |c| (r, c)))
                .map(|(r, c)| p[(r, c)])
                .collect(),
            strategy: self.strategy.name().to_string(),
        }
    }
}

fn all_finite(pairs: &[[f64; 2]], scalars: &[f64]) -> bool {
    pairs.iter().flatten().chain(scalars).all(|v| v.is_finite())
}

fn unknown_sensor(kind: SensorKind, sensor_id: &str) -> SkipReason {
    SkipReason::UnknownSensor {
        kind,
        sensor_id: sensor_id.to_string(),
    }
}
