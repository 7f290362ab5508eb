//! [`FusionScheduler`] – the async loop that feeds the engine.
//!
//! One Tokio task owns the [`FusionEngine`] and selects over:
//!
//! | Wake-up | Action |
//! |---|---|
//! | shutdown `watch` | drain what is queued, stop, return [`FusionStats`] |
//! | `set-position` | trusted reset |
//! | enabled input topics | drain every queued message, sort by sensor time, fuse in order |
//! | idle timer (`idle_timeout_ms`) | predict to the wall clock when `idle_predict` is set; check source liveness |
//!
//! Exactly one measurement is in flight at a time. Messages lost because the
//! loop fell behind are counted in [`FusionStats::dropped`].
//!
//! # Example
//!
//! ```rust,no_run
//! use posefuse_middleware::EventBus;
//! use posefuse_runtime::config::FusionConfig;
//! use posefuse_runtime::engine::FusionEngine;
//! use posefuse_runtime::scheduler::FusionScheduler;
//!
//! # async fn demo() -> Result<(), posefuse_types::PoseError> {
//! let config = FusionConfig::default();
//! let bus = EventBus::new(config.scheduler.queue_capacity);
//! let engine = FusionEngine::from_config(&config)?;
//! let (stop, stopped) = tokio::sync::watch::channel(false);
//!
//! let task = tokio::spawn(FusionScheduler::new(engine, &bus, &config).run(stopped));
//! // ... publish readings on the bus ...
//! let _ = stop.send(true);
//! let stats = task.await.map_err(|e| posefuse_types::PoseError::Channel(e.to_string()))?;
//! println!("accepted {}", stats.accepted);
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use posefuse_kernel::{SensorWatchdog, SourceHealth};
use posefuse_middleware::{EventBus, TopicReceiver};
use posefuse_types::{Event, EventPayload, SensorKind};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::FusionConfig;
use crate::engine::{FusionEngine, FusionStats};
use crate::publisher::PosePublisher;

// ────────────────────────────────────────────────────────────────────────────
// Clock
// ────────────────────────────────────────────────────────────────────────────

/// Wall-clock source for idle prediction and liveness checks.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// Receivers for the enabled input topics. Disabled sources are not
/// subscribed at all.
struct Inputs {
    set_position: TopicReceiver,
    tags: Option<TopicReceiver>,
    odometry: Option<TopicReceiver>,
    imu: Option<TopicReceiver>,
}

impl Inputs {
    fn subscribe(bus: &EventBus, config: &FusionConfig) -> Self {
        let topic = |kind: SensorKind| {
            config
                .sources
                .is_enabled(kind)
                .then(|| bus.subscribe_to(config.topics.input_for(kind)))
        };
        Self {
            set_position: bus.subscribe_to(&config.topics.set_position),
            tags: topic(SensorKind::AprilTag),
            odometry: topic(SensorKind::Odometry),
            imu: topic(SensorKind::Imu),
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TopicReceiver> {
        std::iter::once(&mut self.set_position)
            .chain(self.tags.as_mut())
            .chain(self.odometry.as_mut())
            .chain(self.imu.as_mut())
    }
}

async fn next_optional(rx: &mut Option<TopicReceiver>) -> Result<Event, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Stop,
    Check,
    Idle,
    Message(Result<Event, RecvError>),
}

// ────────────────────────────────────────────────────────────────────────────
// FusionScheduler
// ────────────────────────────────────────────────────────────────────────────

pub struct FusionScheduler<C: Clock = SystemClock> {
    engine: FusionEngine,
    publisher: PosePublisher,
    inputs: Inputs,
    clock: C,
    watchdog: SensorWatchdog,
    idle_timeout: Duration,
    idle_predict: bool,
    /// Wall time the estimate was last brought up to date.
    last_tick: Instant,
}

impl FusionScheduler<SystemClock> {
    pub fn new(engine: FusionEngine, bus: &EventBus, config: &FusionConfig) -> Self {
        Self::with_clock(engine, bus, config, SystemClock)
    }
}

impl<C: Clock> FusionScheduler<C> {
    /// Subscribe to the input topics now, so messages published before
    /// [`FusionScheduler::run`] starts are not lost.
    pub fn with_clock(engine: FusionEngine, bus: &EventBus, config: &FusionConfig, clock: C) -> Self {
        let now = clock.now();
        let timeout = Duration::from_millis(config.scheduler.sensor_timeout_ms);
        let mut watchdog = SensorWatchdog::new();
        for (kind, id) in config.enabled_sensors() {
            watchdog.register(&source_key(kind, &id), timeout, now);
        }

        Self {
            engine,
            publisher: PosePublisher::new(bus.clone(), &config.topics),
            inputs: Inputs::subscribe(bus, config),
            clock,
            watchdog,
            idle_timeout: Duration::from_millis(config.scheduler.idle_timeout_ms.max(1)),
            idle_predict: config.scheduler.idle_predict,
            last_tick: now,
        }
    }

    pub fn engine(&self) -> &FusionEngine {
        &self.engine
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    #[instrument(name = "fusion_scheduler", skip_all, fields(strategy = self.engine.strategy_name()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> FusionStats {
        info!(
            strategy = self.engine.strategy_name(),
            topics = ?self.inputs.iter_mut().map(|rx| rx.topic().to_string()).collect::<Vec<_>>(),
            sources = self.watchdog.len(),
            "fusion scheduler started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let wake = tokio::select! {
                biased;
                changed = shutdown.changed() => if changed.is_err() { Wake::Stop } else { Wake::Check },
                msg = self.inputs.set_position.recv() => Wake::Message(msg),
                msg = next_optional(&mut self.inputs.tags) => Wake::Message(msg),
                msg = next_optional(&mut self.inputs.odometry) => Wake::Message(msg),
                msg = next_optional(&mut self.inputs.imu) => Wake::Message(msg),
                _ = tokio::time::sleep(self.idle_timeout) => Wake::Idle,
            };

            match wake {
                Wake::Stop => break,
                Wake::Check => continue,
                Wake::Idle => self.on_idle(),
                Wake::Message(first) => {
                    let now = self.clock.now();
                    let mut batch = Vec::new();
                    self.collect(first, &mut batch);
                    self.drain(&mut batch);
                    self.process(batch, now);
                    self.last_tick = now;
                    self.check_liveness(now);
                }
            }
        }

        let mut batch = Vec::new();
        self.drain(&mut batch);
        if !batch.is_empty() {
            debug!(queued = batch.len(), "draining queued messages before shutdown");
            let now = self.clock.now();
            self.process(batch, now);
        }

        let stats = self.engine.stats().clone();
        info!(
            accepted = stats.accepted,
            skipped = stats.total_skipped(),
            dropped = stats.dropped,
            resets = stats.resets,
            published = self.publisher.published(),
            "fusion scheduler stopped"
        );
        stats
    }

    fn collect(&mut self, msg: Result<Event, RecvError>, batch: &mut Vec<Event>) {
        match msg {
            Ok(event) => batch.push(event),
            Err(RecvError::Lagged(n)) => self.lagged(n),
            // The bus keeps every sender alive, so this only happens on teardown.
            Err(RecvError::Closed) => debug!("input topic closed"),
        }
    }

    fn drain(&mut self, batch: &mut Vec<Event>) {
        let mut lost = 0;
        for rx in self.inputs.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(TryRecvError::Lagged(n)) => lost += n,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        if lost > 0 {
            self.lagged(lost);
        }
    }

    fn lagged(&mut self, n: u64) {
        warn!(dropped = n, "fusion input lagging, oldest messages dropped");
        self.engine.record_dropped(n);
    }

    fn process(&mut self, mut batch: Vec<Event>, now: Instant) {
        batch.sort_by(|a, b| {
            let ta = a.payload.sensor_timestamp().unwrap_or(f64::INFINITY);
            let tb = b.payload.sensor_timestamp().unwrap_or(f64::INFINITY);
            ta.total_cmp(&tb)
        });
        for event in batch {
            self.handle(event, now);
        }
    }

    fn handle(&mut self, event: Event, now: Instant) {
        match event.payload {
            EventPayload::TagDetections(frame) => {
                self.watchdog
                    .heartbeat(&source_key(SensorKind::AprilTag, &frame.camera_id), now);
                for outcome in self.engine.ingest_tags(&frame) {
                    self.publisher.publish_outcome(&outcome);
                }
            }
            EventPayload::Odometry(reading) => {
                self.watchdog
                    .heartbeat(&source_key(SensorKind::Odometry, &reading.sensor_id), now);
                let outcome = self.engine.ingest_odometry(&reading);
                self.publisher.publish_outcome(&outcome);
            }
            EventPayload::Imu(reading) => {
                self.watchdog
                    .heartbeat(&source_key(SensorKind::Imu, &reading.sensor_id), now);
                let outcome = self.engine.ingest_imu(&reading);
                self.publisher.publish_outcome(&outcome);
            }
            EventPayload::SetPosition(command) => match self.engine.set_position(&command) {
                Ok(pose) => {
                    self.publisher.publish_pose(&pose);
                }
                Err(e) => warn!(error = %e, source = %event.source, "set-position command rejected"),
            },
            EventPayload::RobotPosition(_) | EventPayload::FusionSkipped { .. } => {
                trace!(source = %event.source, "ignoring output event on an input topic");
            }
        }
    }

    fn on_idle(&mut self) {
        let now = self.clock.now();
        if self.idle_predict {
            let dt = now.saturating_duration_since(self.last_tick).as_secs_f64();
            if let Some(pose) = self.engine.idle_predict(dt) {
                self.publisher.publish_pose(&pose);
            }
        }
        self.last_tick = now;
        self.check_liveness(now);
    }

    fn check_liveness(&mut self, now: Instant) {
        for (source, health) in self.watchdog.poll_transitions(now) {
            match health {
                SourceHealth::Silent => warn!(source, "sensor source went silent"),
                SourceHealth::Live => info!(source, "sensor source recovered"),
            }
        }
    }
}

fn source_key(kind: SensorKind, sensor_id: &str) -> String {
    format!("{kind}:{sensor_id}")
}
