//! `posefuse-runtime` – the fusion service.
//!
//! Wires the estimation core to the event bus and runs it.
//!
//! # Modules
//!
//! - [`config`] – [`FusionConfig`][config::FusionConfig]: the TOML schema,
//!   defaults and startup validation.
//! - [`engine`] – [`FusionEngine`][engine::FusionEngine]: the single-writer
//!   fusion context. Runs every reading through transform, gate, predict and
//!   update, and handles trusted `set_position` resets.
//! - [`scheduler`] – [`FusionScheduler`][scheduler::FusionScheduler]: the
//!   Tokio task that drains the input topics in timestamp order, drives idle
//!   prediction and watches source liveness.
//! - [`publisher`] – [`PosePublisher`][publisher::PosePublisher]: emits
//!   [`RobotPose`][posefuse_types::RobotPose]s and skip notices.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod config;
pub mod engine;
pub mod publisher;
pub mod scheduler;
pub mod telemetry;

pub use config::FusionConfig;
pub use engine::{FusionEngine, FusionOutcome, FusionStats, SchedulerPhase};
pub use publisher::PosePublisher;
pub use scheduler::{Clock, FusionScheduler, SystemClock};
pub use telemetry::{TracerProviderGuard, init_tracing};
