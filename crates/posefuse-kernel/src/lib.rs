//! `posefuse-kernel` – measurement admission and supervision.
//!
//! It does not estimate anything; it decides what may reach the estimator and
//! notices when inputs go quiet.
//!
//! # Modules
//!
//! - [`gate`] – [`MeasurementGate`][gate::MeasurementGate]: a rule engine that
//!   validates every [`Measurement`][posefuse_types::Measurement] against the
//!   confidence floor and discard distance before it can touch the filter.
//! - [`watchdog`] – [`SensorWatchdog`][watchdog::SensorWatchdog]: tracks
//!   per-source heartbeats and reports live/silent transitions.

pub mod gate;
pub mod watchdog;

pub use gate::{ConfidenceFloorRule, DiscardDistanceRule, MeasurementGate, Rule};
pub use watchdog::{SensorWatchdog, SourceHealth};
