//! [`MeasurementGate`] – acceptance rules applied before a measurement can
//! touch the filter.
//!
//! Every registered [`Rule`] is evaluated in order; the first violation
//! returns a [`SkipReason`] and the measurement is dropped with the estimate
//! left untouched.
//!
//! Two built-in rules are provided:
//! - [`ConfidenceFloorRule`] – rejects tag measurements whose detector
//!   confidence is below `tag_confidence_threshold`.
//! - [`DiscardDistanceRule`] – rejects tag measurements whose robot-to-tag
//!   range exceeds `april_tag_discard_distance`.

use posefuse_types::{Measurement, SensorKind, SkipReason};
use tracing::trace;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single acceptance criterion for incoming measurements.
pub trait Rule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// `Ok(())` when the measurement may be applied.
    fn check(&self, measurement: &Measurement) -> Result<(), SkipReason>;
}

// ────────────────────────────────────────────────────────────────────────────
// MeasurementGate
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine that validates a [`Measurement`] against all registered
/// [`Rule`]s.
///
/// # Example
///
/// ```
/// use posefuse_kernel::gate::MeasurementGate;
/// use posefuse_types::{Measurement, SensorKind};
///
/// let gate = MeasurementGate::standard(50.0, 5.0);
///
/// let good = Measurement::new(SensorKind::AprilTag, "front", 0.0)
///     .with_confidence(80.0)
///     .with_range(2.0);
/// assert!(gate.check(&good).is_ok());
///
/// let far = good.clone().with_range(7.5);
/// assert!(gate.check(&far).is_err());
/// ```
#[derive(Default)]
pub struct MeasurementGate {
    rules: Vec<Box<dyn Rule>>,
}

impl MeasurementGate {
    /// Create an empty gate that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// The confidence floor followed by the discard distance.
    pub fn standard(tag_confidence_threshold: f64, april_tag_discard_distance: f64) -> Self {
        let mut gate = Self::new();
        gate.add_rule(Box::new(ConfidenceFloorRule {
            threshold: tag_confidence_threshold,
        }));
        gate.add_rule(Box::new(DiscardDistanceRule {
            max_distance: april_tag_discard_distance,
        }));
        gate
    }

    /// Register a new [`Rule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Returns the first violation, or `Ok(())` when all rules pass.
    pub fn check(&self, measurement: &Measurement) -> Result<(), SkipReason> {
        for rule in &self.rules {
            if let Err(reason) = rule.check(measurement) {
                trace!(rule = rule.name(), sensor_id = %measurement.sensor_id, %reason, "gate rejected measurement");
                return Err(reason);
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects AprilTag measurements whose confidence is below `threshold`.
/// Measurements without a confidence are accepted.
pub struct ConfidenceFloorRule {
    pub threshold: f64,
}

impl Rule for ConfidenceFloorRule {
    fn name(&self) -> &str {
        "confidence_floor"
    }

    fn check(&self, m: &Measurement) -> Result<(), SkipReason> {
        match (m.kind, m.confidence) {
            (SensorKind::AprilTag, Some(confidence)) if !(confidence >= self.threshold) => {
                Err(SkipReason::LowConfidence {
                    confidence,
                    threshold: self.threshold,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Rejects AprilTag measurements whose range exceeds `max_distance`.
pub struct DiscardDistanceRule {
    pub max_distance: f64,
}

impl Rule for DiscardDistanceRule {
    fn name(&self) -> &str {
        "discard_distance"
    }

    fn check(&self, m: &Measurement) -> Result<(), SkipReason> {
        match (m.kind, m.range_m) {
            (SensorKind::AprilTag, Some(distance)) if !(distance <= self.max_distance) => {
                Err(SkipReason::BeyondDiscardDistance {
                    distance,
                    limit: self.max_distance,
                })
            }
            _ => Ok(()),
        }
    }
}
