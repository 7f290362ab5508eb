//! [`SensorWatchdog`] – input liveness monitor.
//!
//! Every sensor source records a heartbeat when one of its messages is
//! processed. A source is considered *silent* once its deadline has passed.
//! The scheduler polls [`SensorWatchdog::poll_transitions`] on idle ticks so
//! each change between live and silent is logged once.
//!
//! All methods take an explicit `now` so callers can drive the watchdog from
//! any clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHealth {
    /// A message arrived within the deadline.
    Live,
    /// No message within the deadline.
    Silent,
}

struct SourceEntry {
    last_heartbeat: Instant,
    timeout: Duration,
    reported: SourceHealth,
}

impl SourceEntry {
    fn health(&self, now: Instant) -> SourceHealth {
        if now.saturating_duration_since(self.last_heartbeat) <= self.timeout {
            SourceHealth::Live
        } else {
            SourceHealth::Silent
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats from sensor sources and detects silent ones.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use posefuse_kernel::watchdog::{SensorWatchdog, SourceHealth};
///
/// let start = Instant::now();
/// let mut wd = SensorWatchdog::new();
/// wd.register("odometry:swerve", Duration::from_millis(500), start);
///
/// assert_eq!(wd.health("odometry:swerve", start), SourceHealth::Live);
/// assert_eq!(
///     wd.health("odometry:swerve", start + Duration::from_secs(1)),
///     SourceHealth::Silent
/// );
/// ```
#[derive(Default)]
pub struct SensorWatchdog {
    sources: HashMap<String, SourceEntry>,
}

impl SensorWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source_id` as live at `now`. Re-registering resets it.
    pub fn register(&mut self, source_id: &str, timeout: Duration, now: Instant) {
        self.sources.insert(
            source_id.to_string(),
            SourceEntry {
                last_heartbeat: now,
                timeout,
                reported: SourceHealth::Live,
            },
        );
    }

    /// Record a heartbeat. No-op for unregistered sources.
    pub fn heartbeat(&mut self, source_id: &str, now: Instant) {
        if let Some(entry) = self.sources.get_mut(source_id) {
            entry.last_heartbeat = now;
        }
    }

    /// Unknown sources are reported [`SourceHealth::Silent`].
    pub fn health(&self, source_id: &str, now: Instant) -> SourceHealth {
        self.sources
            .get(source_id)
            .map_or(SourceHealth::Silent, |entry| entry.health(now))
    }

    /// IDs of all sources past their deadline, sorted.
    pub fn silent_sources(&self, now: Instant) -> Vec<String> {
        let mut silent: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, entry)| entry.health(now) == SourceHealth::Silent)
            .map(|(id, _)| id.clone())
            .collect();
        silent.sort();
        silent
    }

    /// Sources whose health changed since the previous poll, sorted by id.
    pub fn poll_transitions(&mut self, now: Instant) -> Vec<(String, SourceHealth)> {
        let mut changed: Vec<(String, SourceHealth)> = self
            .sources
            .iter_mut()
            .filter_map(|(id, entry)| {
                let health = entry.health(now);
                (health != entry.reported).then(|| {
                    entry.reported = health;
                    (id.clone(), health)
                })
            })
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
