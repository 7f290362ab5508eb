//! Sensor Adapter Registry.
//!
//! Maps a `(SensorKind, sensor_id)` pair to its calibrated
//! [`SensorModel`]: the measurement conversion matrix `H` (m×5), the
//! measurement noise matrix `R` (m×m) and a weight used by the
//! weighted-average strategy.
//!
//! Models are validated once when the registry is built; lookups afterwards
//! are pure. A reading that only observes part of the state (odometry with
//! position disabled, an IMU without velocity) is projected onto the rows of
//! `H` it can actually support before it reaches the filter.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use posefuse_types::{Measurement, PoseError, STATE_DIM, SensorKind, SkipReason};
use serde::{Deserialize, Serialize};

use crate::linalg::matrix_from_rows;

/// On-disk form of a sensor model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorModelConfig {
    pub measurement_conversion_matrix: Vec<Vec<f64>>,
    pub measurement_noise_matrix: Vec<Vec<f64>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl SensorModelConfig {
    /// Identity conversion with a diagonal noise matrix.
    pub fn diagonal(noise: [f64; STATE_DIM]) -> Self {
        let diag = |values: [f64; STATE_DIM]| -> Vec<Vec<f64>> {
            (0..STATE_DIM)
                .map(|r| (0..STATE_DIM).map(|c| if r == c { values[r] } else { 0.0 }).collect())
                .collect()
        };
        Self {
            measurement_conversion_matrix: diag([1.0; STATE_DIM]),
            measurement_noise_matrix: diag(noise),
            weight: default_weight(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorModel
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SensorModel {
    conversion: DMatrix<f64>,
    noise: DMatrix<f64>,
    weight: f64,
}

impl SensorModel {
    pub fn new(conversion: DMatrix<f64>, noise: DMatrix<f64>, weight: f64) -> Result<Self, PoseError> {
        let model = Self {
            conversion,
            noise,
            weight,
        };
        model.validate("sensor model", STATE_DIM)?;
        Ok(model)
    }

    pub fn from_config(what: &str, config: &SensorModelConfig) -> Result<Self, PoseError> {
        let conversion = matrix_from_rows(
            &format!("{what} measurement_conversion_matrix"),
            &config.measurement_conversion_matrix,
            (None, Some(STATE_DIM)),
        )?;
        let m = conversion.nrows();
        let noise = matrix_from_rows(
            &format!("{what} measurement_noise_matrix"),
            &config.measurement_noise_matrix,
            (Some(m), Some(m)),
        )?;
        let model = Self {
            conversion,
            noise,
            weight: config.weight,
        };
        model.validate(what, STATE_DIM)?;
        Ok(model)
    }

    fn validate(&self, what: &str, state_dim: usize) -> Result<(), PoseError> {
        let m = self.conversion.nrows();
        if m == 0 || self.conversion.ncols() != state_dim {
            return Err(PoseError::DimensionMismatch {
                what: format!("{what} measurement_conversion_matrix"),
                expected: format!("m x {state_dim} with m > 0"),
                found: format!("{}x{}", m, self.conversion.ncols()),
            });
        }
        if self.noise.nrows() != m || self.noise.ncols() != m {
            return Err(PoseError::DimensionMismatch {
                what: format!("{what} measurement_noise_matrix"),
                expected: format!("{m}x{m}"),
                found: format!("{}x{}", self.noise.nrows(), self.noise.ncols()),
            });
        }
        if (0..m).any(|i| self.noise[(i, i)] < 0.0) {
            return Err(PoseError::Config(format!(
                "{what} measurement_noise_matrix has a negative variance"
            )));
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(PoseError::Config(format!(
                "{what} weight must be positive, got {}",
                self.weight
            )));
        }
        Ok(())
    }

    pub fn conversion(&self) -> &DMatrix<f64> {
        &self.conversion
    }

    pub fn noise(&self) -> &DMatrix<f64> {
        &self.noise
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Restrict the model to the rows this measurement can support and
    /// compute `z = H·observation`.
    ///
    /// A row is kept when every state component it reads is observed.
    pub fn project(&self, measurement: &Measurement) -> Result<PreparedMeasurement, SkipReason> {
        let rows: Vec<usize> = (0..self.conversion.nrows())
            .filter(|&r| {
                let mut used = (0..STATE_DIM).filter(|&c| self.conversion[(r, c)] != 0.0).peekable();
                used.peek().is_some() && used.all(|c| measurement.observed[c])
            })
            .collect();
        if rows.is_empty() {
            return Err(SkipReason::NothingObserved);
        }
        if measurement.observation.len() != STATE_DIM {
            return Err(SkipReason::ShapeMismatch(format!(
                "observation has {} components, expected {STATE_DIM}",
                measurement.observation.len()
            )));
        }

        let h = self.conversion.select_rows(&rows);
        let r = self.noise.select_rows(&rows).select_columns(&rows);
        let observation = DVector::from_column_slice(&measurement.observation);
        let z = &h * &observation;

        Ok(PreparedMeasurement {
            kind: measurement.kind,
            sensor_id: measurement.sensor_id.clone(),
            timestamp: measurement.timestamp,
            observation,
            observed: measurement.observed,
            z,
            h,
            r,
            weight: self.weight,
        })
    }
}

/// A measurement ready for a [`PoseEstimationStrategy`](crate::strategy::PoseEstimationStrategy).
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMeasurement {
    pub kind: SensorKind,
    pub sensor_id: String,
    pub timestamp: f64,
    /// Full-length observation in the state basis.
    pub observation: DVector<f64>,
    pub observed: [bool; STATE_DIM],
    pub z: DVector<f64>,
    pub h: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub weight: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// SensorRegistry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    models: HashMap<(SensorKind, String), SensorModel>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `{kind → {sensor_id → config}}` tables.
    pub fn from_configs<'a>(
        configs: impl IntoIterator<Item = (SensorKind, &'a HashMap<String, SensorModelConfig>)>,
    ) -> Result<Self, PoseError> {
        let mut registry = Self::new();
        for (kind, table) in configs {
            for (sensor_id, config) in table {
                let model = SensorModel::from_config(&format!("{kind} sensor '{sensor_id}'"), config)?;
                registry.insert(kind, sensor_id.clone(), model);
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, kind: SensorKind, sensor_id: impl Into<String>, model: SensorModel) {
        self.models.insert((kind, sensor_id.into()), model);
    }

    pub fn get(&self, kind: SensorKind, sensor_id: &str) -> Option<&SensorModel> {
        self.models.get(&(kind, sensor_id.to_string()))
    }

    /// Like [`SensorRegistry::get`], but a missing entry is a configuration
    /// error.
    pub fn require(&self, kind: SensorKind, sensor_id: &str) -> Result<&SensorModel, PoseError> {
        self.get(kind, sensor_id)
            .ok_or_else(|| PoseError::MissingSensorModel {
                kind,
                sensor_id: sensor_id.to_string(),
            })
    }

    /// Sensor ids registered for `kind`, sorted.
    pub fn sensor_ids(&self, kind: SensorKind) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .models
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Re-check every model against the filter's state dimension.
    pub fn validate(&self, state_dim: usize) -> Result<(), PoseError> {
        for ((kind, sensor_id), model) in &self.models {
            model.validate(&format!("{kind} sensor '{sensor_id}'"), state_dim)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
