//! Interchangeable pose estimation strategies.
//!
//! Every estimator sits behind [`PoseEstimationStrategy`], so the fusion
//! engine never branches on which one is active. Two families exist:
//!
//! | Strategy | Behaviour |
//! |---|---|
//! | [`KalmanStrategy`] | Linear Kalman filter ([`KalmanFilter`]) |
//! | [`WindowedStrategy`] | Smooths the last `history_window` observations per state component with a [`WindowMethod`] |
//!
//! The active strategy is chosen by [`StrategyKind`] in the configuration.

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};
use posefuse_types::{PoseError, STATE_DIM, SkipReason, index};
use serde::{Deserialize, Serialize};

use crate::filter::KalmanFilter;
use crate::linalg::{pose_uncertainty, wrap_angle};
use crate::sensor::PreparedMeasurement;

/// A pose estimator owning the canonical state and its covariance.
pub trait PoseEstimationStrategy: Send + std::fmt::Debug {
    /// Name reported on published poses.
    fn name(&self) -> &'static str;

    /// Advance the estimator by `dt` seconds.
    fn predict(&mut self, dt: f64);

    /// Fold in one measurement. On error the estimator is unchanged.
    fn update(&mut self, measurement: &PreparedMeasurement) -> Result<(), SkipReason>;

    /// Replace the estimate outright.
    fn reset(&mut self, state: DVector<f64>, covariance: DMatrix<f64>) -> Result<(), PoseError>;

    /// Deep copy used to roll back a predict whose update was rejected.
    fn snapshot(&self) -> Box<dyn PoseEstimationStrategy>;

    fn state(&self) -> DVector<f64>;

    fn covariance(&self) -> DMatrix<f64>;

    fn uncertainty(&self) -> f64 {
        pose_uncertainty(&self.covariance())
    }
}

/// Configured strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Kalman,
    Average,
    WeightedAverage,
    Median,
    TrendLine,
}

impl StrategyKind {
    fn window_method(self) -> Option<WindowMethod> {
        match self {
            StrategyKind::Kalman => None,
            StrategyKind::Average => Some(WindowMethod::Average),
            StrategyKind::WeightedAverage => Some(WindowMethod::WeightedAverage),
            StrategyKind::Median => Some(WindowMethod::Median),
            StrategyKind::TrendLine => Some(WindowMethod::TrendLine),
        }
    }
}

/// Build the configured strategy around an initialised filter. Windowed
/// strategies start from the filter's initial state and covariance.
pub fn build_strategy(
    kind: StrategyKind,
    filter: KalmanFilter,
    history_window: usize,
) -> Result<Box<dyn PoseEstimationStrategy>, PoseError> {
    match kind.window_method() {
        None => Ok(Box::new(KalmanStrategy::new(filter))),
        Some(method) => Ok(Box::new(WindowedStrategy::new(
            method,
            history_window,
            filter.state().clone(),
            filter.covariance().clone(),
        )?)),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kalman
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KalmanStrategy {
    filter: KalmanFilter,
}

impl KalmanStrategy {
    pub fn new(filter: KalmanFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &KalmanFilter {
        &self.filter
    }
}

impl PoseEstimationStrategy for KalmanStrategy {
    fn name(&self) -> &'static str {
        "kalman"
    }

    fn predict(&mut self, dt: f64) {
        self.filter.predict(dt);
    }

    fn update(&mut self, m: &PreparedMeasurement) -> Result<(), SkipReason> {
        self.filter.update(&m.z, &m.h, &m.r)
    }

    fn reset(&mut self, state: DVector<f64>, covariance: DMatrix<f64>) -> Result<(), PoseError> {
        self.filter.reset(state, covariance)
    }

    fn snapshot(&self) -> Box<dyn PoseEstimationStrategy> {
        Box::new(self.clone())
    }

    fn state(&self) -> DVector<f64> {
        self.filter.state().clone()
    }

    fn covariance(&self) -> DMatrix<f64> {
        self.filter.covariance().clone()
    }

    fn uncertainty(&self) -> f64 {
        self.filter.uncertainty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Windowed
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMethod {
    /// Arithmetic mean (circular mean for heading).
    Average,
    /// Mean weighted by each sensor's configured weight.
    WeightedAverage,
    /// Component-wise median.
    Median,
    /// Least-squares line through the samples, evaluated at the current time.
    TrendLine,
}

#[derive(Debug, Clone)]
struct Sample {
    time: f64,
    values: DVector<f64>,
    observed: [bool; STATE_DIM],
    weight: f64,
}

/// Estimates each state component from the observations in a sliding
/// window. Components nothing in the window observes keep the last reset
/// value.
#[derive(Debug, Clone)]
pub struct WindowedStrategy {
    method: WindowMethod,
    capacity: usize,
    samples: VecDeque<Sample>,
    clock: f64,
    base_state: DVector<f64>,
    base_covariance: DMatrix<f64>,
}

impl WindowedStrategy {
    pub fn new(
        method: WindowMethod,
        history_window: usize,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self, PoseError> {
        if history_window == 0 {
            return Err(PoseError::Config("history_window must be at least 1".into()));
        }
        check_shapes(&state, &covariance)?;
        Ok(Self {
            method,
            capacity: history_window,
            samples: VecDeque::with_capacity(history_window),
            clock: 0.0,
            base_state: state,
            base_covariance: covariance,
        })
    }

    pub fn method(&self) -> WindowMethod {
        self.method
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `(time, value, weight)` for every sample observing component `c`.
    fn column(&self, c: usize) -> Vec<(f64, f64, f64)> {
        self.samples
            .iter()
            .filter(|s| s.observed[c])
            .map(|s| (s.time, s.values[c], s.weight))
            .collect()
    }

    fn estimate(&self, c: usize) -> Option<f64> {
        let column = self.column(c);
        if column.is_empty() {
            return None;
        }
        if c == index::THETA {
            // Work on offsets from the circular mean so wraparound does not
            // split the samples.
            let center = circular_mean(&column);
            let unwrapped: Vec<_> = column
                .iter()
                .map(|&(t, v, w)| (t, wrap_angle(v - center), w))
                .collect();
            return Some(wrap_angle(center + self.combine(&unwrapped)));
        }
        Some(self.combine(&column))
    }

    fn combine(&self, column: &[(f64, f64, f64)]) -> f64 {
        match self.method {
            WindowMethod::Average => mean(column.iter().map(|&(_, v, _)| (v, 1.0))),
            WindowMethod::WeightedAverage => mean(column.iter().map(|&(_, v, w)| (v, w))),
            WindowMethod::Median => median(column.iter().map(|&(_, v, _)| v).collect()),
            WindowMethod::TrendLine => trend_line(column, self.clock),
        }
    }

    fn spread(&self, c: usize) -> Option<f64> {
        let column = self.column(c);
        if column.len() < 2 {
            return None;
        }
        let values: Vec<f64> = if c == index::THETA {
            let center = circular_mean(&column);
            column.iter().map(|&(_, v, _)| wrap_angle(v - center)).collect()
        } else {
            column.iter().map(|&(_, v, _)| v).collect()
        };
        let n = values.len() as f64;
        let avg = values.iter().sum::<f64>() / n;
        Some(values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (n - 1.0))
    }
}

impl PoseEstimationStrategy for WindowedStrategy {
    fn name(&self) -> &'static str {
        match self.method {
            WindowMethod::Average => "average",
            WindowMethod::WeightedAverage => "weighted-average",
            WindowMethod::Median => "median",
            WindowMethod::TrendLine => "trend-line",
        }
    }

    fn predict(&mut self, dt: f64) {
        if dt.is_finite() && dt > 0.0 {
            self.clock += dt;
        }
    }

    fn update(&mut self, m: &PreparedMeasurement) -> Result<(), SkipReason> {
        if m.observation.len() != STATE_DIM {
            return Err(SkipReason::ShapeMismatch(format!(
                "observation has {} components, expected {STATE_DIM}",
                m.observation.len()
            )));
        }
        // Only components read by a kept conversion row count as observed.
        let mut observed = [false; STATE_DIM];
        for (c, flag) in observed.iter_mut().enumerate() {
            *flag = m.observed[c] && (0..m.h.nrows()).any(|r| m.h[(r, c)] != 0.0);
        }
        if !observed.iter().any(|&o| o) {
            return Err(SkipReason::NothingObserved);
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            time: self.clock,
            values: m.observation.clone(),
            observed,
            weight: m.weight,
        });
        Ok(())
    }

    fn reset(&mut self, state: DVector<f64>, covariance: DMatrix<f64>) -> Result<(), PoseError> {
        check_shapes(&state, &covariance)?;
        let mut state = state;
        state[index::THETA] = wrap_angle(state[index::THETA]);
        self.samples.clear();
        self.base_state = state;
        self.base_covariance = covariance;
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn PoseEstimationStrategy> {
        Box::new(self.clone())
    }

    fn state(&self) -> DVector<f64> {
        DVector::from_fn(STATE_DIM, |c, _| {
            self.estimate(c).unwrap_or(self.base_state[c])
        })
    }

    /// Diagonal of per-component sample variances; components with fewer
    /// than two samples keep the reset covariance.
    fn covariance(&self) -> DMatrix<f64> {
        let mut cov = self.base_covariance.clone();
        for c in 0..STATE_DIM {
            if let Some(var) = self.spread(c) {
                for k in 0..STATE_DIM {
                    cov[(c, k)] = 0.0;
                    cov[(k, c)] = 0.0;
                }
                cov[(c, c)] = var;
            }
        }
        cov
    }
}

fn check_shapes(state: &DVector<f64>, covariance: &DMatrix<f64>) -> Result<(), PoseError> {
    if state.len() != STATE_DIM || covariance.shape() != (STATE_DIM, STATE_DIM) {
        return Err(PoseError::DimensionMismatch {
            what: "windowed strategy state".into(),
            expected: format!("{STATE_DIM} / {STATE_DIM}x{STATE_DIM}"),
            found: format!(
                "{} / {}x{}",
                state.len(),
                covariance.nrows(),
                covariance.ncols()
            ),
        });
    }
    Ok(())
}

fn mean(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let (sum, total) = values.fold((0.0, 0.0), |(s, t), (v, w)| (s + v * w, t + w));
    if total > 0.0 { sum / total } else { 0.0 }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn circular_mean(column: &[(f64, f64, f64)]) -> f64 {
    let (s, c) = column
        .iter()
        .fold((0.0, 0.0), |(s, c), &(_, v, _)| (s + v.sin(), c + v.cos()));
    s.atan2(c)
}

/// Least-squares fit of value against time, evaluated at `at`. Falls back to
/// the mean when time has no spread.
fn trend_line(column: &[(f64, f64, f64)], at: f64) -> f64 {
    let n = column.len() as f64;
    let t_mean = column.iter().map(|&(t, _, _)| t).sum::<f64>() / n;
    let v_mean = column.iter().map(|&(_, v, _)| v).sum::<f64>() / n;
    let (cov, var) = column.iter().fold((0.0, 0.0), |(cov, var), &(t, v, _)| {
        (cov + (t - t_mean) * (v - v_mean), var + (t - t_mean).powi(2))
    });
    if var <= f64::EPSILON {
        return v_mean;
    }
    v_mean + cov / var * (at - t_mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TransitionModel;
    use approx::assert_relative_eq;
    use posefuse_types::SensorKind;
    use std::f64::consts::PI;

    fn prepared(values: [f64; STATE_DIM], observed: [bool; STATE_DIM], weight: f64) -> PreparedMeasurement {
        let rows: Vec<usize> = (0..STATE_DIM).filter(|&c| observed[c]).collect();
        let h = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM).select_rows(&rows);
        let observation = DVector::from_column_slice(&values);
        PreparedMeasurement {
            kind: SensorKind::AprilTag,
            sensor_id: "cam".into(),
            timestamp: 0.0,
            z: &h * &observation,
            observation,
            observed,
            r: DMatrix::identity(rows.len(), rows.len()),
            h,
            weight,
        }
    }

    const XY: [bool; STATE_DIM] = [true, true, false, false, false];
    const XYT: [bool; STATE_DIM] = [true, true, false, false, true];

    fn windowed(method: WindowMethod, window: usize) -> WindowedStrategy {
        WindowedStrategy::new(
            method,
            window,
            DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0, 0.25]),
            DMatrix::identity(5, 5),
        )
        .unwrap()
    }

    #[test]
    fn strategy_kind_parses_kebab_case() {
        #[derive(Deserialize)]
        struct Holder {
            strategy: StrategyKind,
        }
        let h: Holder = toml::from_str("strategy = \"weighted-average\"").unwrap();
        assert_eq!(h.strategy, StrategyKind::WeightedAverage);
        assert_eq!(StrategyKind::default(), StrategyKind::Kalman);
    }

    #[test]
    fn build_strategy_selects_implementation() {
        let filter = KalmanFilter::new(
            DVector::zeros(5),
            DMatrix::identity(5, 5),
            TransitionModel::new(DMatrix::identity(5, 5), 0.1).unwrap(),
            DMatrix::zeros(5, 5),
        )
        .unwrap();
        let kalman = build_strategy(StrategyKind::Kalman, filter.clone(), 10).unwrap();
        assert_eq!(kalman.name(), "kalman");
        let median = build_strategy(StrategyKind::Median, filter.clone(), 10).unwrap();
        assert_eq!(median.name(), "median");
        assert!(build_strategy(StrategyKind::Average, filter, 0).is_err());
    }

    #[test]
    fn kalman_snapshot_is_independent() {
        let filter = KalmanFilter::new(
            DVector::zeros(5),
            DMatrix::identity(5, 5),
            TransitionModel::new(DMatrix::identity(5, 5), 0.1).unwrap(),
            DMatrix::zeros(5, 5),
        )
        .unwrap();
        let mut strategy = KalmanStrategy::new(filter);
        let saved = strategy.snapshot();
        strategy
            .update(&prepared([1.0, 1.0, 0.0, 0.0, 0.0], XY, 1.0))
            .unwrap();
        assert!(strategy.state()[0] > 0.0);
        assert_eq!(saved.state()[0], 0.0);
    }

    #[test]
    fn average_keeps_unobserved_components_at_base() {
        let mut s = windowed(WindowMethod::Average, 10);
        s.update(&prepared([1.0, 2.0, 9.0, 9.0, 9.0], XY, 1.0)).unwrap();
        s.update(&prepared([3.0, 4.0, 9.0, 9.0, 9.0], XY, 1.0)).unwrap();
        let x = s.state();
        assert_relative_eq!(x[0], 2.0);
        assert_relative_eq!(x[1], 3.0);
        assert_relative_eq!(x[2], 0.0);
        assert_relative_eq!(x[4], 0.25);
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let mut s = windowed(WindowMethod::Average, 2);
        for v in [100.0, 1.0, 3.0] {
            s.update(&prepared([v, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        }
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s.state()[0], 2.0);
    }

    #[test]
    fn weighted_average_uses_sensor_weight() {
        let mut s = windowed(WindowMethod::WeightedAverage, 10);
        s.update(&prepared([0.0, 0.0, 0.0, 0.0, 0.0], XY, 3.0)).unwrap();
        s.update(&prepared([4.0, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        assert_relative_eq!(s.state()[0], 1.0);
    }

    #[test]
    fn median_ignores_outlier() {
        let mut s = windowed(WindowMethod::Median, 10);
        for v in [1.0, 1.2, 50.0, 0.9, 1.1] {
            s.update(&prepared([v, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        }
        assert_relative_eq!(s.state()[0], 1.1);
    }

    #[test]
    fn heading_average_handles_wraparound() {
        let mut s = windowed(WindowMethod::Average, 10);
        s.update(&prepared([0.0, 0.0, 0.0, 0.0, PI - 0.1], XYT, 1.0)).unwrap();
        s.update(&prepared([0.0, 0.0, 0.0, 0.0, -PI + 0.1], XYT, 1.0)).unwrap();
        assert_relative_eq!(s.state()[4].abs(), PI, epsilon = 1e-9);
    }

    #[test]
    fn trend_line_extrapolates_to_current_time() {
        let mut s = windowed(WindowMethod::TrendLine, 10);
        for step in 0..4 {
            if step > 0 {
                s.predict(1.0);
            }
            let x = 2.0 * step as f64;
            s.update(&prepared([x, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        }
        assert_relative_eq!(s.state()[0], 6.0, epsilon = 1e-9);
        s.predict(0.5);
        assert_relative_eq!(s.state()[0], 7.0, epsilon = 1e-9);
    }

    #[test]
    fn reset_clears_window() {
        let mut s = windowed(WindowMethod::Average, 10);
        s.update(&prepared([5.0, 5.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        s.reset(DVector::from_vec(vec![1.0, 2.0, 0.0, 0.0, 0.0]), DMatrix::identity(5, 5))
            .unwrap();
        assert!(s.is_empty());
        assert_relative_eq!(s.state()[0], 1.0);
        assert!(s.reset(DVector::zeros(4), DMatrix::identity(5, 5)).is_err());
    }

    #[test]
    fn covariance_reflects_sample_spread() {
        let mut s = windowed(WindowMethod::Average, 10);
        s.update(&prepared([1.0, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        s.update(&prepared([3.0, 0.0, 0.0, 0.0, 0.0], XY, 1.0)).unwrap();
        let cov = s.covariance();
        assert_relative_eq!(cov[(0, 0)], 2.0);
        assert_relative_eq!(cov[(1, 1)], 0.0);
        assert_relative_eq!(cov[(4, 4)], 1.0);
        assert!(s.uncertainty().is_finite());
    }

    #[test]
    fn update_without_observed_rows_is_rejected() {
        let mut s = windowed(WindowMethod::Average, 10);
        let mut m = prepared([1.0, 0.0, 0.0, 0.0, 0.0], XY, 1.0);
        m.observed = [false; STATE_DIM];
        assert_eq!(s.update(&m).unwrap_err(), SkipReason::NothingObserved);
        assert!(s.is_empty());
    }
}
