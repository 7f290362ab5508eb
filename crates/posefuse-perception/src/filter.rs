//! Linear Kalman filter over the canonical `[x, y, vx, vy, theta]` state.
//!
//! The filter owns the state vector `x` and covariance `P`; they change only
//! through [`KalmanFilter::predict`], [`KalmanFilter::update`] and
//! [`KalmanFilter::reset`].
//!
//! The configured transition matrix is valid at `time_step_initial`. For an
//! arbitrary `dt` it is rescaled linearly:
//!
//! ```text
//! F(dt) = I + (F_cfg − I) · dt / time_step_initial
//! Q(dt) = Q · dt / time_step_initial
//! ```
//!
//! # Example
//!
//! ```rust
//! use nalgebra::{DMatrix, DVector};
//! use posefuse_perception::filter::{KalmanFilter, TransitionModel};
//!
//! let mut f_cfg = DMatrix::<f64>::identity(5, 5);
//! f_cfg[(0, 2)] = 0.1;
//! f_cfg[(1, 3)] = 0.1;
//!
//! let mut kf = KalmanFilter::new(
//!     DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 0.0]),
//!     DMatrix::identity(5, 5),
//!     TransitionModel::new(f_cfg, 0.1).unwrap(),
//!     DMatrix::zeros(5, 5),
//! )
//! .unwrap();
//!
//! kf.predict(0.5);
//! assert!((kf.state()[0] - 0.5).abs() < 1e-12);
//! ```

use nalgebra::{DMatrix, DVector};
use posefuse_types::{PoseError, STATE_DIM, SkipReason, index};

use crate::linalg::{condition_number, pose_uncertainty, symmetrize, wrap_angle};

/// Innovation covariances with a larger condition number are rejected.
pub const MAX_INNOVATION_CONDITION: f64 = 1e12;

// ────────────────────────────────────────────────────────────────────────────
// TransitionModel
// ────────────────────────────────────────────────────────────────────────────

/// State transition matrix together with the time step it was written for.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionModel {
    matrix: DMatrix<f64>,
    time_step: f64,
}

impl TransitionModel {
    pub fn new(matrix: DMatrix<f64>, time_step: f64) -> Result<Self, PoseError> {
        if !matrix.is_square() {
            return Err(PoseError::DimensionMismatch {
                what: "state_transition_matrix".into(),
                expected: "square".into(),
                found: format!("{}x{}", matrix.nrows(), matrix.ncols()),
            });
        }
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(PoseError::Config(format!(
                "time_step_initial must be positive, got {time_step}"
            )));
        }
        Ok(Self { matrix, time_step })
    }

    /// Transition matrix for an elapsed time of `dt` seconds.
    pub fn at(&self, dt: f64) -> DMatrix<f64> {
        let n = self.matrix.nrows();
        let identity = DMatrix::<f64>::identity(n, n);
        &identity + (&self.matrix - &identity) * (dt / self.time_step)
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KalmanFilter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    x: DVector<f64>,
    p: DMatrix<f64>,
    transition: TransitionModel,
    q: DMatrix<f64>,
}

impl KalmanFilter {
    /// Build a filter, validating that every matrix matches the state length.
    pub fn new(
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        transition: TransitionModel,
        process_noise: DMatrix<f64>,
    ) -> Result<Self, PoseError> {
        let n = state.len();
        if n != STATE_DIM {
            return Err(PoseError::DimensionMismatch {
                what: "initial_state".into(),
                expected: STATE_DIM.to_string(),
                found: n.to_string(),
            });
        }
        check_square("initial_covariance", &covariance, n)?;
        check_square("state_transition_matrix", &transition.matrix, n)?;
        check_square("process_noise_matrix", &process_noise, n)?;

        let mut filter = Self {
            x: state,
            p: covariance,
            transition,
            q: process_noise,
        };
        filter.normalize();
        Ok(filter)
    }

    /// Propagate the state forward by `dt` seconds. `dt <= 0` is a no-op.
    pub fn predict(&mut self, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        let f = self.transition.at(dt);
        let scale = dt / self.transition.time_step;
        self.x = &f * &self.x;
        self.p = &f * &self.p * f.transpose() + &self.q * scale;
        self.normalize();
    }

    /// Fuse a measurement `z = H·x + v`, `v ~ N(0, R)`.
    ///
    /// On error `x` and `P` are left exactly as they were.
    pub fn update(
        &mut self,
        z: &DVector<f64>,
        h: &DMatrix<f64>,
        r: &DMatrix<f64>,
    ) -> Result<(), SkipReason> {
        let n = self.x.len();
        let m = z.len();
        if m == 0 {
            return Err(SkipReason::NothingObserved);
        }
        if h.nrows() != m || h.ncols() != n || r.nrows() != m || r.ncols() != m {
            return Err(SkipReason::ShapeMismatch(format!(
                "z {m}, H {}x{}, R {}x{} against state {n}",
                h.nrows(),
                h.ncols(),
                r.nrows(),
                r.ncols()
            )));
        }

        let mut y = z - h * &self.x;
        for row in angle_rows(h) {
            y[row] = wrap_angle(y[row]);
        }

        let s = h * &self.p * h.transpose() + r;
        let condition = condition_number(&s);
        if condition > MAX_INNOVATION_CONDITION {
            return Err(SkipReason::IllConditioned { condition });
        }
        let Some(s_inv) = s.try_inverse() else {
            return Err(SkipReason::IllConditioned {
                condition: f64::INFINITY,
            });
        };

        let k = &self.p * h.transpose() * s_inv;
        let x = &self.x + &k * y;

        // Joseph form keeps P positive semi-definite under rounding.
        let i_kh = DMatrix::<f64>::identity(n, n) - &k * h;
        let p = &i_kh * &self.p * i_kh.transpose() + &k * r * k.transpose();

        if x.iter().chain(p.iter()).any(|v| !v.is_finite()) {
            return Err(SkipReason::IllConditioned { condition });
        }

        self.x = x;
        self.p = p;
        self.normalize();
        Ok(())
    }

    /// Atomically replace state and covariance.
    pub fn reset(&mut self, state: DVector<f64>, covariance: DMatrix<f64>) -> Result<(), PoseError> {
        let n = self.x.len();
        if state.len() != n {
            return Err(PoseError::DimensionMismatch {
                what: "reset state".into(),
                expected: n.to_string(),
                found: state.len().to_string(),
            });
        }
        check_square("reset covariance", &covariance, n)?;
        self.x = state;
        self.p = covariance;
        self.normalize();
        Ok(())
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }

    /// See [`pose_uncertainty`].
    pub fn uncertainty(&self) -> f64 {
        pose_uncertainty(&self.p)
    }

    fn normalize(&mut self) {
        self.x[index::THETA] = wrap_angle(self.x[index::THETA]);
        symmetrize(&mut self.p);
    }
}

fn check_square(what: &str, m: &DMatrix<f64>, n: usize) -> Result<(), PoseError> {
    if m.nrows() != n || m.ncols() != n {
        return Err(PoseError::DimensionMismatch {
            what: what.to_string(),
            expected: format!("{n}x{n}"),
            found: format!("{}x{}", m.nrows(), m.ncols()),
        });
    }
    Ok(())
}

/// Rows of `h` that read only the heading component.
fn angle_rows(h: &DMatrix<f64>) -> impl Iterator<Item = usize> + '_ {
    (0..h.nrows()).filter(|&row| {
        h[(row, index::THETA)] != 0.0
            && (0..h.ncols()).all(|c| c == index::THETA || h[(row, c)] == 0.0)
    })
}
