//! The `optimization` module abstracts the bounded nonlinear least-squares engine.
//!
//! A problem is a [`LeastSquaresObjective`] together with an initial point and a box
//! `lower <= x <= upper` ([`BoundedProblem`]). Any engine able to minimize such a problem
//! implements [`BoundedOptimizer`]; the crate ships [`LevenbergMarquardtEngine`], an adapter
//! over the bounded Levenberg-Marquardt solver of `tiny-solver`.
//!
//! Engines report whether they reached a first-order stationary point of the box-constrained
//! problem. The check uses the projected gradient: gradient components pushing against an
//! active bound are discarded, and the norm of what remains must fall below
//! [`SolverOptions::gradient_tolerance`].

use crate::error::RegistrationError;
use nalgebra::{DVector, RealField};
use serde::{Deserialize, Serialize};

pub mod levenberg_marquardt;

pub use levenberg_marquardt::LevenbergMarquardtEngine;

/// A sum-of-squares objective over a fixed-size real parameter vector.
///
/// `residuals` is generic so that engines can evaluate it on dual numbers and obtain the
/// Jacobian by automatic differentiation. `cost` and `gradient` describe the scalar
/// objective the residuals stand for and are used to certify convergence.
pub trait LeastSquaresObjective: Clone + Send + Sync + 'static {
    /// Number of free parameters.
    fn dimension(&self) -> usize;

    /// Length of the vector returned by [`LeastSquaresObjective::residuals`].
    fn num_residuals(&self) -> usize;

    fn residuals<T: RealField>(&self, params: &DVector<T>) -> DVector<T>;

    /// Scalar objective at `params`; minimized together with the squared residuals.
    fn cost(&self, params: &DVector<f64>) -> f64;

    /// Gradient of [`LeastSquaresObjective::cost`] at `params`.
    fn gradient(&self, params: &DVector<f64>) -> DVector<f64>;
}

/// Engine-level configuration: iteration budget and stopping criteria.
///
/// A solve never runs longer than `(max_restarts + 1) * max_iterations` engine iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Iteration budget of one engine run.
    pub max_iterations: usize,
    /// Stop a run when the sum of squares decreases by less than this.
    pub min_abs_error_decrease: f64,
    /// Stop a run when the relative decrease of the sum of squares falls below this.
    pub min_rel_error_decrease: f64,
    /// Stop a run when the sum of squares falls below this.
    pub min_error: f64,
    /// Projected gradient norm under which a point is accepted as converged.
    pub gradient_tolerance: f64,
    /// Additional runs from the last point when a run ends unconverged. Each one may change
    /// which parameters are held on their bounds.
    pub max_restarts: usize,
    /// Verbosity forwarded to the engine.
    pub verbosity: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            min_abs_error_decrease: 1e-16,
            min_rel_error_decrease: 1e-12,
            min_error: 1e-20,
            gradient_tolerance: 1e-6,
            max_restarts: 10,
            verbosity: 0,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.max_iterations == 0 {
            return Err(RegistrationError::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let thresholds = [
            self.min_abs_error_decrease,
            self.min_rel_error_decrease,
            self.min_error,
            self.gradient_tolerance,
        ];
        if thresholds.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(RegistrationError::InvalidInput(format!(
                "solver thresholds must be finite and non-negative, got {thresholds:?}"
            )));
        }
        Ok(())
    }
}

/// Objective, initial point and box constraints of one minimization.
#[derive(Debug, Clone)]
pub struct BoundedProblem<O> {
    objective: O,
    initial: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl<O: LeastSquaresObjective> BoundedProblem<O> {
    /// Creates an unbounded problem; see [`BoundedProblem::with_bounds`].
    pub fn new(objective: O, initial: DVector<f64>) -> Self {
        let n = initial.len();
        Self {
            objective,
            initial,
            lower: DVector::from_element(n, f64::NEG_INFINITY),
            upper: DVector::from_element(n, f64::INFINITY),
        }
    }

    /// Attaches box constraints and validates the whole problem.
    pub fn with_bounds(
        mut self,
        lower: DVector<f64>,
        upper: DVector<f64>,
    ) -> Result<Self, RegistrationError> {
        self.lower = lower;
        self.upper = upper;
        self.validate()?;
        Ok(self)
    }

    /// Checks dimensions, the box, and feasibility of the initial point.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        let n = self.objective.dimension();
        if self.initial.len() != n || self.lower.len() != n || self.upper.len() != n {
            return Err(RegistrationError::InvalidInput(format!(
                "problem of dimension {n} got initial/lower/upper of lengths {}/{}/{}",
                self.initial.len(),
                self.lower.len(),
                self.upper.len()
            )));
        }
        for i in 0..n {
            let (lo, hi, x) = (self.lower[i], self.upper[i], self.initial[i]);
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(RegistrationError::InvalidInput(format!(
                    "parameter {i}: lower bound {lo} exceeds upper bound {hi}"
                )));
            }
            if !x.is_finite() || x < lo || x > hi {
                return Err(RegistrationError::InvalidInput(format!(
                    "parameter {i}: initial value {x} is outside [{lo}, {hi}]"
                )));
            }
        }
        Ok(())
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn initial(&self) -> &DVector<f64> {
        &self.initial
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    /// Projects `params` onto the box.
    pub fn clamp(&self, params: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(params.len(), |i, _| {
            params[i].max(self.lower[i]).min(self.upper[i])
        })
    }

    /// Whether component `i` of `params` rests on its lower bound.
    pub fn at_lower(&self, params: &DVector<f64>, i: usize) -> bool {
        params[i] <= self.lower[i] + active_tolerance(self.lower[i])
    }

    /// Whether component `i` of `params` rests on its upper bound.
    pub fn at_upper(&self, params: &DVector<f64>, i: usize) -> bool {
        params[i] >= self.upper[i] - active_tolerance(self.upper[i])
    }

    /// Norm of the gradient with the components blocked by active bounds removed.
    pub fn projected_gradient_norm(&self, params: &DVector<f64>, gradient: &DVector<f64>) -> f64 {
        let mut sum_sq = 0.0;
        for i in 0..params.len() {
            let g = gradient[i];
            if (self.at_lower(params, i) && g > 0.0) || (self.at_upper(params, i) && g < 0.0) {
                continue;
            }
            sum_sq += g * g;
        }
        sum_sq.sqrt()
    }
}

fn active_tolerance(bound: f64) -> f64 {
    if bound.is_finite() {
        1e-10 * (1.0 + bound.abs())
    } else {
        0.0
    }
}

/// Result of [`BoundedOptimizer::minimize`].
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Final parameters, inside the box.
    pub params: DVector<f64>,
    /// Objective value at `params`.
    pub cost: f64,
    pub projected_gradient_norm: f64,
    /// Number of engine runs performed.
    pub runs: usize,
    /// Whether `params` satisfies the first-order optimality test.
    pub converged: bool,
}

/// A bounded, differentiable minimizer.
///
/// Implementations return `Ok` with `converged == false` when the budget is exhausted
/// without satisfying the stopping test, and `Err` only when the engine could not produce
/// a usable point at all.
pub trait BoundedOptimizer {
    fn minimize<O: LeastSquaresObjective>(
        &self,
        problem: &BoundedProblem<O>,
    ) -> Result<OptimizationOutcome, RegistrationError>;
}
