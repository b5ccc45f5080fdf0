//! Bounded Levenberg-Marquardt engine backed by `tiny_solver`.
//!
//! The free parameters live in a single `tiny_solver` variable block. Box constraints are
//! installed per component with `set_variable_bounds`, and the Jacobian comes from the
//! solver's automatic differentiation through [`LeastSquaresObjective::residuals`].
//!
//! A `tiny_solver` run stops on its own criteria (error decrease thresholds, iteration budget,
//! rejected steps). Those are not a certificate of optimality, so after every run the engine
//! tests the projected gradient of the objective. When the test fails, the next run starts
//! from the point reached with an updated active set: parameters resting on a bound whose
//! gradient pushes outward are held fixed, and parameters whose gradient points back into
//! the box are released. The bounded step of `tiny_solver` only clamps, so without this a
//! run stalls on optima where a bound is coupled with free parameters.

use super::{
    BoundedOptimizer, BoundedProblem, LeastSquaresObjective, OptimizationOutcome, SolverOptions,
};
use crate::error::RegistrationError;
use log::{debug, info, warn};
use nalgebra::{DVector, RealField};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const PARAMS_KEY: &str = "params";

/// `tiny_solver`'s default diagonal clamp and initial trust region.
const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;
const INITIAL_TRUST_REGION_RADIUS: f64 = 1e4;
/// Factor applied to the trust region after a run that did not lower the cost.
const TRUST_REGION_SHRINK: f64 = 0.01;

/// Cost function handed to `tiny_solver`.
///
/// The block holds only the free parameters; held parameters are read from `base`.
#[derive(Debug, Clone)]
struct ObjectiveFactor<O> {
    objective: O,
    base: DVector<f64>,
    free: Vec<usize>,
}

impl<O: LeastSquaresObjective> ObjectiveFactor<O> {
    fn expand<T: RealField>(&self, free_values: &DVector<T>) -> DVector<T> {
        let mut full = DVector::from_fn(self.base.len(), |i, _| {
            nalgebra::convert::<f64, T>(self.base[i])
        });
        for (k, &i) in self.free.iter().enumerate() {
            full[i] = free_values[k].clone();
        }
        full
    }
}

impl<T: RealField, O: LeastSquaresObjective> Factor<T> for ObjectiveFactor<O> {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        self.objective.residuals(&self.expand(&params[0]))
    }
}

/// Indices of the parameters a run should optimize.
///
/// A parameter is held when it sits on a bound and the gradient pushes it out of the box.
fn free_indices<O: LeastSquaresObjective>(
    problem: &BoundedProblem<O>,
    params: &DVector<f64>,
    gradient: &DVector<f64>,
) -> Vec<usize> {
    (0..params.len())
        .filter(|&i| {
            let g = gradient[i];
            let held = (problem.at_lower(params, i) && g > 0.0)
                || (problem.at_upper(params, i) && g < 0.0);
            !held
        })
        .collect()
}

/// [`BoundedOptimizer`] implemented with `tiny_solver`'s Levenberg-Marquardt optimizer.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardtEngine {
    options: SolverOptions,
}

impl LevenbergMarquardtEngine {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    fn optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.options.max_iterations,
            verbosity_level: self.options.verbosity,
            min_abs_error_decrease_threshold: self.options.min_abs_error_decrease,
            min_rel_error_decrease_threshold: self.options.min_rel_error_decrease,
            min_error_threshold: self.options.min_error,
            ..OptimizerOptions::default()
        }
    }

    /// One `tiny_solver` run over the parameters in `free`, the others held at `start`.
    fn run<O: LeastSquaresObjective>(
        &self,
        problem: &BoundedProblem<O>,
        start: &DVector<f64>,
        free: &[usize],
        trust_region_radius: f64,
    ) -> Result<DVector<f64>, RegistrationError> {
        let objective = problem.objective();
        let mut tiny_problem = tiny_solver::Problem::new();
        tiny_problem.add_residual_block(
            objective.num_residuals(),
            &[PARAMS_KEY],
            Box::new(ObjectiveFactor {
                objective: objective.clone(),
                base: start.clone(),
                free: free.to_vec(),
            }),
            None,
        );
        for (k, &i) in free.iter().enumerate() {
            let (lower, upper) = (problem.lower()[i], problem.upper()[i]);
            if lower.is_finite() || upper.is_finite() {
                tiny_problem.set_variable_bounds(PARAMS_KEY, k, lower, upper);
            }
        }

        let mut initial_values = HashMap::new();
        initial_values.insert(
            PARAMS_KEY.to_string(),
            DVector::from_iterator(free.len(), free.iter().map(|&i| start[i])),
        );

        let solution =
            LevenbergMarquardtOptimizer::new(MIN_DIAGONAL, MAX_DIAGONAL, trust_region_radius)
                .optimize(&tiny_problem, &initial_values, Some(self.optimizer_options()))
                .ok_or_else(|| {
                    RegistrationError::Convergence(
                        "Levenberg-Marquardt engine returned no solution".to_string(),
                    )
                })?;
        let raw = solution.get(PARAMS_KEY).ok_or_else(|| {
            RegistrationError::Convergence(
                "Levenberg-Marquardt solution is missing the parameter block".to_string(),
            )
        })?;
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RegistrationError::Convergence(format!(
                "Levenberg-Marquardt engine produced non-finite parameters {:?}",
                raw.as_slice()
            )));
        }

        let mut params = start.clone();
        for (k, &i) in free.iter().enumerate() {
            params[i] = raw[k];
        }
        Ok(problem.clamp(&params))
    }
}

impl BoundedOptimizer for LevenbergMarquardtEngine {
    fn minimize<O: LeastSquaresObjective>(
        &self,
        problem: &BoundedProblem<O>,
    ) -> Result<OptimizationOutcome, RegistrationError> {
        self.options.validate()?;
        problem.validate()?;

        let objective = problem.objective();
        let mut current = problem.initial().clone();
        let mut current_cost = objective.cost(&current);
        let mut free: Vec<usize> = (0..objective.dimension()).collect();
        let mut trust_region_radius = INITIAL_TRUST_REGION_RADIUS;
        let mut runs = 0;

        loop {
            runs += 1;
            let params = if free.is_empty() {
                current.clone()
            } else {
                self.run(problem, &current, &free, trust_region_radius)?
            };

            let cost = objective.cost(&params);
            let gradient = objective.gradient(&params);
            let projected_gradient_norm = problem.projected_gradient_norm(&params, &gradient);
            let converged =
                cost.is_finite() && projected_gradient_norm <= self.options.gradient_tolerance;

            debug!(
                "LM run {runs} over {} free parameter(s): cost {cost:.6e}, \
                 projected gradient norm {projected_gradient_norm:.3e}",
                free.len()
            );

            if converged || runs > self.options.max_restarts {
                if converged {
                    info!("LM converged after {runs} run(s) with cost {cost:.6e}");
                } else {
                    warn!(
                        "LM stopped after {runs} run(s) without converging \
                         (projected gradient norm {projected_gradient_norm:.3e})"
                    );
                }
                return Ok(OptimizationOutcome {
                    params,
                    cost,
                    projected_gradient_norm,
                    runs,
                    converged,
                });
            }

            // a run ends on its first rejected step, so an identical restart would stall too
            if cost < current_cost {
                trust_region_radius = INITIAL_TRUST_REGION_RADIUS;
            } else {
                trust_region_radius *= TRUST_REGION_SHRINK;
            }

            free = free_indices(problem, &params, &gradient);
            debug!(
                "Holding parameters {:?} on their bounds, trust region {trust_region_radius:.1e}",
                (0..params.len())
                    .filter(|i| !free.contains(i))
                    .collect::<Vec<_>>()
            );
            current = params;
            current_cost = cost;
        }
    }
}
