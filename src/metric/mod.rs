//! Residual evaluation of a candidate transform over the correspondence database.
//!
//! The residual of a pair is `target - S * (R * source + t)`; the error reported everywhere
//! in this crate is the mean of the squared residual norms,
//!
//! `E = 1/N * sum_i |target_i - S * H * source_i|^2`.
//!
//! [`ErrorMetric`] is both the objective of the solver and a standalone utility for checking
//! a transform after the fact.

use crate::bounds::ParameterLayout;
use crate::correspondence::{CorrespondencePair, PointPairStore};
use crate::error::RegistrationError;
use crate::geometry::{rotation_vector_derivatives, RigidTransform, ScaleFactor};
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Summary of the per-pair residual norms `|target_i - S * H * source_i|`.
#[derive(Clone, Serialize, Deserialize)]
pub struct ResidualStats {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ResidualStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Residual [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Mean squared residual of a transform over a set of correspondences.
///
/// The metric borrows the pairs; it never copies or mutates them.
#[derive(Debug, Clone, Copy)]
pub struct ErrorMetric<'a> {
    pairs: &'a [CorrespondencePair],
}

impl<'a> ErrorMetric<'a> {
    pub fn new(store: &'a PointPairStore) -> Self {
        Self {
            pairs: store.pairs(),
        }
    }

    pub fn from_pairs(pairs: &'a [CorrespondencePair]) -> Self {
        Self { pairs }
    }

    fn ensure_not_empty(&self) -> Result<(), RegistrationError> {
        if self.pairs.is_empty() {
            return Err(RegistrationError::InsufficientData(
                "residual error is undefined on an empty point store".to_string(),
            ));
        }
        Ok(())
    }

    /// Computes the mean squared residual of `(transform, scale)`.
    ///
    /// # Arguments
    ///
    /// * `transform` - Candidate rigid transform `H`.
    /// * `scale` - Scaling applied after `H`; use `ScaleFactor::Uniform(1.0)` for a rigid check.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InsufficientData`] when there are no pairs.
    /// * [`RegistrationError::InvalidInput`] when the scale has a non-positive component.
    pub fn evaluate(
        &self,
        transform: &RigidTransform,
        scale: &ScaleFactor,
    ) -> Result<f64, RegistrationError> {
        self.ensure_not_empty()?;
        if !scale.is_valid() {
            return Err(RegistrationError::InvalidInput(format!(
                "scale factor must be strictly positive, got {:?}",
                scale.components().as_slice()
            )));
        }
        Ok(self.mean_squared(transform, scale))
    }

    /// Same as [`ErrorMetric::evaluate`], taking a packed parameter vector.
    pub fn evaluate_params(
        &self,
        layout: ParameterLayout,
        params: &DVector<f64>,
    ) -> Result<f64, RegistrationError> {
        check_dimension(layout, params)?;
        let (transform, scale) = layout.decode(params);
        self.evaluate(&transform, &scale)
    }

    /// Unchecked evaluation; callers guarantee a non-empty set.
    pub(crate) fn mean_squared(&self, transform: &RigidTransform, scale: &ScaleFactor) -> f64 {
        let sum: f64 = self
            .pairs
            .iter()
            .map(|pair| residual(pair, transform, scale).norm_squared())
            .sum();
        sum / self.pairs.len() as f64
    }

    /// Norm of every pair residual, in store order.
    pub fn residual_norms(
        &self,
        transform: &RigidTransform,
        scale: &ScaleFactor,
    ) -> Result<Vec<f64>, RegistrationError> {
        self.ensure_not_empty()?;
        Ok(self
            .pairs
            .iter()
            .map(|pair| residual(pair, transform, scale).norm())
            .collect())
    }

    pub fn statistics(
        &self,
        transform: &RigidTransform,
        scale: &ScaleFactor,
    ) -> Result<ResidualStats, RegistrationError> {
        let errors = self.residual_norms(transform, scale)?;

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ResidualStats {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }

    /// Analytic gradient of the mean squared residual with respect to the parameters of
    /// `layout`.
    ///
    /// With `u_i = R p_i + t` and `r_i = q_i - S u_i`:
    ///
    /// * `dE/dt = -2/N * sum S r_i`
    /// * `dE/dw_k = -2/N * sum (S r_i) . (dR/dw_k p_i)`
    /// * `dE/ds = -2/N * sum r_i . u_i` (uniform), `dE/ds_j = -2/N * sum r_ij u_ij` (per axis)
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InsufficientData`] when there are no pairs.
    /// * [`RegistrationError::InvalidInput`] when `params` does not match `layout`.
    pub fn gradient(
        &self,
        layout: ParameterLayout,
        params: &DVector<f64>,
    ) -> Result<DVector<f64>, RegistrationError> {
        self.ensure_not_empty()?;
        check_dimension(layout, params)?;
        Ok(self.mean_squared_gradient(layout, params))
    }

    /// Unchecked [`ErrorMetric::gradient`]; callers guarantee a non-empty set and a parameter
    /// vector matching `layout`.
    pub(crate) fn mean_squared_gradient(
        &self,
        layout: ParameterLayout,
        params: &DVector<f64>,
    ) -> DVector<f64> {
        let (transform, scale) = layout.decode(params);
        let omega = Vector3::new(params[3], params[4], params[5]);
        let derivatives = rotation_vector_derivatives(&omega);
        let s = scale.components();
        let weight = -2.0 / self.pairs.len() as f64;

        let mut grad = DVector::zeros(layout.dimension());
        for pair in self.pairs {
            let moved = transform.transform_point(&pair.source);
            let residual = pair.target - moved.component_mul(&s);
            let scaled_residual = residual.component_mul(&s);

            for k in 0..3 {
                grad[k] += weight * scaled_residual[k];
                grad[3 + k] += weight * scaled_residual.dot(&(derivatives[k] * pair.source));
            }
            match layout {
                ParameterLayout::Rigid => {}
                ParameterLayout::UniformScale => grad[6] += weight * residual.dot(&moved),
                ParameterLayout::AnisotropicScale => {
                    for j in 0..3 {
                        grad[6 + j] += weight * residual[j] * moved[j];
                    }
                }
            }
        }
        grad
    }
}

fn residual(
    pair: &CorrespondencePair,
    transform: &RigidTransform,
    scale: &ScaleFactor,
) -> Vector3<f64> {
    pair.target - scale.apply(&transform.transform_point(&pair.source))
}

fn check_dimension(
    layout: ParameterLayout,
    params: &DVector<f64>,
) -> Result<(), RegistrationError> {
    if params.len() != layout.dimension() {
        return Err(RegistrationError::InvalidInput(format!(
            "expected {} parameters for {:?}, got {}",
            layout.dimension(),
            layout,
            params.len()
        )));
    }
    Ok(())
}
