//! Least-squares formulation of the registration problem.

use crate::bounds::ParameterLayout;
use crate::correspondence::CorrespondencePair;
use crate::geometry::rotation_from_vector;
use crate::metric::ErrorMetric;
use crate::optimization::LeastSquaresObjective;
use nalgebra::{DVector, RealField, Vector3};

/// Residuals `(target_i - S (R(w) source_i + t)) / sqrt(N)` over every pair.
///
/// The `1/sqrt(N)` weight makes the sum of squared residuals equal to the mean squared
/// error reported by [`ErrorMetric`], so the engine and the convergence test minimize the
/// same quantity.
#[derive(Debug, Clone)]
pub(crate) struct RegistrationObjective {
    layout: ParameterLayout,
    pairs: Vec<CorrespondencePair>,
}

impl RegistrationObjective {
    pub(crate) fn new(layout: ParameterLayout, pairs: &[CorrespondencePair]) -> Self {
        Self {
            layout,
            pairs: pairs.to_vec(),
        }
    }
}

impl LeastSquaresObjective for RegistrationObjective {
    fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    fn num_residuals(&self) -> usize {
        3 * self.pairs.len()
    }

    fn residuals<T: RealField>(&self, params: &DVector<T>) -> DVector<T> {
        let translation = Vector3::new(params[0].clone(), params[1].clone(), params[2].clone());
        let omega = Vector3::new(params[3].clone(), params[4].clone(), params[5].clone());
        let rotation = rotation_from_vector(&omega);
        let scale: Vector3<T> = match self.layout {
            ParameterLayout::Rigid => Vector3::repeat(T::one()),
            ParameterLayout::UniformScale => Vector3::repeat(params[6].clone()),
            ParameterLayout::AnisotropicScale => {
                Vector3::new(params[6].clone(), params[7].clone(), params[8].clone())
            }
        };
        let weight = nalgebra::convert::<f64, T>((1.0 / self.pairs.len() as f64).sqrt());

        let mut residuals = DVector::zeros(self.num_residuals());
        for (i, pair) in self.pairs.iter().enumerate() {
            let source: Vector3<T> = pair.source.map(nalgebra::convert::<f64, T>);
            let target: Vector3<T> = pair.target.map(nalgebra::convert::<f64, T>);
            let moved = (&rotation * source + &translation).component_mul(&scale);
            let residual = (target - moved) * weight.clone();
            residuals.fixed_rows_mut::<3>(3 * i).copy_from(&residual);
        }
        residuals
    }

    fn cost(&self, params: &DVector<f64>) -> f64 {
        let (transform, scale) = self.layout.decode(params);
        ErrorMetric::from_pairs(&self.pairs).mean_squared(&transform, &scale)
    }

    fn gradient(&self, params: &DVector<f64>) -> DVector<f64> {
        ErrorMetric::from_pairs(&self.pairs).mean_squared_gradient(self.layout, params)
    }
}
