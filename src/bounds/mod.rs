//! Box constraints and initial guesses for the registration parameters.
//!
//! The free parameters are laid out as `[tx, ty, tz, wx, wy, wz]` (translation followed by
//! the rotation vector), optionally followed by one uniform scale `s` or three per-axis
//! scales `s1, s2, s3`; see [`ParameterLayout`].
//!
//! Seeds are not checked against the box when they are set. At solve time
//! [`ParameterBounds::feasible_seed`] clamps every out-of-box component to the nearest
//! bound and logs a warning for it.

use crate::error::RegistrationError;
use crate::geometry::{RigidTransform, ScaleFactor};
use log::warn;
use nalgebra::{DVector, Matrix4, Vector3, Vector6};
use std::f64::consts::PI;

/// Which parameters are free in a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLayout {
    /// Translation and rotation only (6 parameters), scale fixed at 1.
    Rigid,
    /// Rigid parameters plus one scale shared by all axes (7 parameters).
    UniformScale,
    /// Rigid parameters plus one scale per axis (9 parameters).
    AnisotropicScale,
}

const PARAMETER_NAMES: [&str; 6] = ["tx", "ty", "tz", "wx", "wy", "wz"];
const AXIS_SCALE_NAMES: [&str; 3] = ["s1", "s2", "s3"];

impl ParameterLayout {
    pub fn dimension(&self) -> usize {
        match self {
            ParameterLayout::Rigid => 6,
            ParameterLayout::UniformScale => 7,
            ParameterLayout::AnisotropicScale => 9,
        }
    }

    pub fn parameter_name(&self, index: usize) -> &'static str {
        match (self, index) {
            (_, i) if i < 6 => PARAMETER_NAMES[i],
            (ParameterLayout::UniformScale, 6) => "s",
            (ParameterLayout::AnisotropicScale, i) if i < 9 => AXIS_SCALE_NAMES[i - 6],
            _ => "?",
        }
    }

    /// Packs a transform and a scale into a parameter vector of this layout.
    ///
    /// The rigid layout ignores `scale`; the uniform layout uses the mean of the scale
    /// components when given a per-axis factor.
    pub fn encode(&self, transform: &RigidTransform, scale: &ScaleFactor) -> DVector<f64> {
        let mut params = DVector::zeros(self.dimension());
        params
            .fixed_rows_mut::<3>(0)
            .copy_from(&transform.translation);
        params
            .fixed_rows_mut::<3>(3)
            .copy_from(&transform.rotation_vector());
        match self {
            ParameterLayout::Rigid => {}
            ParameterLayout::UniformScale => params[6] = scale.components().mean(),
            ParameterLayout::AnisotropicScale => {
                params.fixed_rows_mut::<3>(6).copy_from(&scale.components())
            }
        }
        params
    }

    /// Unpacks a parameter vector of this layout.
    pub fn decode(&self, params: &DVector<f64>) -> (RigidTransform, ScaleFactor) {
        let translation = Vector3::new(params[0], params[1], params[2]);
        let omega = Vector3::new(params[3], params[4], params[5]);
        let transform = RigidTransform::from_rotation_vector(translation, omega);
        let scale = match self {
            ParameterLayout::Rigid => ScaleFactor::Uniform(1.0),
            ParameterLayout::UniformScale => ScaleFactor::Uniform(params[6]),
            ParameterLayout::AnisotropicScale => {
                ScaleFactor::PerAxis(Vector3::new(params[6], params[7], params[8]))
            }
        };
        (transform, scale)
    }
}

fn validate_box(min: &[f64], max: &[f64], what: &str) -> Result<(), RegistrationError> {
    for (i, (lo, hi)) in min.iter().zip(max.iter()).enumerate() {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(RegistrationError::InvalidInput(format!(
                "{what} bound {i} is invalid: min {lo} must not exceed max {hi}"
            )));
        }
    }
    Ok(())
}

fn validate_scale_box(min: &[f64], max: &[f64]) -> Result<(), RegistrationError> {
    validate_box(min, max, "scale")?;
    if min
        .iter()
        .chain(max.iter())
        .any(|v| !v.is_finite() || *v <= 0.0)
    {
        return Err(RegistrationError::InvalidInput(format!(
            "scale bounds must be finite and strictly positive, got min {min:?} max {max:?}"
        )));
    }
    Ok(())
}

fn validate_scale_seed(values: &[f64]) -> Result<(), RegistrationError> {
    if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(RegistrationError::InvalidInput(format!(
            "scale initial guess must be finite and strictly positive, got {values:?}"
        )));
    }
    Ok(())
}

/// Bounds box and seed for every parameter of every [`ParameterLayout`].
///
/// Scalar and per-axis scale settings are kept separately: the uniform layout reads
/// `scale_*`, the anisotropic layout reads `axis_scale_*`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBounds {
    transform_min: Vector6<f64>,
    transform_max: Vector6<f64>,
    scale_min: f64,
    scale_max: f64,
    axis_scale_min: Vector3<f64>,
    axis_scale_max: Vector3<f64>,
    initial_transform: RigidTransform,
    initial_scale: f64,
    initial_axis_scale: Vector3<f64>,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            transform_min: Vector6::new(-1.0, -1.0, -1.0, -PI, -PI, -PI),
            transform_max: Vector6::new(1.0, 1.0, 1.0, PI, PI, PI),
            scale_min: 0.1,
            scale_max: 10.0,
            axis_scale_min: Vector3::repeat(0.1),
            axis_scale_max: Vector3::repeat(10.0),
            initial_transform: RigidTransform::identity(),
            initial_scale: 1.0,
            initial_axis_scale: Vector3::repeat(1.0),
        }
    }
}

impl ParameterBounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the box for translation (first 3 entries, length units) and rotation vector
    /// (last 3 entries, radians).
    ///
    /// A warning is logged when the rotation box reaches rotation vectors of norm `2 * pi`,
    /// where the exponential map becomes singular.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidInput`] if any `min[i] > max[i]` or a bound is NaN. The
    ///   previous bounds are kept.
    pub fn set_transform_bounds(
        &mut self,
        min: &Vector6<f64>,
        max: &Vector6<f64>,
    ) -> Result<(), RegistrationError> {
        validate_box(min.as_slice(), max.as_slice(), "transform")?;
        self.transform_min = *min;
        self.transform_max = *max;

        let farthest = Vector3::from_fn(|i, _| min[3 + i].abs().max(max[3 + i].abs()));
        if farthest.norm() >= 2.0 * PI {
            warn!(
                "Rotation bounds reach rotation vectors of norm {:.3} >= 2*pi, \
                 the rotation parameterization is singular there",
                farthest.norm()
            );
        }
        Ok(())
    }

    /// Sets the bounds of the uniform scale factor.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidInput`] if `min > max` or either bound is not finite and
    ///   strictly positive. The previous bounds are kept.
    pub fn set_scale_bounds(&mut self, min: f64, max: f64) -> Result<(), RegistrationError> {
        validate_scale_box(&[min], &[max])?;
        self.scale_min = min;
        self.scale_max = max;
        Ok(())
    }

    /// Per-axis version of [`ParameterBounds::set_scale_bounds`].
    pub fn set_axis_scale_bounds(
        &mut self,
        min: &Vector3<f64>,
        max: &Vector3<f64>,
    ) -> Result<(), RegistrationError> {
        validate_scale_box(min.as_slice(), max.as_slice())?;
        self.axis_scale_min = *min;
        self.axis_scale_max = *max;
        Ok(())
    }

    /// Sets the initial guess from a 4x4 homogeneous matrix.
    ///
    /// See [`RigidTransform::from_homogeneous`] for the rejection and re-orthonormalization
    /// policy. The guess is not compared with the bounds box here.
    pub fn set_initial_guess(&mut self, h: &Matrix4<f64>) -> Result<(), RegistrationError> {
        self.initial_transform = RigidTransform::from_homogeneous(h)?;
        Ok(())
    }

    pub fn set_initial_transform(&mut self, transform: RigidTransform) {
        self.initial_transform = transform;
    }

    pub fn set_scale_initial_guess(&mut self, scale: f64) -> Result<(), RegistrationError> {
        validate_scale_seed(&[scale])?;
        self.initial_scale = scale;
        Ok(())
    }

    pub fn set_axis_scale_initial_guess(
        &mut self,
        scale: &Vector3<f64>,
    ) -> Result<(), RegistrationError> {
        validate_scale_seed(scale.as_slice())?;
        self.initial_axis_scale = *scale;
        Ok(())
    }

    pub fn transform_bounds(&self) -> (Vector6<f64>, Vector6<f64>) {
        (self.transform_min, self.transform_max)
    }

    pub fn scale_bounds(&self) -> (f64, f64) {
        (self.scale_min, self.scale_max)
    }

    pub fn axis_scale_bounds(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.axis_scale_min, self.axis_scale_max)
    }

    pub fn initial_transform(&self) -> &RigidTransform {
        &self.initial_transform
    }

    pub fn initial_scale(&self) -> f64 {
        self.initial_scale
    }

    pub fn initial_axis_scale(&self) -> Vector3<f64> {
        self.initial_axis_scale
    }

    /// Re-checks every box and seed; run by the solver before formulating a problem.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        validate_box(
            self.transform_min.as_slice(),
            self.transform_max.as_slice(),
            "transform",
        )?;
        validate_scale_box(&[self.scale_min], &[self.scale_max])?;
        validate_scale_box(
            self.axis_scale_min.as_slice(),
            self.axis_scale_max.as_slice(),
        )?;
        validate_scale_seed(&[self.initial_scale])?;
        validate_scale_seed(self.initial_axis_scale.as_slice())
    }

    /// Lower bounds of the parameter vector for `layout`.
    pub fn lower(&self, layout: ParameterLayout) -> DVector<f64> {
        self.stack(layout, &self.transform_min, self.scale_min, &self.axis_scale_min)
    }

    /// Upper bounds of the parameter vector for `layout`.
    pub fn upper(&self, layout: ParameterLayout) -> DVector<f64> {
        self.stack(layout, &self.transform_max, self.scale_max, &self.axis_scale_max)
    }

    fn stack(
        &self,
        layout: ParameterLayout,
        transform: &Vector6<f64>,
        scale: f64,
        axis_scale: &Vector3<f64>,
    ) -> DVector<f64> {
        let mut out = DVector::zeros(layout.dimension());
        out.fixed_rows_mut::<6>(0).copy_from(transform);
        match layout {
            ParameterLayout::Rigid => {}
            ParameterLayout::UniformScale => out[6] = scale,
            ParameterLayout::AnisotropicScale => out.fixed_rows_mut::<3>(6).copy_from(axis_scale),
        }
        out
    }

    /// The stored seed for `layout`, before any clamping.
    pub fn seed(&self, layout: ParameterLayout) -> DVector<f64> {
        let scale = match layout {
            ParameterLayout::AnisotropicScale => ScaleFactor::PerAxis(self.initial_axis_scale),
            _ => ScaleFactor::Uniform(self.initial_scale),
        };
        layout.encode(&self.initial_transform, &scale)
    }

    /// The seed for `layout` projected onto the bounds box.
    ///
    /// Each clamped component is reported with a warning; the stored seed is not modified.
    pub fn feasible_seed(&self, layout: ParameterLayout) -> DVector<f64> {
        let lower = self.lower(layout);
        let upper = self.upper(layout);
        let mut seed = self.seed(layout);
        for i in 0..seed.len() {
            let clamped = seed[i].clamp(lower[i], upper[i]);
            if clamped != seed[i] {
                warn!(
                    "Initial guess for {} = {} is outside [{}, {}], clamped to {}",
                    layout.parameter_name(i),
                    seed[i],
                    lower[i],
                    upper[i],
                    clamped
                );
                seed[i] = clamped;
            }
        }
        seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_bounds() {
        let bounds = ParameterBounds::default();
        let (min, max) = bounds.transform_bounds();
        assert_eq!(min, Vector6::new(-1.0, -1.0, -1.0, -PI, -PI, -PI));
        assert_eq!(max, Vector6::new(1.0, 1.0, 1.0, PI, PI, PI));
        assert_eq!(bounds.scale_bounds(), (0.1, 10.0));
        assert_eq!(
            bounds.axis_scale_bounds(),
            (Vector3::repeat(0.1), Vector3::repeat(10.0))
        );
        assert_eq!(bounds.initial_scale(), 1.0);
        assert!(bounds.validate().is_ok());
    }

    #[test]
    fn test_transform_bounds_rejects_inverted_box() {
        let mut bounds = ParameterBounds::default();
        let min = Vector6::new(-2.0, -2.0, -2.0, -1.0, -1.0, -1.0);
        let max = Vector6::new(2.0, 2.0, 2.0, 1.0, 1.0, 1.0);
        bounds.set_transform_bounds(&min, &max).unwrap();

        let mut inverted = max;
        inverted[4] = -1.5;
        assert!(matches!(
            bounds.set_transform_bounds(&min, &inverted),
            Err(RegistrationError::InvalidInput(_))
        ));
        let mut nan = min;
        nan[0] = f64::NAN;
        assert!(bounds.set_transform_bounds(&nan, &max).is_err());

        assert_eq!(bounds.transform_bounds(), (min, max));
    }

    #[test]
    fn test_scale_bounds_validation() {
        let mut bounds = ParameterBounds::default();
        bounds.set_scale_bounds(0.5, 2.0).unwrap();

        assert!(bounds.set_scale_bounds(3.0, 2.0).is_err());
        assert!(bounds.set_scale_bounds(0.0, 2.0).is_err());
        assert!(bounds.set_scale_bounds(-1.0, 2.0).is_err());
        assert!(bounds.set_scale_bounds(0.5, f64::INFINITY).is_err());
        assert_eq!(bounds.scale_bounds(), (0.5, 2.0));

        let min = Vector3::new(0.5, 0.5, 0.5);
        let max = Vector3::new(2.0, 2.0, 2.0);
        bounds.set_axis_scale_bounds(&min, &max).unwrap();
        assert!(bounds
            .set_axis_scale_bounds(&Vector3::new(0.5, 3.0, 0.5), &max)
            .is_err());
        assert!(bounds
            .set_axis_scale_bounds(&Vector3::new(0.5, -0.1, 0.5), &max)
            .is_err());
        assert_eq!(bounds.axis_scale_bounds(), (min, max));
    }

    #[test]
    fn test_scale_seed_validation() {
        let mut bounds = ParameterBounds::default();
        assert!(bounds.set_scale_initial_guess(0.0).is_err());
        assert!(bounds.set_scale_initial_guess(f64::NAN).is_err());
        bounds.set_scale_initial_guess(20.0).unwrap();
        assert_eq!(bounds.initial_scale(), 20.0);

        assert!(bounds
            .set_axis_scale_initial_guess(&Vector3::new(1.0, -1.0, 1.0))
            .is_err());
        bounds
            .set_axis_scale_initial_guess(&Vector3::new(1.0, 2.0, 3.0))
            .unwrap();
        assert_eq!(bounds.initial_axis_scale(), Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_initial_guess_policy() {
        let mut bounds = ParameterBounds::default();
        let mut reflection = Matrix4::identity();
        reflection[(0, 0)] = -1.0;
        assert!(bounds.set_initial_guess(&reflection).is_err());
        assert_eq!(*bounds.initial_transform(), RigidTransform::identity());

        let transform =
            RigidTransform::from_translation_rpy(Vector3::new(0.2, 0.0, -0.1), 0.1, 0.2, 0.3);
        bounds.set_initial_guess(&transform.to_homogeneous()).unwrap();
        assert!(bounds.initial_transform().rotation_angle_to(&transform) < 1e-9);
    }

    #[test]
    fn test_layout_encode_decode() {
        let transform = RigidTransform::from_rotation_vector(
            Vector3::new(0.1, 0.2, 0.3),
            Vector3::new(-0.4, 0.5, 0.6),
        );
        let scale = ScaleFactor::PerAxis(Vector3::new(1.0, 2.0, 3.0));

        let params = ParameterLayout::AnisotropicScale.encode(&transform, &scale);
        assert_eq!(params.len(), 9);
        let (decoded, decoded_scale) = ParameterLayout::AnisotropicScale.decode(&params);
        assert_relative_eq!(decoded.translation, transform.translation, epsilon = 1e-12);
        assert!(decoded.rotation_angle_to(&transform) < 1e-9);
        assert_eq!(decoded_scale, scale);

        let uniform = ParameterLayout::UniformScale.encode(&transform, &scale);
        assert_relative_eq!(uniform[6], 2.0);
        let (_, rigid_scale) = ParameterLayout::Rigid.decode(&params.rows(0, 6).into_owned());
        assert_eq!(rigid_scale, ScaleFactor::Uniform(1.0));
    }

    #[test]
    fn test_feasible_seed_clamps_out_of_box_values() {
        let mut bounds = ParameterBounds::default();
        bounds.set_initial_transform(RigidTransform::from_rotation_vector(
            Vector3::new(5.0, -0.5, 0.0),
            Vector3::zeros(),
        ));
        bounds.set_scale_initial_guess(50.0).unwrap();

        let seed = bounds.feasible_seed(ParameterLayout::UniformScale);
        assert_relative_eq!(seed[0], 1.0);
        assert_relative_eq!(seed[1], -0.5);
        assert_relative_eq!(seed[6], 10.0);

        // the stored seed is untouched
        assert_relative_eq!(bounds.seed(ParameterLayout::UniformScale)[0], 5.0);
        assert_eq!(bounds.initial_scale(), 50.0);
    }

    #[test]
    fn test_lower_upper_per_layout() {
        let bounds = ParameterBounds::default();
        assert_eq!(bounds.lower(ParameterLayout::Rigid).len(), 6);
        let upper = bounds.upper(ParameterLayout::UniformScale);
        assert_eq!(upper.len(), 7);
        assert_relative_eq!(upper[6], 10.0);
        let lower = bounds.lower(ParameterLayout::AnisotropicScale);
        assert_eq!(lower.len(), 9);
        assert_relative_eq!(lower[8], 0.1);
        assert_relative_eq!(lower[5], -PI);
    }
}
