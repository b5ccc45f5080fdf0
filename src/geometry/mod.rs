//! Rigid-body geometry used by the registration problem.
//!
//! Rotations are parameterized by their rotation vector `w = angle * axis` (exponential
//! coordinates of SO(3)). The exponential map is smooth everywhere and its derivative is
//! singular only at `|w| = 2 * pi * k` for `k >= 1`, so a box of `[-pi, pi]` per component
//! (maximum norm `pi * sqrt(3)`) never reaches a singular configuration.
//!
//! [`rotation_from_vector`] is generic over [`RealField`] so that the optimizer can evaluate
//! it on dual numbers; [`rotation_vector_derivatives`] gives the closed-form partial
//! derivatives used by the analytic gradient in [`crate::metric`].

use crate::error::RegistrationError;
use log::warn;
use nalgebra::{Matrix3, Matrix4, RealField, Rotation3, Vector3};

/// A 3D point expressed in one of the two reference frames.
pub type Point3D = Vector3<f64>;

/// Below this squared angle the exponential map switches to its Taylor expansion.
const SMALL_ANGLE_SQ: f64 = 1e-8;

/// Tolerance on the `[0 0 0 1]` bottom row of a homogeneous matrix.
const HOMOGENEOUS_ROW_TOLERANCE: f64 = 1e-9;

/// Returns the cross-product matrix `[v]x`, such that `[v]x * u = v x u`.
pub fn skew<T: RealField>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z.clone(),
        v.y.clone(),
        v.z.clone(),
        T::zero(),
        -v.x.clone(),
        -v.y.clone(),
        v.x.clone(),
        T::zero(),
    )
}

/// Exponential map from a rotation vector to a rotation matrix (Rodrigues' formula).
///
/// `R = I + A [w]x + B [w]x^2` with `A = sin(t) / t` and `B = (1 - cos(t)) / t^2`, where
/// `t = |w|`. For `t^2` below `1e-8` both coefficients are replaced by their second-order
/// series so the map stays differentiable at the identity, which is the default seed.
///
/// # Arguments
///
/// * `omega` - Rotation vector; direction is the axis, norm is the angle in radians.
///
/// # Returns
///
/// The orthonormal 3x3 rotation matrix.
pub fn rotation_from_vector<T: RealField>(omega: &Vector3<T>) -> Matrix3<T> {
    let theta_sq = omega.norm_squared();
    let k = skew(omega);
    let k_sq = &k * &k;

    let (a, b) = if theta_sq < nalgebra::convert::<f64, T>(SMALL_ANGLE_SQ) {
        let a = T::one() - theta_sq.clone() / nalgebra::convert::<f64, T>(6.0);
        let b = nalgebra::convert::<f64, T>(0.5) - theta_sq / nalgebra::convert::<f64, T>(24.0);
        (a, b)
    } else {
        let theta = theta_sq.clone().sqrt();
        let a = theta.clone().sin() / theta.clone();
        let b = (T::one() - theta.cos()) / theta_sq;
        (a, b)
    };

    Matrix3::identity() + k * a + k_sq * b
}

/// Partial derivatives `dR/dw_i` of [`rotation_from_vector`] for `i = 0, 1, 2`.
///
/// Uses the closed form of Gallego and Yezzi,
/// `dR/dw_i = (w_i [w]x + [w x (I - R) e_i]x) / |w|^2 * R`,
/// and the first-order expansion `[e_i]x + ([w]x [e_i]x + [e_i]x [w]x) / 2` near the identity.
pub fn rotation_vector_derivatives(omega: &Vector3<f64>) -> [Matrix3<f64>; 3] {
    let theta_sq = omega.norm_squared();
    let k = skew(omega);

    if theta_sq < SMALL_ANGLE_SQ {
        let generators = [
            skew(&Vector3::x()),
            skew(&Vector3::y()),
            skew(&Vector3::z()),
        ];
        return generators.map(|e| e + (k * e + e * k) * 0.5);
    }

    let rotation = rotation_from_vector(omega);
    let identity_minus_r = Matrix3::identity() - rotation;
    let mut derivatives = [Matrix3::zeros(); 3];
    for (i, derivative) in derivatives.iter_mut().enumerate() {
        let column = identity_minus_r.column(i).into_owned();
        *derivative = (k * omega[i] + skew(&omega.cross(&column))) * rotation / theta_sq;
    }
    derivatives
}

/// Projects an arbitrary 3x3 matrix onto the closest rotation in the Frobenius sense.
fn nearest_rotation(m: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let flipped = -u.column(2).into_owned();
        u.set_column(2, &flipped);
        r = u * v_t;
    }
    Some(Rotation3::from_matrix_unchecked(r))
}

/// An element of SE(3): a proper rotation followed by a translation.
///
/// The rotation is stored as a [`Rotation3`], so every value of this type decomposes into a
/// valid homogeneous transform by construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    /// Rotation part `R`.
    pub rotation: Rotation3<f64>,
    /// Translation part `t`.
    pub translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_parts(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Builds a transform from a translation and a rotation vector (axis times angle).
    pub fn from_rotation_vector(translation: Vector3<f64>, omega: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::new(omega),
            translation,
        }
    }

    /// Builds a transform from a translation and roll/pitch/yaw angles in radians.
    pub fn from_translation_rpy(
        translation: Vector3<f64>,
        roll: f64,
        pitch: f64,
        yaw: f64,
    ) -> Self {
        Self {
            rotation: Rotation3::from_euler_angles(roll, pitch, yaw),
            translation,
        }
    }

    /// Converts a 4x4 homogeneous matrix into a rigid transform.
    ///
    /// The matrix is rejected when any entry is non-finite, when its bottom row is not
    /// `[0 0 0 1]`, or when its rotation block has a non-positive determinant (reflection or
    /// singular block). Any other rotation block is replaced by the nearest rotation; a
    /// warning is logged when that changes the block noticeably.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidInput`] for the three rejection cases above.
    pub fn from_homogeneous(h: &Matrix4<f64>) -> Result<Self, RegistrationError> {
        if h.iter().any(|v| !v.is_finite()) {
            return Err(RegistrationError::InvalidInput(
                "homogeneous matrix must be finite".to_string(),
            ));
        }

        let bottom_ok = (0..3).all(|c| h[(3, c)].abs() <= HOMOGENEOUS_ROW_TOLERANCE)
            && (h[(3, 3)] - 1.0).abs() <= HOMOGENEOUS_ROW_TOLERANCE;
        if !bottom_ok {
            return Err(RegistrationError::InvalidInput(
                "homogeneous matrix bottom row must be [0 0 0 1]".to_string(),
            ));
        }

        let block: Matrix3<f64> = h.fixed_view::<3, 3>(0, 0).into_owned();
        if block.determinant() <= 0.0 {
            return Err(RegistrationError::InvalidInput(
                "rotation block must have a positive determinant".to_string(),
            ));
        }

        let rotation = nearest_rotation(&block).ok_or_else(|| {
            RegistrationError::InvalidInput("failed to decompose rotation block".to_string())
        })?;
        let deviation = (rotation.matrix() - block).norm();
        if deviation > 1e-9 {
            warn!(
                "Initial guess rotation block is not orthonormal (deviation {deviation:.3e}), \
                 re-orthonormalized"
            );
        }

        Ok(Self {
            rotation,
            translation: h.fixed_view::<3, 1>(0, 3).into_owned(),
        })
    }

    /// Returns the 4x4 homogeneous matrix `[R t; 0 1]`.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut h = Matrix4::identity();
        h.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.matrix());
        h.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        h
    }

    /// Rotation vector of the rotation part, with norm in `[0, pi]`.
    pub fn rotation_vector(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn transform_point(&self, point: &Point3D) -> Point3D {
        self.rotation * point + self.translation
    }

    /// Geodesic angle (radians) between the rotation parts of two transforms, in `[0, pi]`.
    ///
    /// Computed as `atan2(|vee(A)|, (tr(R) - 1) / 2)` with `R = R1^T R2` and `A` its
    /// antisymmetric part, which stays finite when rounding pushes `tr(R)` past 3.
    pub fn rotation_angle_to(&self, other: &RigidTransform) -> f64 {
        let relative = self.rotation.matrix().transpose() * other.rotation.matrix();
        let sin_axis = Vector3::new(
            relative[(2, 1)] - relative[(1, 2)],
            relative[(0, 2)] - relative[(2, 0)],
            relative[(1, 0)] - relative[(0, 1)],
        ) * 0.5;
        let cos = (relative.trace() - 1.0) * 0.5;
        sin_axis.norm().atan2(cos)
    }
}

/// Scaling applied in the target frame after the rigid transform: `S * (R p + t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleFactor {
    /// The same factor on all three axes.
    Uniform(f64),
    /// Independent factors, i.e. `S = diag(s1, s2, s3)`.
    PerAxis(Vector3<f64>),
}

impl Default for ScaleFactor {
    fn default() -> Self {
        ScaleFactor::Uniform(1.0)
    }
}

impl ScaleFactor {
    pub fn apply(&self, point: &Point3D) -> Point3D {
        match self {
            ScaleFactor::Uniform(s) => point * *s,
            ScaleFactor::PerAxis(s) => point.component_mul(s),
        }
    }

    /// The diagonal of the scaling matrix.
    pub fn components(&self) -> Vector3<f64> {
        match self {
            ScaleFactor::Uniform(s) => Vector3::repeat(*s),
            ScaleFactor::PerAxis(s) => *s,
        }
    }

    /// Every component finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.components().iter().all(|s| s.is_finite() && *s > 0.0)
    }
}
