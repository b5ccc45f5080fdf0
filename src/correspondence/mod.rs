//! The correspondence database: matched 3D points observed in two reference frames.

use crate::error::RegistrationError;
use crate::geometry::{Point3D, RigidTransform};
use nalgebra::{Matrix3, Rotation3};

/// Relative threshold on the scatter eigenvalues below which a cloud counts as collinear.
const COLLINEARITY_TOLERANCE: f64 = 1e-10;

/// Two observations of the same physical location.
///
/// `target` is expected to correspond to `S * H * source`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrespondencePair {
    pub source: Point3D,
    pub target: Point3D,
}

/// Ordered, append-only collection of [`CorrespondencePair`]s.
///
/// Pairs are kept in insertion order so that retrieval is deterministic; the registration
/// objective itself does not depend on the order. Empty stores are legal but cannot be
/// solved.
#[derive(Debug, Clone, Default)]
pub struct PointPairStore {
    pairs: Vec<CorrespondencePair>,
}

impl PointPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pair of matching points.
    ///
    /// # Arguments
    ///
    /// * `source` - The free point, expressed in the frame being mapped.
    /// * `target` - The point corresponding to either `H * source` or `S * H * source`.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidInput`] if either point has a non-finite component. The
    ///   store is left unchanged.
    pub fn add(&mut self, source: Point3D, target: Point3D) -> Result<(), RegistrationError> {
        if !source.iter().chain(target.iter()).all(|v| v.is_finite()) {
            return Err(RegistrationError::InvalidInput(format!(
                "point pair must be finite, got source {:?} and target {:?}",
                source.as_slice(),
                target.as_slice()
            )));
        }
        self.pairs.push(CorrespondencePair { source, target });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Returns a copy of every stored pair, in insertion order.
    pub fn get_all(&self) -> Vec<CorrespondencePair> {
        self.pairs.clone()
    }

    /// Removes every pair. Calling it on an empty store is a no-op.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub(crate) fn pairs(&self) -> &[CorrespondencePair] {
        &self.pairs
    }
}

/// Returns `true` when the points span at least a plane.
///
/// The test looks at the eigenvalues of the centered scatter matrix: a collinear (or
/// coincident) cloud has its two smallest eigenvalues at zero.
pub fn spans_plane<'a, I>(points: I) -> bool
where
    I: IntoIterator<Item = &'a Point3D>,
{
    let points: Vec<&Point3D> = points.into_iter().collect();
    if points.len() < 3 {
        return false;
    }

    let centroid = points
        .iter()
        .fold(Point3D::zeros(), |acc, p| acc + *p)
        / points.len() as f64;
    let scatter = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = *p - centroid;
        acc + d * d.transpose()
    });

    let mut eigenvalues: Vec<f64> = scatter.symmetric_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));

    let largest = eigenvalues[0];
    largest > f64::EPSILON && eigenvalues[1] > COLLINEARITY_TOLERANCE * largest
}

/// Checks that a set of pairs can determine a unique rigid transform.
///
/// # Errors
///
/// * [`RegistrationError::InsufficientData`] with fewer than 3 pairs, or when the source or
///   the target points are collinear.
pub fn check_observability(pairs: &[CorrespondencePair]) -> Result<(), RegistrationError> {
    if pairs.len() < 3 {
        return Err(RegistrationError::InsufficientData(format!(
            "at least 3 point pairs are required, got {}",
            pairs.len()
        )));
    }
    if !spans_plane(pairs.iter().map(|p| &p.source)) {
        return Err(RegistrationError::InsufficientData(
            "source points are collinear".to_string(),
        ));
    }
    if !spans_plane(pairs.iter().map(|p| &p.target)) {
        return Err(RegistrationError::InsufficientData(
            "target points are collinear".to_string(),
        ));
    }
    Ok(())
}

/// Closed-form fit of `target ~ s * (R * source + t)` (Umeyama's method).
///
/// The rotation comes from the SVD of the cross-covariance of the centered clouds, with the
/// smallest singular direction flipped when the product would be a reflection. When
/// `with_scale` is false the scale is fixed to 1 and the result is the rigid least-squares
/// fit. Returns `None` with fewer than 3 pairs, a source cloud collapsed to a point or a
/// failed decomposition.
pub fn similarity_estimate(
    pairs: &[CorrespondencePair],
    with_scale: bool,
) -> Option<(RigidTransform, f64)> {
    if pairs.len() < 3 {
        return None;
    }
    let n = pairs.len() as f64;
    let source_centroid = pairs.iter().fold(Point3D::zeros(), |acc, p| acc + p.source) / n;
    let target_centroid = pairs.iter().fold(Point3D::zeros(), |acc, p| acc + p.target) / n;

    let mut covariance = Matrix3::zeros();
    let mut source_variance = 0.0;
    for pair in pairs {
        let p = pair.source - source_centroid;
        let q = pair.target - target_centroid;
        covariance += q * p.transpose();
        source_variance += p.norm_squared();
    }
    covariance /= n;
    source_variance /= n;
    if source_variance <= f64::EPSILON {
        return None;
    }

    let svd = covariance.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    let mut singular_values = svd.singular_values;
    if (u * v_t).determinant() < 0.0 {
        let smallest = singular_values.imin();
        let flipped = -u.column(smallest).into_owned();
        u.set_column(smallest, &flipped);
        singular_values[smallest] = -singular_values[smallest];
    }
    let rotation = Rotation3::from_matrix_unchecked(u * v_t);

    let scale = if with_scale {
        singular_values.sum() / source_variance
    } else {
        1.0
    };
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }
    let translation = target_centroid / scale - rotation * source_centroid;
    Some((RigidTransform::from_parts(rotation, translation), scale))
}
