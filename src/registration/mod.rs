//! The `registration` module estimates the transform between two reference frames.
//!
//! A [`RegistrationSession`] bundles the correspondence database with the bounds and seeds
//! used to solve it. [`RegistrationSolver`] turns a session into a bounded least-squares
//! problem, hands it to a [`BoundedOptimizer`] and reports the transform, the optional scale
//! and the residual error.
//!
//! Three variants are available, differing only in which parameters are free:
//!
//! * [`RegistrationSolver::register_rigid`]: `target ~ R * source + t`
//! * [`RegistrationSolver::register_scaled`]: `target ~ s * (R * source + t)`
//! * [`RegistrationSolver::register_anisotropic`]: `target ~ diag(s1, s2, s3) * (R * source + t)`
//!
//! Solves borrow the session immutably for their whole duration, so the store and bounds
//! cannot be modified while a solve runs. Independent sessions share nothing and can be
//! solved from different threads.

mod objective;

use crate::bounds::{ParameterBounds, ParameterLayout};
use crate::correspondence::{
    check_observability, similarity_estimate, CorrespondencePair, PointPairStore,
};
use crate::error::RegistrationError;
use crate::geometry::{RigidTransform, ScaleFactor};
use crate::metric::{ErrorMetric, ResidualStats};
use crate::optimization::{
    BoundedOptimizer, BoundedProblem, LevenbergMarquardtEngine, SolverOptions,
};
use log::{debug, info};
use nalgebra::{DVector, Vector3};
use objective::RegistrationObjective;

/// Correspondences and parameter configuration of one registration task.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSession {
    pub store: PointPairStore,
    pub bounds: ParameterBounds,
}

impl RegistrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parts(store: PointPairStore, bounds: ParameterBounds) -> Self {
        Self { store, bounds }
    }
}

/// Outcome of a successful solve.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    pub transform: RigidTransform,
    /// Estimated scale; `None` for rigid solves.
    pub scale: Option<ScaleFactor>,
    /// Mean squared residual at the solution.
    pub error: f64,
    pub statistics: ResidualStats,
    /// Engine runs used, restarts included.
    pub runs: usize,
}

/// Drives a [`BoundedOptimizer`] over the registration objective.
#[derive(Debug, Clone)]
pub struct RegistrationSolver<E: BoundedOptimizer = LevenbergMarquardtEngine> {
    engine: E,
}

impl RegistrationSolver<LevenbergMarquardtEngine> {
    pub fn new(options: SolverOptions) -> Self {
        Self::with_engine(LevenbergMarquardtEngine::new(options))
    }
}

impl Default for RegistrationSolver<LevenbergMarquardtEngine> {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

impl<E: BoundedOptimizer> RegistrationSolver<E> {
    pub fn with_engine(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Estimates the rigid transform `H` such that `target ~ H * source`.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidInput`] if the bounds or seeds are inconsistent.
    /// * [`RegistrationError::InsufficientData`] with fewer than 3 pairs or collinear points.
    /// * [`RegistrationError::Convergence`] if the engine does not converge.
    ///
    /// The session is never modified, whatever the outcome.
    pub fn register_rigid(
        &self,
        session: &RegistrationSession,
    ) -> Result<RegistrationResult, RegistrationError> {
        self.solve(session, ParameterLayout::Rigid)
    }

    /// Estimates `H` and a uniform scale `s` such that `target ~ s * H * source`.
    ///
    /// Fails under the same conditions as [`RegistrationSolver::register_rigid`].
    pub fn register_scaled(
        &self,
        session: &RegistrationSession,
    ) -> Result<RegistrationResult, RegistrationError> {
        self.solve(session, ParameterLayout::UniformScale)
    }

    /// Estimates `H` and per-axis scales `S = diag(s1, s2, s3)` such that
    /// `target ~ S * H * source`.
    ///
    /// Fails under the same conditions as [`RegistrationSolver::register_rigid`].
    pub fn register_anisotropic(
        &self,
        session: &RegistrationSession,
    ) -> Result<RegistrationResult, RegistrationError> {
        self.solve(session, ParameterLayout::AnisotropicScale)
    }

    fn solve(
        &self,
        session: &RegistrationSession,
        layout: ParameterLayout,
    ) -> Result<RegistrationResult, RegistrationError> {
        session.bounds.validate()?;
        check_observability(session.store.pairs())?;

        let seed = starting_point(
            session.store.pairs(),
            &session.bounds,
            layout,
            session.bounds.feasible_seed(layout),
        );
        let objective = RegistrationObjective::new(layout, session.store.pairs());
        let problem = BoundedProblem::new(objective, seed).with_bounds(
            session.bounds.lower(layout),
            session.bounds.upper(layout),
        )?;

        info!(
            "Starting {:?} registration with {} point pairs",
            layout,
            session.store.len()
        );
        let outcome = self.engine.minimize(&problem)?;
        if !outcome.converged {
            return Err(RegistrationError::Convergence(format!(
                "{:?} registration did not converge after {} run(s): \
                 projected gradient norm {:.3e}, cost {:.6e}",
                layout, outcome.runs, outcome.projected_gradient_norm, outcome.cost
            )));
        }

        let (transform, scale) = layout.decode(&outcome.params);
        let metric = ErrorMetric::new(&session.store);
        let error = metric.evaluate(&transform, &scale)?;
        let statistics = metric.statistics(&transform, &scale)?;
        info!(
            "{:?} registration finished: error {:.6e}, {:?}",
            layout, error, statistics
        );

        Ok(RegistrationResult {
            transform,
            scale: (layout != ParameterLayout::Rigid).then_some(scale),
            error,
            statistics,
            runs: outcome.runs,
        })
    }
}

/// Chooses where the engine starts: the clamped stored seed or the clamped closed-form
/// similarity estimate, whichever has the lower mean squared error.
fn starting_point(
    pairs: &[CorrespondencePair],
    bounds: &ParameterBounds,
    layout: ParameterLayout,
    seed: DVector<f64>,
) -> DVector<f64> {
    let Some((transform, scale)) = similarity_estimate(pairs, layout != ParameterLayout::Rigid)
    else {
        return seed;
    };
    let scale = match layout {
        ParameterLayout::AnisotropicScale => ScaleFactor::PerAxis(Vector3::repeat(scale)),
        _ => ScaleFactor::Uniform(scale),
    };
    let (lower, upper) = (bounds.lower(layout), bounds.upper(layout));
    let estimate = layout.encode(&transform, &scale);
    let estimate =
        DVector::from_fn(estimate.len(), |i, _| estimate[i].clamp(lower[i], upper[i]));

    let metric = ErrorMetric::from_pairs(pairs);
    let error_at = |params: &DVector<f64>| {
        let (transform, scale) = layout.decode(params);
        metric.mean_squared(&transform, &scale)
    };
    let (seed_error, estimate_error) = (error_at(&seed), error_at(&estimate));
    if estimate_error < seed_error {
        debug!(
            "Starting from the closed-form estimate (error {estimate_error:.6e}) \
             instead of the stored seed (error {seed_error:.6e})"
        );
        estimate
    } else {
        seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point3D;
    use crate::optimization::{LeastSquaresObjective, OptimizationOutcome};
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector6};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn random_points(rng: &mut StdRng, count: usize) -> Vec<Point3D> {
        (0..count)
            .map(|_| {
                Vector3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                )
            })
            .collect()
    }

    /// Box-Muller sample of a zero-mean normal variable.
    fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
        let u1: f64 = 1.0 - rng.random::<f64>();
        let u2: f64 = rng.random();
        sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn session_from(
        sources: &[Point3D],
        transform: &RigidTransform,
        scale: &ScaleFactor,
    ) -> RegistrationSession {
        let mut session = RegistrationSession::new();
        for source in sources {
            session
                .store
                .add(*source, scale.apply(&transform.transform_point(source)))
                .unwrap();
        }
        session
    }

    fn ground_truth() -> RigidTransform {
        RigidTransform::from_rotation_vector(
            Vector3::new(0.5, -0.3, 0.2),
            Vector3::new(0.3, -0.2, 0.4),
        )
    }

    fn assert_transform_close(actual: &RigidTransform, expected: &RigidTransform, tol: f64) {
        assert!(actual.rotation_angle_to(expected) < tol);
        assert!((actual.translation - expected.translation).norm() < tol);
    }

    #[test]
    fn test_rigid_round_trip() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(7);
        let truth = ground_truth();
        let session =
            session_from(&random_points(&mut rng, 8), &truth, &ScaleFactor::Uniform(1.0));

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_rigid(&session)
            .unwrap();

        assert_transform_close(&result.transform, &truth, 1e-3);
        assert!(result.scale.is_none());
        assert!(result.error < 1e-8);
        assert!(result.statistics.max < 1e-3);
    }

    #[test]
    fn test_scaled_round_trip() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(11);
        let truth = ground_truth();
        let session =
            session_from(&random_points(&mut rng, 8), &truth, &ScaleFactor::Uniform(1.5));

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_scaled(&session)
            .unwrap();

        assert_transform_close(&result.transform, &truth, 1e-3);
        match result.scale {
            Some(ScaleFactor::Uniform(s)) => assert_relative_eq!(s, 1.5, epsilon = 1e-3),
            other => panic!("expected a uniform scale, got {other:?}"),
        }
        assert!(result.error < 1e-8);
    }

    #[test]
    fn test_anisotropic_round_trip() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(13);
        let truth = ground_truth();
        let axis_scale = Vector3::new(1.2, 0.8, 1.5);
        let session = session_from(
            &random_points(&mut rng, 10),
            &truth,
            &ScaleFactor::PerAxis(axis_scale),
        );

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_anisotropic(&session)
            .unwrap();

        assert_transform_close(&result.transform, &truth, 1e-3);
        match result.scale {
            Some(ScaleFactor::PerAxis(s)) => assert!((s - axis_scale).norm() < 1e-3),
            other => panic!("expected per-axis scales, got {other:?}"),
        }
        assert!(result.error < 1e-8);
    }

    #[test]
    fn test_tetrahedron_with_noise() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(42);
        let translation = Vector3::new(1.0, 2.0, 3.0);

        let mut session = RegistrationSession::new();
        for source in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ] {
            let noise = Vector3::new(
                gaussian(&mut rng, 1e-4),
                gaussian(&mut rng, 1e-4),
                gaussian(&mut rng, 1e-4),
            );
            session.store.add(source, source + translation + noise).unwrap();
        }
        // the default translation box of +-1 does not contain (1, 2, 3)
        session
            .bounds
            .set_transform_bounds(
                &Vector6::new(-5.0, -5.0, -5.0, -PI, -PI, -PI),
                &Vector6::new(5.0, 5.0, 5.0, PI, PI, PI),
            )
            .unwrap();

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_rigid(&session)
            .unwrap();

        assert!((result.transform.translation - translation).norm() < 1e-2);
        assert!(result.transform.rotation.angle() < 1e-2);
        assert!(result.error < 1e-3);
    }

    #[test]
    fn test_insufficient_data() {
        init_logger();
        let solver = RegistrationSolver::new(SolverOptions::default());
        let mut session = RegistrationSession::new();

        for source in [Vector3::zeros(), Vector3::x(), Vector3::y()] {
            let result = solver.register_rigid(&session);
            assert!(matches!(result, Err(RegistrationError::InsufficientData(_))));
            session.store.add(source, source).unwrap();
        }
        assert!(solver.register_rigid(&session).is_ok());

        let mut collinear = RegistrationSession::new();
        for i in 0..5 {
            let p = Vector3::new(1.0, -1.0, 0.5) * (i as f64 * 0.2);
            collinear.store.add(p, p).unwrap();
        }
        assert!(matches!(
            solver.register_scaled(&collinear),
            Err(RegistrationError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_more_pairs_do_not_degrade() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(3);
        let truth = ground_truth();
        let sources = random_points(&mut rng, 12);
        let scale = ScaleFactor::Uniform(0.7);
        let solver = RegistrationSolver::new(SolverOptions::default());

        let few = solver
            .register_scaled(&session_from(&sources[..4], &truth, &scale))
            .unwrap();
        let many = solver
            .register_scaled(&session_from(&sources, &truth, &scale))
            .unwrap();

        assert!(many.error <= few.error.max(1e-10));
    }

    #[test]
    fn test_out_of_bounds_seed_is_clamped() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(5);
        let truth = ground_truth();
        let mut session =
            session_from(&random_points(&mut rng, 6), &truth, &ScaleFactor::Uniform(1.0));
        session.bounds.set_initial_transform(RigidTransform::from_rotation_vector(
            Vector3::new(4.0, 0.0, 0.0),
            Vector3::zeros(),
        ));
        let stored = session.bounds.clone();

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_rigid(&session)
            .unwrap();

        assert_transform_close(&result.transform, &truth, 1e-3);
        assert_eq!(session.bounds, stored);
    }

    #[test]
    fn test_deterministic_for_fixed_inputs() {
        let mut rng = StdRng::seed_from_u64(17);
        let session = session_from(
            &random_points(&mut rng, 6),
            &ground_truth(),
            &ScaleFactor::Uniform(1.1),
        );
        let solver = RegistrationSolver::new(SolverOptions::default());
        let first = solver.register_scaled(&session).unwrap();
        let second = solver.register_scaled(&session).unwrap();

        assert_relative_eq!(
            first.transform.to_homogeneous(),
            second.transform.to_homogeneous(),
            epsilon = 1e-12
        );
        assert_relative_eq!(first.error, second.error, epsilon = 1e-15);
    }

    #[test]
    fn test_non_convergence_is_reported() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(23);
        let truth = RigidTransform::from_rotation_vector(
            Vector3::new(0.2, 0.1, -0.1),
            Vector3::new(1.0, -0.8, 0.6),
        );
        let session = session_from(
            &random_points(&mut rng, 6),
            &truth,
            &ScaleFactor::PerAxis(Vector3::new(1.4, 0.7, 1.1)),
        );
        let store_before = session.store.get_all();
        let bounds_before = session.bounds.clone();

        let solver = RegistrationSolver::new(SolverOptions {
            max_iterations: 1,
            max_restarts: 0,
            gradient_tolerance: 1e-14,
            ..SolverOptions::default()
        });
        let result = solver.register_anisotropic(&session);

        assert!(matches!(result, Err(RegistrationError::Convergence(_))));
        assert_eq!(session.store.get_all(), store_before);
        assert_eq!(session.bounds, bounds_before);
    }

    #[test]
    fn test_invalid_bounds_are_reported_before_solving() {
        let mut session = RegistrationSession::new();
        for p in [Vector3::zeros(), Vector3::x(), Vector3::y(), Vector3::z()] {
            session.store.add(p, p).unwrap();
        }
        let result = session
            .bounds
            .set_transform_bounds(&Vector6::repeat(1.0), &Vector6::repeat(-1.0));
        assert!(result.is_err());
        // the rejected setter left the defaults in place, so the solve goes through
        assert!(RegistrationSolver::new(SolverOptions::default())
            .register_rigid(&session)
            .is_ok());
    }

    fn sweep_points() -> Vec<Point3D> {
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.6, -0.4, 0.3),
            Vector3::new(-0.5, 0.7, -0.2),
        ]
    }

    #[test]
    fn test_large_rotations_for_every_variant() {
        init_logger();
        let translation = Vector3::new(0.2, -0.3, 0.1);
        let mut axes = vec![Vector3::new(1.0, -2.0, 0.5).normalize()];
        axes.extend([
            Vector3::x(),
            Vector3::y(),
            Vector3::z(),
            Vector3::new(1.0, 1.0, 1.0).normalize(),
            Vector3::new(-0.3, 0.8, -0.5).normalize(),
        ]);
        let solver = RegistrationSolver::new(SolverOptions::default());

        for axis in &axes {
            for angle in [0.5, 1.0, 1.5, 2.0, 2.5, 2.8, 3.0] {
                let truth = RigidTransform::from_rotation_vector(translation, axis * angle);

                let rigid = session_from(&sweep_points(), &truth, &ScaleFactor::Uniform(1.0));
                let result = solver.register_rigid(&rigid).unwrap();
                assert_transform_close(&result.transform, &truth, 1e-3);

                let scaled = session_from(&sweep_points(), &truth, &ScaleFactor::Uniform(1.3));
                let result = solver.register_scaled(&scaled).unwrap();
                assert_transform_close(&result.transform, &truth, 1e-3);
                match result.scale {
                    Some(ScaleFactor::Uniform(s)) => assert_relative_eq!(s, 1.3, epsilon = 1e-3),
                    other => panic!("expected a uniform scale, got {other:?}"),
                }

                let result = solver.register_anisotropic(&scaled).unwrap();
                assert_transform_close(&result.transform, &truth, 1e-3);
                match result.scale {
                    Some(ScaleFactor::PerAxis(s)) => {
                        assert!((s - Vector3::repeat(1.3)).norm() < 1e-3)
                    }
                    other => panic!("expected per-axis scales, got {other:?}"),
                }
                assert!(result.error < 1e-8);
            }
        }
    }

    #[test]
    fn test_translation_optimum_on_bound() {
        init_logger();
        let truth = RigidTransform::from_rotation_vector(
            Vector3::new(1.5, 0.2, -0.3),
            Vector3::new(0.1, -0.2, 0.3),
        );
        let session = session_from(&sweep_points(), &truth, &ScaleFactor::Uniform(1.0));

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_rigid(&session)
            .unwrap();

        assert_relative_eq!(result.transform.translation.x, 1.0, epsilon = 1e-9);
        let clamped_truth = RigidTransform::from_parts(
            truth.rotation,
            Vector3::new(1.0, truth.translation.y, truth.translation.z),
        );
        let metric = ErrorMetric::new(&session.store);
        let at_clamped_truth = metric
            .evaluate(&clamped_truth, &ScaleFactor::Uniform(1.0))
            .unwrap();
        assert!(result.error <= at_clamped_truth + 1e-12);
    }

    #[test]
    fn test_scale_optimum_on_bound() {
        init_logger();
        let truth = ground_truth();
        let mut session = session_from(&sweep_points(), &truth, &ScaleFactor::Uniform(1.5));
        session.bounds.set_scale_bounds(0.5, 1.2).unwrap();

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_scaled(&session)
            .unwrap();

        match result.scale {
            Some(ScaleFactor::Uniform(s)) => assert_relative_eq!(s, 1.2, epsilon = 1e-9),
            other => panic!("expected a uniform scale, got {other:?}"),
        }
        let metric = ErrorMetric::new(&session.store);
        let at_clamped_truth = metric
            .evaluate(&truth, &ScaleFactor::Uniform(1.2))
            .unwrap();
        assert!(result.error <= at_clamped_truth + 1e-12);
    }

    #[test]
    fn test_custom_seed_and_far_scale() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(29);
        let truth = RigidTransform::from_rotation_vector(
            Vector3::new(-0.4, 0.6, 0.2),
            Vector3::new(-0.6, 0.8, 0.4),
        );
        let mut session =
            session_from(&random_points(&mut rng, 8), &truth, &ScaleFactor::Uniform(6.5));
        session.bounds.set_initial_transform(RigidTransform::from_rotation_vector(
            Vector3::new(0.5, 0.5, 0.5),
            Vector3::new(0.0, 0.0, -2.0),
        ));
        session.bounds.set_scale_initial_guess(0.3).unwrap();

        let result = RegistrationSolver::new(SolverOptions::default())
            .register_scaled(&session)
            .unwrap();

        assert_transform_close(&result.transform, &truth, 1e-3);
        match result.scale {
            Some(ScaleFactor::Uniform(s)) => assert_relative_eq!(s, 6.5, epsilon = 1e-3),
            other => panic!("expected a uniform scale, got {other:?}"),
        }
    }

    /// Engine that never reaches its stopping test.
    struct StalledEngine;

    impl BoundedOptimizer for StalledEngine {
        fn minimize<O: LeastSquaresObjective>(
            &self,
            problem: &BoundedProblem<O>,
        ) -> Result<OptimizationOutcome, RegistrationError> {
            Ok(OptimizationOutcome {
                params: problem.initial().clone(),
                cost: problem.objective().cost(problem.initial()),
                projected_gradient_norm: 1.0,
                runs: 1,
                converged: false,
            })
        }
    }

    #[test]
    fn test_custom_engine() {
        let mut session = RegistrationSession::new();
        for p in [Vector3::zeros(), Vector3::x(), Vector3::y(), Vector3::z()] {
            session.store.add(p, p + Vector3::new(0.1, 0.0, 0.0)).unwrap();
        }
        let solver = RegistrationSolver::with_engine(StalledEngine);
        assert!(matches!(
            solver.register_rigid(&session),
            Err(RegistrationError::Convergence(_))
        ));
        assert_eq!(session.store.len(), 4);
    }

    #[test]
    fn test_independent_sessions_on_threads() {
        init_logger();
        let sessions: Vec<(RegistrationSession, RigidTransform)> = (0..4u64)
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(100 + i);
                let truth = RigidTransform::from_rotation_vector(
                    Vector3::new(0.1 * i as f64, -0.2, 0.3),
                    Vector3::new(0.2, 0.1 * i as f64, -0.3),
                );
                let session =
                    session_from(&random_points(&mut rng, 8), &truth, &ScaleFactor::Uniform(1.0));
                (session, truth)
            })
            .collect();
        let solver = RegistrationSolver::new(SolverOptions::default());

        std::thread::scope(|scope| {
            let handles: Vec<_> = sessions
                .iter()
                .map(|(session, truth)| {
                    let solver = &solver;
                    scope.spawn(move || (solver.register_rigid(session), truth))
                })
                .collect();
            for handle in handles {
                let (result, truth) = handle.join().unwrap();
                assert_transform_close(&result.unwrap().transform, truth, 1e-3);
            }
        });
    }
}
