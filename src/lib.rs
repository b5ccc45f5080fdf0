//! Reference Calibration Library
//!
//! Estimates the transform between two reference frames from pairs of matched 3D points.
//! Given points `p_i` measured in a source frame and the same physical locations `q_i`
//! measured in a target frame, the library finds the rigid transform `H` (and, optionally,
//! a uniform scale `s` or per-axis scales `S`) minimizing
//!
//! `1/N * sum_i |q_i - S * H * p_i|^2`
//!
//! subject to box constraints on every parameter. The problem is solved as a bounded
//! nonlinear least-squares problem with the tiny-solver Levenberg-Marquardt optimizer.
//!
//! The main entry points are:
//! - [`PointPairStore`], the correspondence database
//! - [`ParameterBounds`], box constraints and initial guesses
//! - [`RegistrationSolver`], the rigid / scaled / anisotropic solves
//! - [`ErrorMetric`], residual evaluation of any candidate transform

pub mod bounds;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod geometry;
pub mod metric;
pub mod optimization;
pub mod registration;
pub mod util;

// Re-export commonly used types
pub use bounds::{ParameterBounds, ParameterLayout};
pub use config::RegistrationConfig;
pub use correspondence::{CorrespondencePair, PointPairStore};
pub use error::RegistrationError;
pub use geometry::{Point3D, RigidTransform, ScaleFactor};
pub use metric::{ErrorMetric, ResidualStats};

pub use optimization::{BoundedOptimizer, LevenbergMarquardtEngine, SolverOptions};
pub use registration::{RegistrationResult, RegistrationSession, RegistrationSolver};
