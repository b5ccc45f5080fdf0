//! YAML configuration of bounds, initial guesses and engine options.
//!
//! ```yaml
//! bounds:
//!   translation_min: [-1.0, -1.0, -1.0]
//!   translation_max: [1.0, 1.0, 1.0]
//!   rotation_min: [-3.14159, -3.14159, -3.14159]
//!   rotation_max: [3.14159, 3.14159, 3.14159]
//!   scale_min: 0.1
//!   scale_max: 10.0
//!   axis_scale_min: [0.1, 0.1, 0.1]
//!   axis_scale_max: [10.0, 10.0, 10.0]
//! initial_guess:
//!   translation: [0.0, 0.0, 0.0]
//!   rotation: [0.0, 0.0, 0.0]
//!   scale: 1.0
//!   axis_scale: [1.0, 1.0, 1.0]
//! solver:
//!   max_iterations: 300
//!   gradient_tolerance: 1.0e-6
//!   max_restarts: 10
//! ```
//!
//! Every section and key is optional. Loaded values go through the validating setters of
//! [`ParameterBounds`], so a file cannot produce a configuration the API would reject.

use crate::bounds::ParameterBounds;
use crate::correspondence::PointPairStore;
use crate::error::RegistrationError;
use crate::geometry::RigidTransform;
use crate::optimization::SolverOptions;
use crate::registration::{RegistrationSession, RegistrationSolver};
use nalgebra::{Vector3, Vector6};
use serde::Serialize;
use std::fs;
use std::io::Write;
use yaml_rust::{Yaml, YamlLoader};

/// Bounds, seeds and engine options of a registration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationConfig {
    pub bounds: ParameterBounds,
    pub solver: SolverOptions,
}

#[derive(Serialize)]
struct BoundsSection {
    translation_min: [f64; 3],
    translation_max: [f64; 3],
    rotation_min: [f64; 3],
    rotation_max: [f64; 3],
    scale_min: f64,
    scale_max: f64,
    axis_scale_min: [f64; 3],
    axis_scale_max: [f64; 3],
}

#[derive(Serialize)]
struct InitialGuessSection {
    translation: [f64; 3],
    rotation: [f64; 3],
    scale: f64,
    axis_scale: [f64; 3],
}

#[derive(Serialize)]
struct ConfigDocument<'a> {
    bounds: BoundsSection,
    initial_guess: InitialGuessSection,
    solver: &'a SolverOptions,
}

fn yaml_error(message: String) -> RegistrationError {
    RegistrationError::YamlError(message)
}

/// yaml-rust keeps integers and reals apart; both are accepted where a number is expected.
fn as_number(value: &Yaml) -> Option<f64> {
    match value {
        Yaml::Real(_) => value.as_f64(),
        Yaml::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

fn read_number(section: &Yaml, key: &str) -> Result<Option<f64>, RegistrationError> {
    match &section[key] {
        Yaml::BadValue => Ok(None),
        value => as_number(value)
            .map(Some)
            .ok_or_else(|| yaml_error(format!("`{key}` must be a number"))),
    }
}

fn read_usize(section: &Yaml, key: &str) -> Result<Option<usize>, RegistrationError> {
    match &section[key] {
        Yaml::BadValue => Ok(None),
        value => value
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| yaml_error(format!("`{key}` must be a non-negative integer"))),
    }
}

fn read_vector3(section: &Yaml, key: &str) -> Result<Option<Vector3<f64>>, RegistrationError> {
    match &section[key] {
        Yaml::BadValue => Ok(None),
        value => {
            let items = value
                .as_vec()
                .ok_or_else(|| yaml_error(format!("`{key}` must be a list of 3 numbers")))?;
            if items.len() != 3 {
                return Err(yaml_error(format!(
                    "`{key}` must have 3 elements, got {}",
                    items.len()
                )));
            }
            let mut out = Vector3::zeros();
            for (i, item) in items.iter().enumerate() {
                out[i] = as_number(item)
                    .ok_or_else(|| yaml_error(format!("`{key}[{i}]` must be a number")))?;
            }
            Ok(Some(out))
        }
    }
}

fn stack6(head: &Vector3<f64>, tail: &Vector3<f64>) -> Vector6<f64> {
    Vector6::new(head[0], head[1], head[2], tail[0], tail[1], tail[2])
}

impl RegistrationConfig {
    /// Loads a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::IOError`] if the file cannot be read.
    /// * [`RegistrationError::YamlError`] if it is malformed or holds values of the wrong type.
    /// * [`RegistrationError::InvalidInput`] if a value is rejected by a bounds setter.
    pub fn load_from_yaml(path: &str) -> Result<Self, RegistrationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, RegistrationError> {
        let docs = YamlLoader::load_from_str(contents)?;
        let mut config = Self::default();
        let Some(doc) = docs.first() else {
            return Ok(config);
        };

        config.apply_bounds(&doc["bounds"])?;
        config.apply_initial_guess(&doc["initial_guess"])?;
        config.apply_solver(&doc["solver"])?;
        config.solver.validate()?;
        Ok(config)
    }

    fn apply_bounds(&mut self, section: &Yaml) -> Result<(), RegistrationError> {
        let (mut min, mut max) = self.bounds.transform_bounds();
        let head = |v: &Vector6<f64>| Vector3::new(v[0], v[1], v[2]);
        let tail = |v: &Vector6<f64>| Vector3::new(v[3], v[4], v[5]);

        let translation_min = read_vector3(section, "translation_min")?.unwrap_or(head(&min));
        let translation_max = read_vector3(section, "translation_max")?.unwrap_or(head(&max));
        let rotation_min = read_vector3(section, "rotation_min")?.unwrap_or(tail(&min));
        let rotation_max = read_vector3(section, "rotation_max")?.unwrap_or(tail(&max));
        min = stack6(&translation_min, &rotation_min);
        max = stack6(&translation_max, &rotation_max);
        self.bounds.set_transform_bounds(&min, &max)?;

        let (scale_min, scale_max) = self.bounds.scale_bounds();
        self.bounds.set_scale_bounds(
            read_number(section, "scale_min")?.unwrap_or(scale_min),
            read_number(section, "scale_max")?.unwrap_or(scale_max),
        )?;

        let (axis_min, axis_max) = self.bounds.axis_scale_bounds();
        self.bounds.set_axis_scale_bounds(
            &read_vector3(section, "axis_scale_min")?.unwrap_or(axis_min),
            &read_vector3(section, "axis_scale_max")?.unwrap_or(axis_max),
        )
    }

    fn apply_initial_guess(&mut self, section: &Yaml) -> Result<(), RegistrationError> {
        let translation = read_vector3(section, "translation")?;
        let rotation = read_vector3(section, "rotation")?;
        if translation.is_some() || rotation.is_some() {
            let current = self.bounds.initial_transform();
            let transform = RigidTransform::from_rotation_vector(
                translation.unwrap_or(current.translation),
                rotation.unwrap_or_else(|| current.rotation_vector()),
            );
            self.bounds.set_initial_transform(transform);
        }

        if let Some(scale) = read_number(section, "scale")? {
            self.bounds.set_scale_initial_guess(scale)?;
        }
        if let Some(axis_scale) = read_vector3(section, "axis_scale")? {
            self.bounds.set_axis_scale_initial_guess(&axis_scale)?;
        }
        Ok(())
    }

    fn apply_solver(&mut self, section: &Yaml) -> Result<(), RegistrationError> {
        let solver = &mut self.solver;
        if let Some(v) = read_usize(section, "max_iterations")? {
            solver.max_iterations = v;
        }
        if let Some(v) = read_number(section, "min_abs_error_decrease")? {
            solver.min_abs_error_decrease = v;
        }
        if let Some(v) = read_number(section, "min_rel_error_decrease")? {
            solver.min_rel_error_decrease = v;
        }
        if let Some(v) = read_number(section, "min_error")? {
            solver.min_error = v;
        }
        if let Some(v) = read_number(section, "gradient_tolerance")? {
            solver.gradient_tolerance = v;
        }
        if let Some(v) = read_usize(section, "max_restarts")? {
            solver.max_restarts = v;
        }
        if let Some(v) = read_usize(section, "verbosity")? {
            solver.verbosity = v;
        }
        Ok(())
    }

    /// Writes the configuration as YAML, every key included.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), RegistrationError> {
        let yaml_string = self.to_yaml_string()?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String, RegistrationError> {
        let (min, max) = self.bounds.transform_bounds();
        let (scale_min, scale_max) = self.bounds.scale_bounds();
        let (axis_min, axis_max) = self.bounds.axis_scale_bounds();
        let initial = self.bounds.initial_transform();
        let array = |v: Vector3<f64>| [v[0], v[1], v[2]];

        let doc = ConfigDocument {
            bounds: BoundsSection {
                translation_min: [min[0], min[1], min[2]],
                translation_max: [max[0], max[1], max[2]],
                rotation_min: [min[3], min[4], min[5]],
                rotation_max: [max[3], max[4], max[5]],
                scale_min,
                scale_max,
                axis_scale_min: array(axis_min),
                axis_scale_max: array(axis_max),
            },
            initial_guess: InitialGuessSection {
                translation: array(initial.translation),
                rotation: array(initial.rotation_vector()),
                scale: self.bounds.initial_scale(),
                axis_scale: array(self.bounds.initial_axis_scale()),
            },
            solver: &self.solver,
        };
        serde_yaml::to_string(&doc).map_err(|e| RegistrationError::YamlError(e.to_string()))
    }

    /// A session over `store` configured with these bounds.
    pub fn session(&self, store: PointPairStore) -> RegistrationSession {
        RegistrationSession::with_parts(store, self.bounds.clone())
    }

    /// A Levenberg-Marquardt solver configured with these engine options.
    pub fn build_solver(&self) -> RegistrationSolver {
        RegistrationSolver::new(self.solver.clone())
    }
}
