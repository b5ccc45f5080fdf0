//! I/O helpers around the registration core: correspondence files, result reports and
//! synthetic data.

use crate::correspondence::PointPairStore;
use crate::error::RegistrationError;
use crate::geometry::{Point3D, RigidTransform, ScaleFactor};
use crate::metric::ResidualStats;
use crate::registration::RegistrationResult;
use nalgebra::Vector3;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Creates the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &str) -> Result<(), RegistrationError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                RegistrationError::IOError(format!("Failed to create output directory: {e}"))
            })?;
        }
    }
    Ok(())
}

/// Loads point pairs from a CSV file.
///
/// Each row holds `sx,sy,sz,tx,ty,tz`: the source point followed by the target point. Lines
/// starting with `#` are comments and fields may be padded with whitespace.
///
/// # Errors
///
/// * [`RegistrationError::CsvError`] if the file cannot be read, a row does not have six
///   fields or a field is not a number.
/// * [`RegistrationError::InvalidInput`] if a row has a non-finite coordinate.
pub fn load_point_pairs_csv(path: &str) -> Result<PointPairStore, RegistrationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut store = PointPairStore::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != 6 {
            return Err(RegistrationError::CsvError(format!(
                "row {}: expected 6 values (sx,sy,sz,tx,ty,tz), got {}",
                row + 1,
                record.len()
            )));
        }
        let mut values = [0.0; 6];
        for (i, field) in record.iter().enumerate() {
            values[i] = field.parse::<f64>().map_err(|e| {
                RegistrationError::CsvError(format!(
                    "row {}: `{field}` is not a number: {e}",
                    row + 1
                ))
            })?;
        }
        store.add(
            Vector3::new(values[0], values[1], values[2]),
            Vector3::new(values[3], values[4], values[5]),
        )?;
    }
    Ok(store)
}

/// Writes every pair of `store` as a CSV row readable by [`load_point_pairs_csv`].
pub fn export_point_pairs_csv(store: &PointPairStore, path: &str) -> Result<(), RegistrationError> {
    ensure_parent_dir(path)?;
    let mut file = File::create(path)?;
    writeln!(file, "# Point correspondences")?;
    writeln!(file, "# Format: sx,sy,sz,tx,ty,tz")?;
    writeln!(file, "# Total pairs: {}", store.len())?;

    let mut writer = csv::Writer::from_writer(file);
    for pair in store.get_all() {
        writer.write_record(
            pair.source
                .iter()
                .chain(pair.target.iter())
                .map(|v| v.to_string()),
        )?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct RegistrationReport<'a> {
    /// Row-major homogeneous matrix.
    transform: [[f64; 4]; 4],
    translation: [f64; 3],
    rotation_vector: [f64; 3],
    scale: Option<Vec<f64>>,
    error: f64,
    statistics: &'a ResidualStats,
    runs: usize,
}

/// Writes `result` as a JSON report.
pub fn export_registration_result(
    result: &RegistrationResult,
    path: &str,
) -> Result<(), RegistrationError> {
    let h = result.transform.to_homogeneous();
    let omega = result.transform.rotation_vector();
    let report = RegistrationReport {
        transform: std::array::from_fn(|r| std::array::from_fn(|c| h[(r, c)])),
        translation: [
            result.transform.translation[0],
            result.transform.translation[1],
            result.transform.translation[2],
        ],
        rotation_vector: [omega[0], omega[1], omega[2]],
        scale: result.scale.as_ref().map(|scale| match scale {
            ScaleFactor::Uniform(s) => vec![*s],
            ScaleFactor::PerAxis(s) => s.iter().copied().collect(),
        }),
        error: result.error,
        statistics: &result.statistics,
        runs: result.runs,
    };

    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(&report)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Builds a store whose targets are `scale * transform * source` for every source point.
///
/// # Errors
///
/// * [`RegistrationError::InvalidInput`] if the scale is not strictly positive or a point is
///   not finite.
pub fn generate_correspondences(
    sources: &[Point3D],
    transform: &RigidTransform,
    scale: &ScaleFactor,
) -> Result<PointPairStore, RegistrationError> {
    if !scale.is_valid() {
        return Err(RegistrationError::InvalidInput(format!(
            "scale factor must be strictly positive, got {:?}",
            scale.components().as_slice()
        )));
    }
    let mut store = PointPairStore::new();
    for source in sources {
        store.add(*source, scale.apply(&transform.transform_point(source)))?;
    }
    Ok(store)
}

/// Prints a human-readable summary of a registration result.
pub fn display_registration_result(result: &RegistrationResult) {
    let t = &result.transform.translation;
    let (roll, pitch, yaw) = result.transform.rotation.euler_angles();
    println!("\n📐 Registration Result:");
    println!("  Translation:  [{:.6}, {:.6}, {:.6}]", t[0], t[1], t[2]);
    println!(
        "  Rotation:     roll {:.6}, pitch {:.6}, yaw {:.6} (rad)",
        roll, pitch, yaw
    );
    match &result.scale {
        Some(ScaleFactor::Uniform(s)) => println!("  Scale:        {s:.6}"),
        Some(ScaleFactor::PerAxis(s)) => {
            println!("  Scale:        [{:.6}, {:.6}, {:.6}]", s[0], s[1], s[2])
        }
        None => {}
    }
    println!("  Mean squared error: {:.6e}", result.error);
    println!("  {:?}", result.statistics);
    println!("  Engine runs: {}", result.runs);
}
