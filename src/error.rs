//! Error taxonomy shared by every module of the crate.
//!
//! The three solver-facing kinds mirror how a failed call should be handled by the caller:
//! [`RegistrationError::InvalidInput`] is raised synchronously by the call that received the bad
//! value, [`RegistrationError::InsufficientData`] and [`RegistrationError::Convergence`] are
//! reported by a solve. None of them leave the point database or the bounds modified.
//! The remaining variants belong to the file-based helpers in [`crate::config`] and
//! [`crate::util`].

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Optimization did not converge: {0}")]
    Convergence(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("Failed to process CSV: {0}")]
    CsvError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for RegistrationError {
    fn from(err: std::io::Error) -> Self {
        RegistrationError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for RegistrationError {
    fn from(err: yaml_rust::ScanError) -> Self {
        RegistrationError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for RegistrationError {
    fn from(err: csv::Error) -> Self {
        RegistrationError::CsvError(err.to_string())
    }
}

impl From<serde_json::Error> for RegistrationError {
    fn from(err: serde_json::Error) -> Self {
        RegistrationError::JsonError(err.to_string())
    }
}
