//! Error module for the unit merge library.
use std::error::Error;
use std::fmt;

/// Error types for the library.
#[derive(Debug, PartialEq)]
pub enum MergeError {
    /// Error for a stage name which is not part of the recognized set.
    UnknownStage(String),
    /// Error for an unsupported template similarity metric.
    UnsupportedMetric(String),
    /// Error for an unknown preset name.
    UnknownPreset(String),
    /// Error for a required analyzer extension which is absent and has no fallback.
    MissingExtension(String),
    /// Error for invalid parameters, e.g., a non-positive bin size.
    InvalidParameter(String),
    /// Error for inconsistent input data, e.g., a template with the wrong number of channels.
    IncompatibleData(String),
    /// Error for I/O operations.
    IOError(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MergeError::UnknownStage(e) => write!(f, "{} is not a valid step", e),
            MergeError::UnsupportedMetric(e) => write!(f, "Not a valid template metric: {}", e),
            MergeError::UnknownPreset(e) => write!(f, "Unknown preset: {}", e),
            MergeError::MissingExtension(e) => write!(f, "Missing analyzer extension: {}", e),
            MergeError::InvalidParameter(e) => write!(f, "Invalid parameters: {}", e),
            MergeError::IncompatibleData(e) => write!(f, "Incompatible data: {}", e),
            MergeError::IOError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for MergeError {}
