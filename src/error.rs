//! Error types for the capture / landmark pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// Camera could not be opened, configured or started. Fatal for the camera instance.
    #[error("camera device error: {0}")]
    Device(String),

    /// Landmark or fitting model files missing or corrupt. Fatal at construction.
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// A hardware frame could not be turned into pixels
    #[error("frame decode error: {0}")]
    Decode(String),

    /// The landmark detector failed on a frame. Recoverable.
    #[error("detector failure: {0}")]
    Detection(String),

    /// Marker pose could not be recovered from the detected corners
    #[error("marker pose error: {0}")]
    Pose(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("display error: {0}")]
    Display(String),

    /// Invalid input parameters provided
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
