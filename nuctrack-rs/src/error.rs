//! Error types for nuctrack.

use thiserror::Error;

/// Result type alias for nuctrack operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad user input detected before any processing starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or unsupported OME-Zarr metadata.
    #[error("invalid metadata at {path}: {message}")]
    Metadata { path: String, message: String },

    #[error("zarr error: {0}")]
    Zarr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("array layout error: {0}")]
    Array(#[from] ndarray::ShapeError),

    #[error("segmentation failed: {0}")]
    Segmentation(String),

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Cost matrix entry the solver cannot order (NaN or negative infinity).
    #[error("invalid cost: {0}")]
    InvalidCost(String),

    #[error("identity counter exhausted")]
    IdentityOverflow,

    /// Threshold requested on data with no spread.
    #[error("degenerate distribution: {0}")]
    DegenerateDistribution(String),

    #[error("{} position(s) failed: {}", .0.len(), .0.join(", "))]
    PositionsFailed(Vec<String>),
}

impl Error {
    pub(crate) fn zarr(err: impl std::fmt::Display) -> Self {
        Error::Zarr(err.to_string())
    }

    pub(crate) fn metadata(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Metadata {
            path: path.into(),
            message: message.into(),
        }
    }
}
