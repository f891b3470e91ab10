//! Error types for the cascade core
//!
//! Every fallible operation returns [`Result`], which wraps [`CascadeError`].
//! Empty collections (no ground truth, no surviving candidates) are valid
//! states and never surface as errors.

use crate::boxes::BBox;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Degenerate box {bbox:?}: {reason}")]
    DegenerateBox { bbox: BBox, reason: &'static str },

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Length mismatch in {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stage {stage} head failed: {message}")]
    Head { stage: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cascade operations
pub type Result<T> = std::result::Result<T, CascadeError>;
