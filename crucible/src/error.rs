//! Error types for Crucible

use thiserror::Error;

/// Result type alias using Crucible's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Crucible operations.
///
/// Every variant is an input-contract violation detected before or during
/// address resolution. Kernels never write partial output: a call either
/// completes or returns one of these without touching `out`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Index out of range: {index} >= {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid offset table: {0}")]
    InvalidOffsetTable(String),

    #[error("Empty KV range for sequence {seq}")]
    EmptyRange { seq: usize },

    #[error("{0}")]
    Other(String),
}
