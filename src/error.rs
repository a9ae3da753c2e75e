//! Typed errors at the loader and vector-engine boundaries.
//!
//! The application layer works in `anyhow::Result`; these enums exist where a
//! caller needs to branch on the failure kind.

use thiserror::Error;

/// Failure to turn a file into text pages.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported file type: '{0}'")]
    Unsupported(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {kind} document: {message}")]
    Parse { kind: &'static str, message: String },
}

/// Failure reported by a [`crate::vector::VectorEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine cannot perform this operation (e.g. filtered delete);
    /// callers fall back to a slower path.
    #[error("operation not supported by this vector engine: {0}")]
    Unsupported(&'static str),
    #[error("vector engine storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}
