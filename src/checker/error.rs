//! Errors raised before a run starts or when a resume cannot begin.
//!
//! Failures of individual keys never show up here; they become
//! `KeyStatus::Error` outcomes.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("no keys to check")]
    EmptyBatch,

    #[error("concurrency must be between {min} and {max}, got {value}")]
    InvalidConcurrency { value: usize, min: usize, max: usize },

    #[error("timeout must be between {min} and {max} seconds, got {value}")]
    InvalidTimeout { value: u64, min: u64, max: u64 },

    #[error("invalid endpoint {0}: {1}")]
    InvalidEndpoint(String, String),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("cannot load checkpoint: {}", .0.display())]
    CheckpointLoad(PathBuf),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
