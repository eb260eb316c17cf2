//! Checker module for validating bearer keys in bulk
//!
//! This module provides functionality for:
//! - Extracting candidate keys from raw text
//! - Probing each key against a configurable HTTP endpoint
//! - Running large batches at bounded concurrency with cooperative stop
//! - Checkpointing progress so an interrupted run can resume
//! - Exporting results in text and JSON form

pub mod checkpoint;
pub mod error;
pub mod export;
pub mod limiter;
pub mod models;
pub mod parser;
pub mod probe;
pub mod runner;

pub use checkpoint::{new_session_id, CheckpointStore, ProgressSnapshot};
pub use error::CheckError;
pub use export::{ExportFormat, ResultExporter};
pub use limiter::{ConcurrencyLimiter, SlotPermit, MAX_CONCURRENCY};
pub use models::{KeyResult, KeyStatus, ProgressEvent, RunResults, RunStats};
pub use parser::{KeyParser, KeyRule};
pub use probe::{classify_status, parse_headers, HttpMethod, HttpProbe, Probe, RequestConfig};
pub use runner::{BatchRunner, RunnerOptions, StopHandle};
