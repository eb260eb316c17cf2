//! Key Checker - Bulk Bearer Key Validation
//!
//! Validates large batches of bearer keys against a configurable HTTP
//! endpoint at bounded concurrency, with resumable progress checkpoints.

pub mod checker;
pub mod config;
pub mod database;
pub mod tui;

pub use checker::*;
pub use config::AppConfig;
pub use database::{HistoryDatabase, HistoryRecord};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
