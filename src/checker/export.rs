//! Result export in the formats the front ends save to disk

use crate::checker::models::{KeyResult, KeyStatus, RunResults};
use crate::Result;
use chrono::SecondsFormat;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Export layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One valid key per line
    Valid,
    /// Invalid keys annotated with `# message`
    Invalid,
    /// Every outcome as `<icon> key - message`
    All,
    /// JSON array of every outcome
    Json,
}

#[derive(Serialize)]
struct ExportRecord<'a> {
    key: &'a str,
    status: KeyStatus,
    message: &'a str,
    response_time_ms: u64,
    checked_at: String,
}

impl<'a> From<&'a KeyResult> for ExportRecord<'a> {
    fn from(result: &'a KeyResult) -> Self {
        Self {
            key: &result.key,
            status: result.status,
            message: &result.message,
            response_time_ms: result.response_time_ms.unwrap_or(0),
            checked_at: result.checked_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

pub struct ResultExporter;

impl ResultExporter {
    /// Render `results` in `format`, returning the text and the number of
    /// outcomes it contains
    pub fn render(results: &RunResults, format: ExportFormat) -> Result<(String, usize)> {
        let mut out = String::new();
        let count = match format {
            ExportFormat::Valid => {
                for result in &results.valid_keys {
                    writeln!(out, "{}", result.key)?;
                }
                results.valid_keys.len()
            }
            ExportFormat::Invalid => {
                for result in &results.invalid_keys {
                    writeln!(out, "{} # {}", result.key, result.message)?;
                }
                results.invalid_keys.len()
            }
            ExportFormat::All => {
                for result in results.all() {
                    writeln!(out, "{} {} - {}", result.status.icon(), result.key, result.message)?;
                }
                results.len()
            }
            ExportFormat::Json => {
                let records: Vec<ExportRecord> = results.all().map(ExportRecord::from).collect();
                out = serde_json::to_string_pretty(&records)?;
                records.len()
            }
        };
        Ok((out, count))
    }

    /// Write `results` to `path` in `format`; returns how many outcomes were written
    pub fn save_to_file<P: AsRef<Path>>(
        results: &RunResults,
        format: ExportFormat,
        path: P,
    ) -> Result<usize> {
        let (content, count) = Self::render(results, format)?;
        fs::write(path, content)?;
        Ok(count)
    }
}
