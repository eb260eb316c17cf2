//! Key check data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Valid,
    Invalid,
    Error,
    /// Placeholder before a probe runs; never produced by a probe.
    #[default]
    Pending,
}

impl KeyStatus {
    /// Single-character marker used by the text exports
    pub fn icon(&self) -> &'static str {
        match self {
            KeyStatus::Valid => "✓",
            KeyStatus::Invalid => "✗",
            KeyStatus::Error => "!",
            KeyStatus::Pending => "?",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Valid => write!(f, "valid"),
            KeyStatus::Invalid => write!(f, "invalid"),
            KeyStatus::Error => write!(f, "error"),
            KeyStatus::Pending => write!(f, "pending"),
        }
    }
}

/// Outcome of probing one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyResult {
    pub key: String,
    pub status: KeyStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl KeyResult {
    pub fn new(key: String, status: KeyStatus, message: impl Into<String>) -> Self {
        Self {
            key,
            status,
            message: message.into(),
            checked_at: Utc::now(),
            response_time_ms: None,
        }
    }

    pub fn valid(key: String, message: impl Into<String>) -> Self {
        Self::new(key, KeyStatus::Valid, message)
    }

    pub fn invalid(key: String, message: impl Into<String>) -> Self {
        Self::new(key, KeyStatus::Invalid, message)
    }

    pub fn error(key: String, message: impl Into<String>) -> Self {
        Self::new(key, KeyStatus::Error, message)
    }

    pub fn with_response_time(mut self, millis: u64) -> Self {
        self.response_time_ms = Some(millis);
        self
    }

    pub fn with_checked_at(mut self, checked_at: DateTime<Utc>) -> Self {
        self.checked_at = checked_at;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.status == KeyStatus::Valid
    }

    pub fn is_invalid(&self) -> bool {
        self.status == KeyStatus::Invalid
    }

    pub fn is_error(&self) -> bool {
        self.status == KeyStatus::Error
    }
}

/// Counters and timing for one run
///
/// `checked == valid + invalid + error` holds after every call to
/// [`RunStats::record`], which is the only way the counters move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub error: usize,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub avg_speed: f64,
    pub concurrent_used: usize,
    pub timeout_used: u64,
}

impl RunStats {
    pub fn new(total: usize, concurrent_used: usize, timeout_used: u64) -> Self {
        Self {
            total,
            checked: 0,
            valid: 0,
            invalid: 0,
            error: 0,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: 0.0,
            avg_speed: 0.0,
            concurrent_used,
            timeout_used,
        }
    }

    /// Count one outcome. `Pending` is not an outcome and is ignored.
    pub fn record(&mut self, status: KeyStatus) {
        let bucket = match status {
            KeyStatus::Valid => &mut self.valid,
            KeyStatus::Invalid => &mut self.invalid,
            KeyStatus::Error => &mut self.error,
            KeyStatus::Pending => return,
        };
        *bucket += 1;
        self.checked += 1;
    }

    /// Close the run, adding `elapsed_secs` of active time to the duration
    pub fn finish(&mut self, elapsed_secs: f64) {
        self.end_time = Some(Utc::now());
        self.duration_secs += elapsed_secs;
        self.avg_speed = if self.duration_secs > 0.0 {
            self.total as f64 / self.duration_secs
        } else {
            0.0
        };
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.checked)
    }

    pub fn percent(&self) -> u16 {
        if self.total == 0 {
            return 0;
        }
        (self.checked as f64 / self.total as f64 * 100.0) as u16
    }
}

/// Outcomes of a run split by verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub stats: RunStats,
    pub valid_keys: Vec<KeyResult>,
    pub invalid_keys: Vec<KeyResult>,
    pub error_keys: Vec<KeyResult>,
}

impl RunResults {
    pub fn new(stats: RunStats) -> Self {
        Self {
            stats,
            valid_keys: Vec::new(),
            invalid_keys: Vec::new(),
            error_keys: Vec::new(),
        }
    }

    /// Build results from already finished outcomes
    pub fn from_outcomes<'a>(
        stats: RunStats,
        outcomes: impl IntoIterator<Item = &'a KeyResult>,
    ) -> Self {
        let mut results = Self::new(stats);
        for outcome in outcomes {
            results.push(outcome.clone());
        }
        results
    }

    /// File an outcome into its bucket
    pub fn push(&mut self, result: KeyResult) {
        match result.status {
            KeyStatus::Valid => self.valid_keys.push(result),
            KeyStatus::Invalid => self.invalid_keys.push(result),
            KeyStatus::Error => self.error_keys.push(result),
            KeyStatus::Pending => {}
        }
    }

    /// Every outcome, valid first
    pub fn all(&self) -> impl Iterator<Item = &KeyResult> {
        self.valid_keys
            .iter()
            .chain(self.invalid_keys.iter())
            .chain(self.error_keys.iter())
    }

    pub fn len(&self) -> usize {
        self.valid_keys.len() + self.invalid_keys.len() + self.error_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Progress notification sent after each completed probe
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub checked: usize,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub error: usize,
    pub result: KeyResult,
}
