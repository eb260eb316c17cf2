//! Key parser module for extracting candidate keys from raw text

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default prefix every key must start with
pub const DEFAULT_KEY_PREFIX: &str = "sk-";

/// Default minimum total key length, prefix included
pub const DEFAULT_MIN_KEY_LENGTH: usize = 20;

/// Shape a line must have to count as a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRule {
    /// Case-sensitive prefix
    pub prefix: String,
    /// Minimum length of the whole trimmed line
    pub min_length: usize,
}

impl Default for KeyRule {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            min_length: DEFAULT_MIN_KEY_LENGTH,
        }
    }
}

impl KeyRule {
    pub fn new(prefix: impl Into<String>, min_length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            min_length,
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        candidate.starts_with(&self.prefix) && candidate.len() >= self.min_length
    }
}

/// Key parser for reading keys from strings and files
pub struct KeyParser;

impl KeyParser {
    /// Parse a single line
    ///
    /// Returns the trimmed line when it is not blank, not a `#` comment and
    /// satisfies `rule`.
    pub fn parse_line(line: &str, rule: &KeyRule) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        rule.matches(line).then(|| line.to_string())
    }

    /// Lazily iterate over the keys in `content`, in input order.
    ///
    /// Duplicates are kept. The iterator is `Clone`, so a caller can take a
    /// copy before consuming it and walk the same keys again.
    pub fn keys<'a>(
        content: &'a str,
        rule: &'a KeyRule,
    ) -> impl Iterator<Item = String> + Clone + 'a {
        content
            .lines()
            .filter_map(move |line| Self::parse_line(line, rule))
    }

    /// Parse keys from a string (multiple lines)
    pub fn parse_string(content: &str, rule: &KeyRule) -> Vec<String> {
        Self::keys(content, rule).collect()
    }

    /// Parse keys from a file
    pub fn parse_file<P: AsRef<Path>>(path: P, rule: &KeyRule) -> Result<Vec<String>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content, rule))
    }
}
