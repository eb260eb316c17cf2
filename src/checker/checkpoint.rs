//! Checkpoint store for resumable runs
//!
//! A checkpoint is a JSON document describing one run: the full ordered key
//! list fixed at start, every outcome produced so far, the set of keys that
//! have an outcome, and the run counters. Files are named
//! `progress_<session_id>.json` and live in the store's directory.

use crate::checker::models::{KeyResult, RunStats};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "progress_";
const FILE_SUFFIX: &str = ".json";

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Generate a session id such as `session_20240101_120000_1a2b3c4d`
pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "session_{}_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Persisted progress of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub session_id: String,
    /// Identifies where the keys came from, usually the input file path
    #[serde(alias = "input_file")]
    pub input_source_id: String,
    #[serde(rename = "all_credentials", alias = "all_keys")]
    pub all_keys: Vec<String>,
    pub completed_results: Vec<KeyResult>,
    pub processed_keys: BTreeSet<String>,
    pub stats: RunStats,
    pub last_save_time: DateTime<Utc>,
    pub concurrent_used: usize,
    pub timeout_used: u64,
}

impl ProgressSnapshot {
    pub fn new(
        session_id: String,
        input_source_id: String,
        all_keys: Vec<String>,
        stats: RunStats,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id,
            input_source_id,
            all_keys,
            completed_results: Vec::new(),
            processed_keys: BTreeSet::new(),
            concurrent_used: stats.concurrent_used,
            timeout_used: stats.timeout_used,
            stats,
            last_save_time: Utc::now(),
        }
    }

    /// Add an outcome, keeping `processed_keys` in step with `completed_results`
    pub fn record(&mut self, result: KeyResult) {
        self.processed_keys.insert(result.key.clone());
        self.completed_results.push(result);
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed_keys.contains(key)
    }

    /// Keys without an outcome, in original order
    pub fn pending_keys(&self) -> Vec<String> {
        self.all_keys
            .iter()
            .filter(|key| !self.is_processed(key))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.all_keys.iter().all(|key| self.is_processed(key))
    }

    /// Check the structural invariants a loaded file must satisfy
    pub fn is_consistent(&self) -> bool {
        let completed: BTreeSet<&str> = self
            .completed_results
            .iter()
            .map(|r| r.key.as_str())
            .collect();
        let processed: BTreeSet<&str> = self.processed_keys.iter().map(String::as_str).collect();
        if completed != processed {
            return false;
        }

        let all: BTreeSet<&str> = self.all_keys.iter().map(String::as_str).collect();
        processed.is_subset(&all)
    }
}

/// Directory-backed checkpoint persistence
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(".")
    }
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Default checkpoint path for a session
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, session_id, FILE_SUFFIX))
    }

    /// Write `snapshot` to `path`, stamping its save time.
    ///
    /// The file is replaced atomically so a crash mid-write leaves the
    /// previous checkpoint intact.
    pub fn save(&self, snapshot: &mut ProgressSnapshot, path: &Path) -> Result<()> {
        snapshot.last_save_time = Utc::now();
        let content = serde_json::to_string_pretty(snapshot)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        tracing::debug!(
            path = %path.display(),
            processed = snapshot.processed_keys.len(),
            total = snapshot.all_keys.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Read a checkpoint; `None` if it is missing, unreadable or malformed
    pub fn load(path: &Path) -> Option<ProgressSnapshot> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read checkpoint");
                return None;
            }
        };

        let snapshot: ProgressSnapshot = match serde_json::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot parse checkpoint");
                return None;
            }
        };

        if !snapshot.is_consistent() {
            tracing::warn!(path = %path.display(), "checkpoint keys are inconsistent");
            return None;
        }

        Some(snapshot)
    }

    /// Every loadable checkpoint in the directory for `input_source_id`,
    /// newest first
    pub fn list(&self, input_source_id: &str) -> Vec<(PathBuf, ProgressSnapshot)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cannot scan for checkpoints");
                return Vec::new();
            }
        };

        let mut found: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_checkpoint_name(path))
            .filter_map(|path| Self::load(&path).map(|snapshot| (path, snapshot)))
            .filter(|(_, snapshot)| snapshot.input_source_id == input_source_id)
            .collect();

        found.sort_by(|a, b| b.1.last_save_time.cmp(&a.1.last_save_time));
        found
    }

    /// Most recently saved checkpoint for `input_source_id`
    pub fn find_latest(&self, input_source_id: &str) -> Option<PathBuf> {
        self.list(input_source_id)
            .into_iter()
            .next()
            .map(|(path, _)| path)
    }

    /// Delete all but the `keep` newest checkpoints for `input_source_id`.
    /// Returns how many files were removed.
    pub fn prune(&self, input_source_id: &str, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for (path, _) in self.list(input_source_id).into_iter().skip(keep) {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn is_checkpoint_name(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| {
                name.len() > FILE_PREFIX.len() + FILE_SUFFIX.len()
                    && name.starts_with(FILE_PREFIX)
                    && name.ends_with(FILE_SUFFIX)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::models::KeyStatus;
    use chrono::Duration as ChronoDuration;

    fn keys() -> Vec<String> {
        vec![
            "sk-aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            "sk-bbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            "sk-cccccccccccccccccccccccc".to_string(),
        ]
    }

    fn snapshot(source: &str) -> ProgressSnapshot {
        let mut stats = RunStats::new(3, 4, 10);
        stats.record(KeyStatus::Valid);
        stats.record(KeyStatus::Error);
        let mut snapshot =
            ProgressSnapshot::new(new_session_id(), source.to_string(), keys(), stats);
        snapshot.record(KeyResult::valid(keys()[0].clone(), "valid").with_response_time(120));
        snapshot.record(KeyResult::error(keys()[2].clone(), "request timed out after 10s"));
        snapshot
    }

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        assert!(id.starts_with("session_"));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn test_pending_keys_preserve_order() {
        let snapshot = snapshot("keys.txt");
        assert_eq!(snapshot.pending_keys(), vec![keys()[1].clone()]);
        assert!(snapshot.is_processed(&keys()[0]));
        assert!(!snapshot.is_complete());
        assert!(snapshot.is_consistent());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut original = snapshot("keys.txt");
        let path = store.path_for(&original.session_id);

        store.save(&mut original, &path).unwrap();
        let loaded = CheckpointStore::load(&path).unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.completed_results[1].response_time_ms, None);
    }

    #[test]
    fn test_save_writes_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut original = snapshot("keys.txt");
        let path = store.path_for(&original.session_id);
        store.save(&mut original, &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for field in [
            "session_id",
            "input_source_id",
            "all_credentials",
            "completed_results",
            "processed_keys",
            "stats",
            "last_save_time",
            "concurrent_used",
            "timeout_used",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["completed_results"][0]["status"], "valid");
        assert_eq!(value["completed_results"][0]["response_time_ms"], 120);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointStore::load(&dir.path().join("progress_none.json")).is_none());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress_bad.json");
        fs::write(&path, "{\"session_id\": 12").unwrap();
        assert!(CheckpointStore::load(&path).is_none());

        fs::write(&path, "{\"session_id\": \"s\"}").unwrap();
        assert!(CheckpointStore::load(&path).is_none());
    }

    #[test]
    fn test_load_rejects_inconsistent_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut broken = snapshot("keys.txt");
        broken.processed_keys.insert("sk-not-in-the-batch".to_string());
        let path = store.path_for(&broken.session_id);
        store.save(&mut broken, &path).unwrap();
        assert!(CheckpointStore::load(&path).is_none());
    }

    #[test]
    fn test_load_accepts_legacy_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut original = snapshot("keys.txt");
        let path = store.path_for(&original.session_id);
        store.save(&mut original, &path).unwrap();

        let content = fs::read_to_string(&path)
            .unwrap()
            .replace("\"input_source_id\"", "\"input_file\"")
            .replace("\"all_credentials\"", "\"all_keys\"")
            .replace("\"version\": 1,", "");
        fs::write(&path, content).unwrap();

        let loaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(loaded.input_source_id, "keys.txt");
        assert_eq!(loaded.all_keys, original.all_keys);
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_find_latest_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut older = snapshot("keys.txt");
        let older_path = store.path_for("older");
        store.save(&mut older, &older_path).unwrap();

        let mut newer = snapshot("keys.txt");
        let newer_path = store.path_for("newer");
        store.save(&mut newer, &newer_path).unwrap();

        let mut other = snapshot("other.txt");
        let other_path = store.path_for("other");
        store.save(&mut other, &other_path).unwrap();

        // Force a strict ordering independent of clock resolution
        let mut rewritten = CheckpointStore::load(&older_path).unwrap();
        rewritten.last_save_time = newer.last_save_time - ChronoDuration::seconds(60);
        fs::write(&older_path, serde_json::to_string(&rewritten).unwrap()).unwrap();

        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        assert_eq!(store.find_latest("keys.txt"), Some(newer_path));
        assert_eq!(store.find_latest("other.txt"), Some(other_path));
        assert_eq!(store.find_latest("missing.txt"), None);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for name in ["a", "b", "c"] {
            let mut snap = snapshot("keys.txt");
            store.save(&mut snap, &store.path_for(name)).unwrap();
        }

        let removed = store.prune("keys.txt", 1).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list("keys.txt").len(), 1);
    }
}
