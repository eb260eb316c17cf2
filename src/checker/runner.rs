//! Batch runner driving keys through the limiter and probe
//!
//! Every completion is folded into one aggregate behind a single lock:
//! the run counters, the outcome buckets and, when checkpointing, the
//! progress snapshot. Holding one lock for all of them keeps
//! `checked == valid + invalid + error` true at every observable moment.

use crate::checker::checkpoint::{new_session_id, CheckpointStore, ProgressSnapshot};
use crate::checker::error::CheckError;
use crate::checker::limiter::{ConcurrencyLimiter, MAX_CONCURRENCY};
use crate::checker::models::{KeyResult, ProgressEvent, RunResults, RunStats};
use crate::checker::probe::{Probe, DEFAULT_TIMEOUT_SECS};
use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default number of concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 1000;

/// Default interval between periodic checkpoint saves in seconds
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 30;

/// Configuration for a batch runner
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Maximum probes in flight
    pub concurrency: usize,
    /// Per-probe timeout, recorded in the run stats
    pub timeout_secs: u64,
    /// How often an active run writes its checkpoint
    pub save_interval: Duration,
    /// Where checkpoints are written
    pub store: CheckpointStore,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            save_interval: Duration::from_secs(DEFAULT_SAVE_INTERVAL_SECS),
            store: CheckpointStore::default(),
        }
    }
}

impl RunnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    pub fn validate(&self) -> Result<(), CheckError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(CheckError::InvalidConcurrency {
                value: self.concurrency,
                min: 1,
                max: MAX_CONCURRENCY,
            });
        }
        Ok(())
    }
}

/// Cloneable handle for requesting a cooperative stop
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Stop dispatching new probes; in-flight probes still finish
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a run mutates on completion
struct Aggregate {
    results: RunResults,
    checkpoint: Option<(ProgressSnapshot, PathBuf)>,
}

impl Aggregate {
    fn complete(&mut self, result: KeyResult) -> ProgressEvent {
        self.results.stats.record(result.status);
        if let Some((snapshot, _)) = &mut self.checkpoint {
            snapshot.record(result.clone());
        }

        let stats = &self.results.stats;
        let event = ProgressEvent {
            checked: stats.checked,
            total: stats.total,
            valid: stats.valid,
            invalid: stats.invalid,
            error: stats.error,
            result: result.clone(),
        };
        self.results.push(result);
        event
    }

    /// Best-effort save; failures are logged and the run goes on
    fn save(&mut self, store: &CheckpointStore) {
        if let Some((snapshot, path)) = &mut self.checkpoint {
            snapshot.stats = self.results.stats.clone();
            save_logged(store, snapshot, path);
        }
    }

    /// Consistent copy of the snapshot for writing outside the lock
    fn snapshot_copy(&mut self) -> Option<(ProgressSnapshot, PathBuf)> {
        let (snapshot, path) = self.checkpoint.as_mut()?;
        snapshot.stats = self.results.stats.clone();
        Some((snapshot.clone(), path.clone()))
    }
}

fn save_logged(store: &CheckpointStore, snapshot: &mut ProgressSnapshot, path: &Path) {
    if let Err(e) = store.save(snapshot, path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to save checkpoint");
    }
}

/// Lock-guarded aggregate shared with the probe futures
#[derive(Clone)]
struct SharedAggregate(Arc<Mutex<Aggregate>>);

impl SharedAggregate {
    fn new(aggregate: Aggregate) -> Self {
        Self(Arc::new(Mutex::new(aggregate)))
    }

    fn complete(&self, result: KeyResult) -> ProgressEvent {
        self.0.lock().complete(result)
    }

    fn is_checkpointing(&self) -> bool {
        self.0.lock().checkpoint.is_some()
    }

    fn save(&self, store: &CheckpointStore) {
        self.0.lock().save(store);
    }

    /// Copy the snapshot under the lock, then write it on the blocking pool
    fn save_in_background(&self, store: &CheckpointStore) -> Option<JoinHandle<()>> {
        let (mut snapshot, path) = self.0.lock().snapshot_copy()?;
        let store = store.clone();
        Some(tokio::task::spawn_blocking(move || {
            save_logged(&store, &mut snapshot, &path)
        }))
    }

    fn finish(&self, elapsed_secs: f64, store: &CheckpointStore) -> RunResults {
        let mut aggregate = self.0.lock();
        aggregate.results.stats.finish(elapsed_secs);
        aggregate.save(store);
        aggregate.results.clone()
    }
}

/// Runs batches of keys through a probe at bounded concurrency
pub struct BatchRunner {
    probe: Arc<dyn Probe>,
    options: RunnerOptions,
    stop: StopHandle,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl BatchRunner {
    pub fn new(probe: Arc<dyn Probe>, options: RunnerOptions) -> Self {
        Self {
            probe,
            options,
            stop: StopHandle::default(),
            progress: None,
        }
    }

    /// Send a [`ProgressEvent`] after every completed probe
    pub fn with_progress(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        tracing::info!("stop requested, no new probes will be dispatched");
        self.stop.request_stop();
    }

    /// Check every key without checkpointing
    pub async fn run(&self, keys: Vec<String>) -> Result<RunResults, CheckError> {
        self.check_inputs(&keys)?;

        let stats = RunStats::new(keys.len(), self.options.concurrency, self.options.timeout_secs);
        let aggregate = Aggregate {
            results: RunResults::new(stats),
            checkpoint: None,
        };

        Ok(self.execute(keys, aggregate, self.options.concurrency).await)
    }

    /// Check every key, saving progress to a new session checkpoint
    pub async fn run_with_checkpoint(
        &self,
        keys: Vec<String>,
        input_source_id: &str,
    ) -> Result<RunResults, CheckError> {
        let session_id = new_session_id();
        let path = self.options.store.path_for(&session_id);
        self.run_with_checkpoint_at(keys, input_source_id, session_id, path)
            .await
    }

    /// Like [`BatchRunner::run_with_checkpoint`] with an explicit session and path
    pub async fn run_with_checkpoint_at(
        &self,
        keys: Vec<String>,
        input_source_id: &str,
        session_id: String,
        path: PathBuf,
    ) -> Result<RunResults, CheckError> {
        self.check_inputs(&keys)?;

        let stats = RunStats::new(keys.len(), self.options.concurrency, self.options.timeout_secs);
        let snapshot = ProgressSnapshot::new(
            session_id,
            input_source_id.to_string(),
            keys.clone(),
            stats.clone(),
        );
        tracing::info!(path = %path.display(), "checkpointing run");

        let aggregate = Aggregate {
            results: RunResults::new(stats),
            checkpoint: Some((snapshot, path)),
        };

        Ok(self.execute(keys, aggregate, self.options.concurrency).await)
    }

    /// Continue the run stored at `path`, probing only keys without an outcome.
    ///
    /// The returned buckets include the outcomes loaded from the checkpoint.
    pub async fn resume(&self, path: &Path) -> Result<RunResults, CheckError> {
        let snapshot =
            CheckpointStore::load(path).ok_or_else(|| CheckError::CheckpointLoad(path.to_path_buf()))?;

        let pending = snapshot.pending_keys();
        let mut results =
            RunResults::from_outcomes(snapshot.stats.clone(), &snapshot.completed_results);

        tracing::info!(
            session = %snapshot.session_id,
            source = %snapshot.input_source_id,
            total = snapshot.all_keys.len(),
            completed = snapshot.completed_results.len(),
            pending = pending.len(),
            "resuming run"
        );

        if pending.is_empty() {
            return Ok(results);
        }

        let concurrency = snapshot.concurrent_used.clamp(1, MAX_CONCURRENCY);
        results.stats.total = snapshot.all_keys.len();
        results.stats.concurrent_used = concurrency;

        let aggregate = Aggregate {
            results,
            checkpoint: Some((snapshot, path.to_path_buf())),
        };

        Ok(self.execute(pending, aggregate, concurrency).await)
    }

    fn check_inputs(&self, keys: &[String]) -> Result<(), CheckError> {
        if keys.is_empty() {
            return Err(CheckError::EmptyBatch);
        }
        self.options.validate()
    }

    async fn execute(&self, keys: Vec<String>, aggregate: Aggregate, concurrency: usize) -> RunResults {
        let started = Instant::now();
        let store = &self.options.store;
        let limiter = ConcurrencyLimiter::new(concurrency);
        let aggregate = SharedAggregate::new(aggregate);
        let checkpointing = aggregate.is_checkpointing();

        if checkpointing {
            aggregate.save(store);
        }

        tracing::info!(keys = keys.len(), concurrency, "run started");

        let stop = self.stop.clone();
        let work = stream::iter(keys)
            .take_while(move |_| future::ready(!stop.is_stopped()))
            .map(|key| self.probe_one(key, limiter.clone(), aggregate.clone()))
            .buffer_unordered(concurrency)
            .for_each(|_| future::ready(()));

        if checkpointing {
            let mut ticker = tokio::time::interval(self.options.save_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the initial save already ran
            ticker.tick().await;

            let mut pending_save: Option<JoinHandle<()>> = None;
            tokio::pin!(work);
            loop {
                tokio::select! {
                    _ = &mut work => break,
                    _ = ticker.tick() => {
                        // Skip the tick if the previous write is still running
                        if pending_save.as_ref().map_or(true, |save| save.is_finished()) {
                            pending_save = aggregate.save_in_background(store);
                        }
                    }
                }
            }
            // An older periodic write must not land after the final one
            if let Some(save) = pending_save {
                let _ = save.await;
            }
        } else {
            work.await;
        }

        let results = aggregate.finish(started.elapsed().as_secs_f64(), store);
        tracing::info!(
            checked = results.stats.checked,
            total = results.stats.total,
            valid = results.stats.valid,
            invalid = results.stats.invalid,
            error = results.stats.error,
            stopped = self.stop.is_stopped(),
            "run finished"
        );
        results
    }

    /// Probe one key once a slot is free, unless a stop was requested meanwhile
    async fn probe_one(&self, key: String, limiter: ConcurrencyLimiter, aggregate: SharedAggregate) {
        let _slot = limiter.acquire().await;
        if self.stop.is_stopped() {
            return;
        }

        let probe = Arc::clone(&self.probe);
        let task_key = key.clone();
        let result = match tokio::spawn(async move { probe.probe(&task_key).await }).await {
            Ok(result) => result,
            Err(e) => KeyResult::error(key, format!("probe task failed: {}", e)),
        };

        let event = aggregate.complete(result);
        if let Some(tx) = &self.progress {
            // A closed receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::models::KeyStatus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Stub answering by key suffix and tracking how many probes overlap
    #[derive(Default)]
    struct StubProbe {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl StubProbe {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Probe for StubProbe {
        async fn probe(&self, key: &str) -> KeyResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if key.ends_with("ok") {
                KeyResult::valid(key.to_string(), "valid")
            } else if key.ends_with("bad") {
                KeyResult::invalid(key.to_string(), "authentication failed")
            } else {
                KeyResult::error(key.to_string(), "server error 503")
            }
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| match i % 3 {
                0 => format!("sk-{:020}-ok", i),
                1 => format!("sk-{:020}-bad", i),
                _ => format!("sk-{:020}-err", i),
            })
            .collect()
    }

    fn runner(probe: Arc<StubProbe>, concurrency: usize, dir: &Path) -> BatchRunner {
        let options = RunnerOptions::new()
            .with_concurrency(concurrency)
            .with_store(CheckpointStore::new(dir));
        BatchRunner::new(probe, options)
    }

    #[test]
    fn test_runner_options_validate() {
        assert!(RunnerOptions::new().validate().is_ok());
        assert!(RunnerOptions::new().with_concurrency(0).validate().is_err());
        assert!(RunnerOptions::new()
            .with_concurrency(MAX_CONCURRENCY + 1)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_run_rejects_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Arc::new(StubProbe::default()), 2, dir.path());
        assert!(matches!(runner.run(Vec::new()).await, Err(CheckError::EmptyBatch)));
    }

    #[tokio::test]
    async fn test_run_partitions_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(StubProbe::default());
        let runner = runner(probe.clone(), 4, dir.path());

        let batch = keys(30);
        let results = runner.run(batch.clone()).await.unwrap();

        assert_eq!(results.len(), 30);
        assert_eq!(results.valid_keys.len(), 10);
        assert_eq!(results.invalid_keys.len(), 10);
        assert_eq!(results.error_keys.len(), 10);
        assert_eq!(results.stats.total, 30);
        assert_eq!(results.stats.checked, 30);
        assert_eq!(
            results.stats.checked,
            results.stats.valid + results.stats.invalid + results.stats.error
        );
        assert!(results.all().all(|r| batch.contains(&r.key)));
        assert!(results.stats.end_time.is_some());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 30);

        // Plain runs leave no checkpoint behind
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        for limit in [1usize, 5, 1000] {
            let dir = tempfile::tempdir().unwrap();
            let probe = Arc::new(StubProbe::with_delay(Duration::from_millis(5)));
            let runner = runner(probe.clone(), limit, dir.path());

            let results = runner.run(keys(limit * 2 + 3)).await.unwrap();
            assert_eq!(results.len(), limit * 2 + 3);
            let max = probe.max_in_flight.load(Ordering::SeqCst);
            assert!(max <= limit, "limit {} exceeded: {}", limit, max);
            assert!(max >= 1);
        }
    }

    #[tokio::test]
    async fn test_progress_events_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = runner(Arc::new(StubProbe::default()), 3, dir.path()).with_progress(tx);

        runner.run(keys(9)).await.unwrap();
        drop(runner);

        let mut last = 0;
        while let Some(event) = rx.recv().await {
            assert_eq!(event.checked, event.valid + event.invalid + event.error);
            assert!(event.checked <= event.total);
            last = last.max(event.checked);
        }
        assert_eq!(last, 9);
    }

    #[tokio::test]
    async fn test_run_with_checkpoint_writes_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Arc::new(StubProbe::default()), 2, dir.path());
        let path = dir.path().join("progress_test.json");

        let batch = keys(6);
        let results = runner
            .run_with_checkpoint_at(batch.clone(), "keys.txt", "test".to_string(), path.clone())
            .await
            .unwrap();

        let snapshot = CheckpointStore::load(&path).unwrap();
        assert_eq!(snapshot.session_id, "test");
        assert_eq!(snapshot.all_keys, batch);
        assert_eq!(snapshot.completed_results.len(), 6);
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.stats.checked, results.stats.checked);
        assert!(snapshot.stats.end_time.is_some());
    }

    #[tokio::test]
    async fn test_failed_checkpoint_save_does_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file").unwrap();
        let path = blocker.join("progress_blocked.json");

        let probe = Arc::new(StubProbe::with_delay(Duration::from_millis(50)));
        let options = RunnerOptions::new()
            .with_concurrency(2)
            .with_save_interval(Duration::from_millis(20))
            .with_store(CheckpointStore::new(dir.path()));
        let runner = BatchRunner::new(probe.clone(), options);

        let batch = keys(5);
        let results = runner
            .run_with_checkpoint_at(batch.clone(), "keys.txt", "blocked".to_string(), path.clone())
            .await
            .unwrap();

        assert_eq!(results.stats.checked, 5);
        assert_eq!(results.len(), 5);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
        let mut seen: Vec<String> = results.all().map(|r| r.key.clone()).collect();
        seen.sort();
        let mut expected = batch;
        expected.sort();
        assert_eq!(seen, expected);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_periodic_save_while_probes_are_slow() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(StubProbe::with_delay(Duration::from_millis(300)));
        let options = RunnerOptions::new()
            .with_concurrency(1)
            .with_save_interval(Duration::from_millis(100))
            .with_store(CheckpointStore::new(dir.path()));
        let runner = Arc::new(BatchRunner::new(probe, options));
        let path = dir.path().join("progress_slow.json");

        let task = {
            let runner = Arc::clone(&runner);
            let path = path.clone();
            tokio::spawn(async move {
                runner
                    .run_with_checkpoint_at(keys(3), "slow.txt", "slow".to_string(), path)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(450)).await;
        let midway = CheckpointStore::load(&path).unwrap();
        assert!(!midway.is_complete());
        assert_eq!(midway.completed_results.len(), 1);

        task.await.unwrap().unwrap();
        assert!(CheckpointStore::load(&path).unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_stop_before_run_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(StubProbe::default());
        let runner = runner(probe.clone(), 2, dir.path());
        runner.request_stop();

        let results = runner.run(keys(5)).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(results.stats.checked, 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_of_complete_checkpoint_makes_no_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress_done.json");
        runner(Arc::new(StubProbe::default()), 2, dir.path())
            .run_with_checkpoint_at(keys(4), "keys.txt", "done".to_string(), path.clone())
            .await
            .unwrap();

        let probe = Arc::new(StubProbe::default());
        let results = runner(probe.clone(), 2, dir.path()).resume(&path).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results.stats.checked, 4);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress_missing.json");
        let err = runner(Arc::new(StubProbe::default()), 2, dir.path())
            .resume(&path)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::CheckpointLoad(_)));
        assert!(err.to_string().starts_with("cannot load checkpoint: "));
    }

    #[tokio::test]
    async fn test_resume_probes_only_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let batch = keys(6);
        let path = store.path_for("partial");

        let mut stats = RunStats::new(6, 3, 10);
        let mut snapshot =
            ProgressSnapshot::new("partial".to_string(), "keys.txt".to_string(), batch.clone(), stats.clone());
        for key in &batch[..2] {
            let result = KeyResult::valid(key.clone(), "valid");
            stats.record(result.status);
            snapshot.record(result);
        }
        snapshot.stats = stats;
        store.save(&mut snapshot, &path).unwrap();

        let probe = Arc::new(StubProbe::default());
        let results = runner(probe.clone(), 2, dir.path()).resume(&path).await.unwrap();

        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(results.len(), 6);
        assert_eq!(results.stats.checked, 6);
        assert_eq!(results.stats.total, 6);
        assert_eq!(results.stats.concurrent_used, 3);
        assert_eq!(
            results.valid_keys.iter().filter(|r| r.status == KeyStatus::Valid).count(),
            results.stats.valid
        );
        assert!(CheckpointStore::load(&path).unwrap().is_complete());
    }
}
