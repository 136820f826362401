//! Worker units and the pool that runs them
//!
//! A [`Worker`] turns a [`WorkBatch`] into one [`FileResult`] per file. The
//! [`WorkerPool`] runs batches on a dedicated rayon pool, contains panics
//! per batch, bounds the number of pending batches and publishes results
//! on a crossbeam channel.

use crossbeam_channel::Sender;
use log::{debug, warn};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::error::{ErrorKind, IngestError};
use crate::extractor::MetadataExtractor;
use crate::hasher::{error_fingerprint, HashComputer};
use crate::models::{
    CandidateFile, ExtractStatus, FileResult, LogEvent, LogLevel, MetadataMap, WorkBatch,
};

/// How long a blocked submitter sleeps before re-checking for a stop
const SUBMIT_RECHECK: Duration = Duration::from_millis(50);

/// Processes one batch inside a worker unit.
///
/// Files are handled in order and independently: one file's failure never
/// ends the batch. Between files the cancellation token is checked, so an
/// abort lets the current file finish and skips the rest.
pub trait BatchProcessor: Send + Sync {
    fn process_batch(
        &self,
        batch: &WorkBatch,
        worker_id: usize,
        cancel: &CancellationToken,
    ) -> Vec<FileResult>;

    /// Metadata map used for results the processor never produced
    fn null_metadata(&self) -> MetadataMap {
        MetadataMap::new()
    }
}

/// Extraction + fingerprinting for one file at a time
pub struct Worker {
    extractor: MetadataExtractor,
    hasher: HashComputer,
}

impl Worker {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            extractor: MetadataExtractor::new(config),
            hasher: HashComputer::new(config),
        }
    }

    pub fn process_file(&self, file: &CandidateFile, worker_id: usize) -> FileResult {
        let start = Instant::now();
        let extraction = self.extractor.extract(&file.path, file.kind);

        let mut log_entries = Vec::new();
        if let Some(event) = extraction.log {
            log_entries.push(event.from_worker(worker_id));
        }

        let (fingerprint, hash_error) =
            match self
                .hasher
                .try_hash(&file.path, file.kind, &extraction.metadata)
            {
                Ok(hash) => (hash, None),
                Err(e) => (error_fingerprint(&file.path), Some(e)),
            };

        let error = extraction.error.or(hash_error);
        let duration_ms = start.elapsed().as_millis() as u64;
        log_entries.push(LogEvent::new(
            LogLevel::Debug,
            Some(worker_id),
            format!("Processed {:?} in {}ms", file.path, duration_ms),
        ));

        FileResult {
            path: file.path.clone(),
            kind: file.kind,
            worker_id,
            success: error.is_none(),
            extract_status: extraction.status,
            metadata: extraction.metadata,
            fingerprint,
            duration_ms,
            log_entries,
            error,
        }
    }
}

impl BatchProcessor for Worker {
    fn process_batch(
        &self,
        batch: &WorkBatch,
        worker_id: usize,
        cancel: &CancellationToken,
    ) -> Vec<FileResult> {
        let mut results = Vec::with_capacity(batch.files.len());
        for file in &batch.files {
            if cancel.is_cancelled() {
                debug!(
                    "Worker {} stopping batch {} early on cancellation",
                    worker_id, batch.id
                );
                break;
            }
            results.push(self.process_file(file, worker_id));
        }
        results
    }

    fn null_metadata(&self) -> MetadataMap {
        self.extractor.empty_map()
    }
}

/// Outcome of [`WorkerPool::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// The pool is stopping or the run was cancelled
    Rejected,
}

/// Counters describing what the pool did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    /// Batches dropped before they started
    pub cancelled: u64,
    /// Batches whose unit panicked
    pub crashed: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    crashed: AtomicU64,
}

/// Submitted-but-unfinished batches, with a condvar for waiters
#[derive(Debug, Default)]
struct PendingGauge {
    pending: Mutex<usize>,
    changed: Condvar,
    in_flight: AtomicUsize,
}

impl PendingGauge {
    fn release(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        self.changed.notify_all();
    }

    fn wait_empty(&self) {
        let mut pending = lock(&self.pending);
        while *pending > 0 {
            pending = self
                .changed
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A fixed set of worker units fed with batches
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    processor: Arc<dyn BatchProcessor>,
    results: Sender<FileResult>,
    gauge: Arc<PendingGauge>,
    counters: Arc<PoolCounters>,
    stopping: Arc<AtomicBool>,
    cancel: CancellationToken,
    max_pending: usize,
}

impl WorkerPool {
    /// Allocate `max_workers` units.
    ///
    /// Results go to `results`; once the pool is stopped and dropped every
    /// sender clone it held is gone.
    pub fn start(
        max_workers: usize,
        max_pending: usize,
        processor: Arc<dyn BatchProcessor>,
        results: Sender<FileResult>,
        cancel: CancellationToken,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = max_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ingest-worker-{}", i))
            .build()?;
        debug!("Worker pool started with {} units", workers);
        Ok(Self {
            pool: Some(pool),
            processor,
            results,
            gauge: Arc::new(PendingGauge::default()),
            counters: Arc::new(PoolCounters::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            cancel,
            max_pending: max_pending.max(1),
        })
    }

    /// Enqueue a batch.
    ///
    /// Blocks only while the pending-batch bound is reached, and gives up
    /// as soon as the pool stops or the run is cancelled.
    pub fn submit(&self, batch: WorkBatch) -> Submission {
        if self.is_closed() {
            return Submission::Rejected;
        }
        let Some(pool) = self.pool.as_ref() else {
            return Submission::Rejected;
        };

        {
            let mut pending = lock(&self.gauge.pending);
            while *pending >= self.max_pending {
                if self.is_closed() {
                    return Submission::Rejected;
                }
                pending = self
                    .gauge
                    .changed
                    .wait_timeout(pending, SUBMIT_RECHECK)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            *pending += 1;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let processor = Arc::clone(&self.processor);
        let results = self.results.clone();
        let gauge = Arc::clone(&self.gauge);
        let counters = Arc::clone(&self.counters);
        let stopping = Arc::clone(&self.stopping);
        let cancel = self.cancel.clone();

        pool.spawn(move || {
            if stopping.load(Ordering::SeqCst) || cancel.is_cancelled() {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                gauge.release();
                return;
            }
            gauge.in_flight.fetch_add(1, Ordering::SeqCst);
            let worker_id = rayon::current_thread_index().unwrap_or(batch.slot);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                processor.process_batch(&batch, worker_id, &cancel)
            }));
            let batch_results = match outcome {
                Ok(batch_results) => batch_results,
                Err(payload) => {
                    counters.crashed.fetch_add(1, Ordering::Relaxed);
                    let reason = panic_message(payload.as_ref());
                    warn!(
                        "Worker {} crashed on batch {}: {}",
                        worker_id, batch.id, reason
                    );
                    crashed_results(&batch, worker_id, &reason, processor.null_metadata())
                }
            };

            for result in batch_results {
                if results.send(result).is_err() {
                    break;
                }
            }
            counters.completed.fetch_add(1, Ordering::Relaxed);
            gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
            gauge.release();
        });

        Submission::Accepted
    }

    /// Block until every accepted batch has finished
    pub fn wait_idle(&self) {
        self.gauge.wait_empty();
    }

    /// Stop accepting work, drop batches that have not started, and wait
    /// for running ones before releasing the units.
    pub fn stop(&mut self) {
        if self.pool.is_none() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.gauge.changed.notify_all();
        self.gauge.wait_empty();
        self.pool = None;
        let stats = self.stats();
        debug!(
            "Worker pool stopped: {} submitted, {} completed, {} cancelled, {} crashed",
            stats.submitted, stats.completed, stats.cancelled, stats.crashed
        );
    }

    /// Batches currently executing
    pub fn in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::SeqCst)
    }

    /// Batches accepted but not finished (queued + executing)
    pub fn pending(&self) -> usize {
        *lock(&self.gauge.pending)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            crashed: self.counters.crashed.load(Ordering::Relaxed),
        }
    }

    fn is_closed(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn crashed_results(
    batch: &WorkBatch,
    worker_id: usize,
    reason: &str,
    metadata: MetadataMap,
) -> Vec<FileResult> {
    batch
        .files
        .iter()
        .map(|file| FileResult {
            path: file.path.clone(),
            kind: file.kind,
            worker_id,
            success: false,
            extract_status: ExtractStatus::Failed,
            metadata: metadata.clone(),
            fingerprint: error_fingerprint(&file.path),
            duration_ms: 0,
            log_entries: Vec::new(),
            error: Some(IngestError::new(
                ErrorKind::WorkerCrashed,
                Some(file.path.clone()),
                reason.to_string(),
            )),
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::FileKind;
    use crossbeam_channel::unbounded;
    use std::path::PathBuf;

    /// Succeeds on every file unless the unit id is in `failing_units` or
    /// the batch slot is in `failing_slots`
    pub(crate) struct ScriptedProcessor {
        pub failing_units: Vec<usize>,
        pub failing_slots: Vec<usize>,
        pub panic_on_failure: bool,
        pub delay: Duration,
    }

    impl ScriptedProcessor {
        pub fn ok() -> Self {
            Self {
                failing_units: Vec::new(),
                failing_slots: Vec::new(),
                panic_on_failure: false,
                delay: Duration::ZERO,
            }
        }
    }

    impl BatchProcessor for ScriptedProcessor {
        fn process_batch(
            &self,
            batch: &WorkBatch,
            worker_id: usize,
            _cancel: &CancellationToken,
        ) -> Vec<FileResult> {
            std::thread::sleep(self.delay);
            let failing = self.failing_units.contains(&worker_id)
                || self.failing_slots.contains(&batch.slot);
            if failing && self.panic_on_failure {
                panic!("unit {} exploded", worker_id);
            }
            batch
                .files
                .iter()
                .map(|f| sample_result(&f.path, worker_id, !failing))
                .collect()
        }
    }

    pub(crate) fn sample_result(path: &std::path::Path, worker_id: usize, success: bool) -> FileResult {
        let mut metadata = MetadataMap::new();
        metadata.insert("make".to_string(), Some("Canon".to_string()));
        FileResult {
            path: path.to_path_buf(),
            kind: FileKind::Image,
            worker_id,
            success,
            extract_status: if success {
                ExtractStatus::Success
            } else {
                ExtractStatus::Failed
            },
            metadata,
            fingerprint: format!("hash-{}", path.display()),
            duration_ms: 1,
            log_entries: Vec::new(),
            error: (!success).then(|| {
                IngestError::new(ErrorKind::ExtractionFailed, Some(path.to_path_buf()), "scripted")
            }),
        }
    }

    pub(crate) fn batches(count: usize, per_batch: usize) -> Vec<WorkBatch> {
        (0..count)
            .map(|i| WorkBatch {
                id: i as u64,
                slot: i,
                files: (0..per_batch)
                    .map(|j| {
                        CandidateFile::new(PathBuf::from(format!("/m/{i}-{j}.jpg")), FileKind::Image)
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn test_all_results_delivered() {
        let (tx, rx) = unbounded();
        let mut pool = WorkerPool::start(
            3,
            4,
            Arc::new(ScriptedProcessor::ok()),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        for batch in batches(10, 3) {
            assert_eq!(pool.submit(batch), Submission::Accepted);
        }
        pool.wait_idle();
        pool.stop();
        drop(pool);

        let results: Vec<FileResult> = rx.iter().collect();
        assert_eq!(results.len(), 30);
        assert!(results.iter().all(|r| r.success));
    }

    #[test]
    fn test_order_within_batch_is_preserved() {
        let (tx, rx) = unbounded();
        let mut pool = WorkerPool::start(
            1,
            1,
            Arc::new(ScriptedProcessor::ok()),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        let batch = batches(1, 5).remove(0);
        let expected: Vec<PathBuf> = batch.files.iter().map(|f| f.path.clone()).collect();
        pool.submit(batch);
        pool.stop();
        drop(pool);

        let got: Vec<PathBuf> = rx.iter().map(|r| r.path).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_panicking_unit_is_contained() {
        let (tx, rx) = unbounded();
        let processor = ScriptedProcessor {
            failing_units: vec![0],
            panic_on_failure: true,
            ..ScriptedProcessor::ok()
        };
        let mut pool =
            WorkerPool::start(1, 2, Arc::new(processor), tx, CancellationToken::new()).unwrap();
        for batch in batches(3, 2) {
            pool.submit(batch);
        }
        pool.wait_idle();
        let stats = pool.stats();
        pool.stop();
        drop(pool);

        let results: Vec<FileResult> = rx.iter().collect();
        assert_eq!(results.len(), 6);
        assert_eq!(stats.crashed, 3);
        assert!(results
            .iter()
            .all(|r| r.error.as_ref().map(|e| e.kind) == Some(ErrorKind::WorkerCrashed)));
    }

    #[test]
    fn test_pending_bound_applies_backpressure() {
        let (tx, _rx) = unbounded();
        let processor = ScriptedProcessor {
            delay: Duration::from_millis(20),
            ..ScriptedProcessor::ok()
        };
        let mut pool =
            WorkerPool::start(1, 2, Arc::new(processor), tx, CancellationToken::new()).unwrap();
        for batch in batches(6, 1) {
            pool.submit(batch);
            assert!(pool.pending() <= 2);
        }
        pool.wait_idle();
        assert_eq!(pool.stats().completed, 6);
        pool.stop();
    }

    #[test]
    fn test_stop_cancels_pending_and_drains_in_flight() {
        let (tx, rx) = unbounded();
        let processor = ScriptedProcessor {
            delay: Duration::from_millis(100),
            ..ScriptedProcessor::ok()
        };
        let mut pool =
            WorkerPool::start(1, 10, Arc::new(processor), tx, CancellationToken::new()).unwrap();
        for batch in batches(5, 1) {
            pool.submit(batch);
        }
        pool.stop();
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.submit(batches(1, 1).remove(0)), Submission::Rejected);

        let stats = pool.stats();
        assert_eq!(stats.completed + stats.cancelled, 5);
        assert!(stats.cancelled >= 1);
        drop(pool);
        assert_eq!(rx.iter().count() as u64, stats.completed);
    }

    #[test]
    fn test_cancelled_token_rejects_submissions() {
        let (tx, _rx) = unbounded();
        let cancel = CancellationToken::new();
        let pool = WorkerPool::start(2, 2, Arc::new(ScriptedProcessor::ok()), tx, cancel.clone())
            .unwrap();
        cancel.cancel();
        assert_eq!(pool.submit(batches(1, 1).remove(0)), Submission::Rejected);
    }

    #[test]
    fn test_worker_disabled_extractor_results() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .extractor_enabled(false)
            .build()
            .unwrap();
        let worker = Worker::new(&config);
        let mut files = Vec::new();
        for name in ["a.jpg", "b.png", "c.mp4"] {
            let path = tmp.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            let kind = FileKind::classify_path(&path, &config.extensions);
            files.push(CandidateFile::new(path, kind));
        }
        let batch = WorkBatch {
            id: 0,
            slot: 0,
            files,
        };

        let results = worker.process_batch(&batch, 0, &CancellationToken::new());
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.success);
            assert_eq!(result.extract_status.code(), 99);
            assert!(result.metadata.values().all(Option::is_none));
            assert!(!result.fingerprint.starts_with("error_"));
            assert!(result
                .log_entries
                .iter()
                .all(|e| e.level < LogLevel::Warning));
        }
    }

    #[test]
    fn test_worker_hash_failure_marks_result_failed() {
        let config = PipelineConfig::builder()
            .extractor_enabled(false)
            .build()
            .unwrap();
        let worker = Worker::new(&config);
        let file = CandidateFile::new(PathBuf::from("/missing/x.jpg"), FileKind::Image);
        let result = worker.process_file(&file, 4);
        assert!(!result.success);
        assert_eq!(result.worker_id, 4);
        assert_eq!(result.error.unwrap().kind, ErrorKind::HashError);
        assert!(result.fingerprint.starts_with("error_"));
    }
}
