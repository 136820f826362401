//! Ingestion coordinator
//!
//! Drives the pipeline state machine:
//!
//! ```text
//! Idle -> Scanning -> IdleScanDone -> Processing -> IdleActionDone -> Idle
//!            \                            \               \
//!             +------------ Aborted <------+---------------+ -> Idle
//! ```
//!
//! Scans and processing runs execute on background threads. The
//! collaborator calls [`IngestionCoordinator::tick`] periodically; each tick
//! pumps the logging channel and advances the state once the completion
//! barrier allows it.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, log, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::aggregator::ResultAggregator;
use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::db::{self, PersistenceWriter, SchemaReport, WriterStats};
use crate::error::PipelineError;
use crate::extractor::MetadataExtractor;
use crate::models::{
    CandidateFile, LogEvent, PipelineState, ProcessingStats, ScanProgress, ScanReport, WorkBatch,
};
use crate::scanner::DirectoryScanner;
use crate::worker::{PoolStats, Submission, Worker, WorkerPool};

/// Log target for events pumped from the logging channel
pub const PIPELINE_LOG_TARGET: &str = "media_ingest::pipeline";

/// Events kept for [`IngestionCoordinator::recent_events`]
const EVENT_HISTORY: usize = 1_000;

/// Two flags that must both be set before a cycle may end.
///
/// `work_finished` is set by the background routine once its own logic is
/// done; `drain_complete` by the coordinator once every channel and buffer
/// between stages is empty. Either may come first.
#[derive(Debug, Default)]
pub struct CompletionBarrier {
    work_finished: AtomicBool,
    drain_complete: AtomicBool,
}

impl CompletionBarrier {
    pub fn mark_work_finished(&self) {
        self.work_finished.store(true, Ordering::SeqCst);
    }

    pub fn mark_drain_complete(&self) {
        self.drain_complete.store(true, Ordering::SeqCst);
    }

    pub fn is_work_finished(&self) -> bool {
        self.work_finished.load(Ordering::SeqCst)
    }

    pub fn is_drain_complete(&self) -> bool {
        self.drain_complete.load(Ordering::SeqCst)
    }

    /// Clear both flags and return true, only if both are set
    pub fn try_release(&self) -> bool {
        if self.is_work_finished() && self.is_drain_complete() {
            self.work_finished.store(false, Ordering::SeqCst);
            self.drain_complete.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        self.work_finished.store(false, Ordering::SeqCst);
        self.drain_complete.store(false, Ordering::SeqCst);
    }
}

/// Progress of whatever the pipeline is doing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum ProgressSnapshot {
    Scan(ScanProgress),
    Process(ProcessingStats),
}

/// What the last processing run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub pool: PoolStats,
    /// Units still executing once the pool reported stopped
    pub in_flight_after_stop: usize,
    pub writer: WriterStats,
    pub aborted: bool,
}

/// State written by background routines and read by the coordinator
#[derive(Default)]
struct Shared {
    barrier: CompletionBarrier,
    /// The aggregator has finalized the writer and exited
    drained: AtomicBool,
    scan_progress: RwLock<ScanProgress>,
    report: RwLock<Option<ScanReport>>,
    stats: Arc<RwLock<ProcessingStats>>,
    pool: Mutex<Option<(PoolStats, usize)>>,
    writer: Mutex<Option<WriterStats>>,
    fatal: Mutex<Option<String>>,
}

/// Owns the pipeline and its state machine
pub struct IngestionCoordinator {
    config: Arc<PipelineConfig>,
    state: PipelineState,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    threads: Vec<JoinHandle<()>>,
    logs_tx: Sender<LogEvent>,
    logs_rx: Receiver<LogEvent>,
    history: VecDeque<LogEvent>,
    /// Events pumped since construction
    pumped: u64,
    processing: bool,
    aborted: bool,
    utility_version: Option<String>,
}

impl IngestionCoordinator {
    /// Build a coordinator, probing the extraction utility.
    ///
    /// The config is validated again here. A utility that is required but
    /// cannot be run is fatal.
    pub fn new(mut config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let mut utility_version = None;
        if config.extractor.enabled {
            let extractor = MetadataExtractor::new(&config);
            match extractor.probe() {
                Ok(version) => {
                    info!("Using {} version {}", extractor.program(), version);
                    utility_version = Some(version);
                }
                Err(reason) if config.extractor.required => {
                    return Err(PipelineError::UtilityUnavailable {
                        program: extractor.program(),
                        reason,
                    });
                }
                Err(reason) => {
                    warn!(
                        "{} unavailable ({}); metadata will be empty",
                        extractor.program(),
                        reason
                    );
                }
            }
        } else {
            info!("Metadata extraction disabled");
        }

        let (logs_tx, logs_rx) = unbounded();
        let shared = Shared {
            drained: AtomicBool::new(true),
            ..Default::default()
        };
        Ok(Self {
            config: Arc::new(config),
            state: PipelineState::Idle,
            shared: Arc::new(shared),
            cancel: CancellationToken::new(),
            threads: Vec::new(),
            logs_tx,
            logs_rx,
            history: VecDeque::new(),
            pumped: 0,
            processing: false,
            aborted: false,
            utility_version,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Version reported by the extraction utility at construction
    pub fn utility_version(&self) -> Option<&str> {
        self.utility_version.as_deref()
    }

    /// Start walking `root` in the background.
    ///
    /// Accepted from `Idle`, and from `IdleScanDone` to scan again. The
    /// path is validated first; on failure the state does not change.
    pub fn start_scan(&mut self, root: impl AsRef<Path>) -> Result<(), PipelineError> {
        if !matches!(
            self.state,
            PipelineState::Idle | PipelineState::IdleScanDone
        ) {
            return Err(self.invalid_state("start a scan"));
        }
        let root = validate_root(root.as_ref())?;
        info!("Scanning {:?}", root);

        self.begin_cycle();
        *write(&self.shared.report) = None;
        *write(&self.shared.scan_progress) = ScanProgress::default();
        self.processing = false;

        let shared = Arc::clone(&self.shared);
        let config = Arc::clone(&self.config);
        let cancel = self.cancel.clone();
        let logs = self.logs_tx.clone();
        let handle = thread::Builder::new()
            .name("ingest-scan".to_string())
            .spawn(move || {
                let scanner = DirectoryScanner::new(&config);
                let report = scanner.scan(&root, &cancel, |progress| {
                    *write(&shared.scan_progress) = progress.clone();
                });
                for error in &report.errors {
                    let _ = logs.send(LogEvent::info(format!("Skipped {}", error)));
                }
                let _ = logs.send(LogEvent::info(format!(
                    "Scan of {:?} found {} media files in {} directories{}",
                    report.root,
                    report.media_files,
                    report.directories,
                    if report.aborted { " (aborted)" } else { "" }
                )));
                *write(&shared.scan_progress) = report.progress(&report.root, report.duration_ms);
                *write(&shared.report) = Some(report);
                shared.barrier.mark_work_finished();
            })
            .map_err(PipelineError::Spawn)?;
        self.threads.push(handle);
        self.state = PipelineState::Scanning;
        Ok(())
    }

    /// Process the candidates of the last scan in the background.
    ///
    /// Requires `IdleScanDone`, a root that is still a readable directory
    /// and at least one candidate. Store problems (schema drift, open
    /// failures) are reported and leave the state unchanged.
    pub fn start_process(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::IdleScanDone {
            return Err(self.invalid_state("start processing"));
        }
        let (root, candidates) = {
            let report = read(&self.shared.report);
            match report.as_ref() {
                Some(report) => (report.root.clone(), report.candidates.clone()),
                None => return Err(PipelineError::NoCandidates),
            }
        };
        validate_root(&root)?;
        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates);
        }

        let mut writer = PersistenceWriter::open(&self.config)?;
        if self.config.store.clean_start {
            writer.clear_store()?;
        }
        writer.init(&self.config.canonical_columns())?;

        self.begin_cycle();
        self.processing = true;
        *self.shared.pool.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.shared.writer.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.shared.fatal.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *write(&self.shared.stats) = ProcessingStats {
            total_files: candidates.len() as u64,
            ..Default::default()
        };

        let workers = self.config.effective_workers();
        let (results_tx, results_rx) = unbounded();
        let pool = WorkerPool::start(
            workers,
            self.config.effective_max_pending(),
            Arc::new(Worker::new(&self.config)),
            results_tx,
            self.cancel.clone(),
        )?;

        let aggregator = ResultAggregator::new(
            results_rx,
            writer,
            self.logs_tx.clone(),
            Arc::clone(&self.shared.stats),
            self.cancel.clone(),
        );
        self.shared.drained.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let aggregate = thread::Builder::new()
            .name("ingest-aggregator".to_string())
            .spawn(move || {
                let outcome = aggregator.run();
                *shared.writer.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(outcome.writer);
                if let Some(fatal) = outcome.fatal {
                    *shared.fatal.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(fatal.to_string());
                }
                shared.drained.store(true, Ordering::SeqCst);
            });
        let aggregate = match aggregate {
            Ok(handle) => handle,
            Err(e) => {
                // Dropping the pool closes the result channel
                self.shared.drained.store(true, Ordering::SeqCst);
                return Err(PipelineError::Spawn(e));
            }
        };
        self.threads.push(aggregate);

        let batches = make_batches(candidates, self.config.read_batch_size, workers);
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let feeder = thread::Builder::new()
            .name("ingest-feed".to_string())
            .spawn(move || feed(pool, batches, cancel, shared));
        match feeder {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.cancel.cancel();
                return Err(PipelineError::Spawn(e));
            }
        }

        self.state = PipelineState::Processing;
        info!("Processing with {} workers", workers);
        Ok(())
    }

    /// Cancel the running routine.
    ///
    /// The scanner stops before its next directory, pending batches are
    /// dropped, running files finish, and the writer is finalized once
    /// the result channel closes. The state moves to `Aborted` and returns
    /// to `Idle` through the completion barrier.
    pub fn abort(&mut self) -> Result<(), PipelineError> {
        if !self.state.can_abort() {
            return Err(self.invalid_state("abort"));
        }
        self.cancel.cancel();
        self.aborted = true;
        self.state = PipelineState::Aborted;
        self.emit(LogEvent::warning("Abort requested"));
        Ok(())
    }

    /// Pump logs and advance the state machine; returns the new state
    pub fn tick(&mut self) -> PipelineState {
        self.pump_logs();

        match self.state {
            PipelineState::Scanning => {
                if self.shared.barrier.is_work_finished() {
                    self.check_drain();
                    if self.shared.barrier.try_release() {
                        self.state = PipelineState::IdleScanDone;
                        debug!("Scan complete");
                    }
                }
            }
            PipelineState::Processing => {
                if self.shared.barrier.is_work_finished() {
                    self.state = PipelineState::IdleActionDone;
                    debug!("Processing complete, waiting for drain");
                }
            }
            PipelineState::IdleActionDone | PipelineState::Aborted => {
                self.check_drain();
                if self.shared.barrier.try_release() {
                    self.finish_cycle();
                }
            }
            PipelineState::Idle | PipelineState::IdleScanDone => {}
        }
        self.state
    }

    /// Tick every `progress_interval_ms` until `done` holds or `timeout`
    /// passes; returns the last state
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> PipelineState
    where
        F: FnMut(PipelineState) -> bool,
    {
        let interval = Duration::from_millis(self.config.progress_interval_ms.max(1));
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.tick();
            if done(state) || Instant::now() >= deadline {
                return state;
            }
            thread::sleep(interval);
        }
    }

    /// Scan counts while scanning, processing counts once a run started
    pub fn progress(&self) -> ProgressSnapshot {
        if self.processing {
            ProgressSnapshot::Process(read(&self.shared.stats).clone())
        } else {
            ProgressSnapshot::Scan(read(&self.shared.scan_progress).clone())
        }
    }

    /// Report of the last completed scan
    pub fn scan_report(&self) -> Option<ScanReport> {
        read(&self.shared.report).clone()
    }

    /// Compare configured columns with the store, without writing
    pub fn schema_check(&self) -> Result<SchemaReport, PipelineError> {
        Ok(db::check_schema(&self.config)?)
    }

    /// Pipeline-fatal error of the last processing run
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Summary of the last processing run, once both pool and writer are done
    pub fn last_run(&self) -> Option<RunSummary> {
        let pool = *self.shared.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = *self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match (pool, writer) {
            (Some((pool, in_flight_after_stop)), Some(writer)) => Some(RunSummary {
                pool,
                in_flight_after_stop,
                writer,
                aborted: self.aborted,
            }),
            _ => None,
        }
    }

    /// Most recent pipeline log events, oldest first
    pub fn recent_events(&self) -> Vec<LogEvent> {
        self.history.iter().cloned().collect()
    }

    /// Number of events pumped so far; a cursor for [`Self::events_since`]
    pub fn event_cursor(&self) -> u64 {
        self.pumped
    }

    /// Events pumped after `cursor` that are still in the history
    pub fn events_since(&self, cursor: u64) -> Vec<LogEvent> {
        let newer = self.pumped.saturating_sub(cursor) as usize;
        let skip = self.history.len().saturating_sub(newer);
        self.history.iter().skip(skip).cloned().collect()
    }

    fn begin_cycle(&mut self) {
        self.join_threads();
        self.shared.barrier.reset();
        self.cancel = CancellationToken::new();
        self.aborted = false;
    }

    fn finish_cycle(&mut self) {
        self.pump_logs();
        self.join_threads();
        if let Some(error) = self.last_error() {
            warn!("Run ended with a fatal error: {}", error);
        }
        self.state = PipelineState::Idle;
        debug!("Pipeline idle");
    }

    /// Mark the drain complete when nothing is left between stages
    fn check_drain(&self) {
        if self.shared.drained.load(Ordering::SeqCst) && self.logs_rx.is_empty() {
            self.shared.barrier.mark_drain_complete();
        }
    }

    fn pump_logs(&mut self) {
        while let Ok(event) = self.logs_rx.try_recv() {
            match event.worker_id {
                Some(id) => log!(
                    target: PIPELINE_LOG_TARGET,
                    event.level.as_log_level(),
                    "[worker {}] {}",
                    id,
                    event.message
                ),
                None => log!(
                    target: PIPELINE_LOG_TARGET,
                    event.level.as_log_level(),
                    "{}",
                    event.message
                ),
            }
            if self.history.len() == EVENT_HISTORY {
                self.history.pop_front();
            }
            self.history.push_back(event);
            self.pumped += 1;
        }
    }

    fn emit(&self, event: LogEvent) {
        let _ = self.logs_tx.send(event);
    }

    fn join_threads(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Background routine panicked");
            }
        }
    }

    fn invalid_state(&self, action: &'static str) -> PipelineError {
        PipelineError::InvalidState {
            action,
            state: self.state,
        }
    }
}

impl Drop for IngestionCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.join_threads();
    }
}

/// Submit every batch, wait for the pool to go idle (or the run to be
/// cancelled), then stop it
fn feed(
    mut pool: WorkerPool,
    batches: Vec<WorkBatch>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    for batch in batches {
        if pool.submit(batch) == Submission::Rejected {
            debug!("Submission rejected, stopping feed");
            break;
        }
    }
    if !cancel.is_cancelled() {
        pool.wait_idle();
    }
    pool.stop();
    let stats = (pool.stats(), pool.in_flight());
    drop(pool);
    *shared.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
    shared.barrier.mark_work_finished();
}

fn make_batches(candidates: Vec<CandidateFile>, batch_size: usize, workers: usize) -> Vec<WorkBatch> {
    let batch_size = batch_size.max(1);
    let workers = workers.max(1);
    let mut batches = Vec::with_capacity(candidates.len().div_ceil(batch_size));
    let mut files = candidates.into_iter().peekable();
    let mut id = 0u64;
    while files.peek().is_some() {
        let chunk: Vec<CandidateFile> = files.by_ref().take(batch_size).collect();
        batches.push(WorkBatch {
            id,
            slot: id as usize % workers,
            files: chunk,
        });
        id += 1;
    }
    batches
}

/// The root must exist, be a directory and be listable
fn validate_root(path: &Path) -> Result<PathBuf, PipelineError> {
    let invalid = |reason: &str| PipelineError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let metadata = std::fs::metadata(path).map_err(|_| invalid("does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory"));
    }
    std::fs::read_dir(path).map_err(|e| invalid(&format!("not readable: {}", e)))?;
    Ok(path.to_path_buf())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
