//! Result aggregation
//!
//! The aggregator is the only consumer of the result channel and the only
//! owner of the [`PersistenceWriter`]. It keeps [`ProcessingStats`] current,
//! forwards worker log entries to the logging channel and persists every
//! successful result.

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::db::{DatabaseRecord, PersistenceWriter, WriterStats};
use crate::error::{ErrorKind, WriterError};
use crate::models::{FileResult, LogEvent, LogLevel, ProcessingStats};

/// Width of the window used for throughput rates
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// What the aggregator leaves behind once the result channel closes
#[derive(Debug)]
pub struct AggregatorOutcome {
    pub writer: WriterStats,
    /// First pipeline-fatal writer error, if any
    pub fatal: Option<WriterError>,
}

/// Samples of (time, files, dirs) for rolling rates
struct RateWindow {
    samples: VecDeque<(Instant, u64, u64)>,
}

impl RateWindow {
    fn new(start: Instant) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((start, 0, 0));
        Self { samples }
    }

    /// Files/s and dirs/s over the window ending at `now`
    fn record(&mut self, now: Instant, files: u64, dirs: u64) -> (f64, f64) {
        self.samples.push_back((now, files, dirs));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _, _)) if now.duration_since(*t) > RATE_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
        let Some(&(t0, f0, d0)) = self.samples.front() else {
            return (0.0, 0.0);
        };
        let secs = now.duration_since(t0).as_secs_f64();
        if secs <= f64::EPSILON {
            return (0.0, 0.0);
        }
        (
            files.saturating_sub(f0) as f64 / secs,
            dirs.saturating_sub(d0) as f64 / secs,
        )
    }
}

pub struct ResultAggregator {
    results: Receiver<FileResult>,
    writer: PersistenceWriter,
    logs: Sender<LogEvent>,
    stats: Arc<RwLock<ProcessingStats>>,
    cancel: CancellationToken,
    rates: RateWindow,
    seen_dirs: HashSet<PathBuf>,
    fatal: Option<WriterError>,
    start: Instant,
}

impl ResultAggregator {
    /// `writer` must already be initialised against the catalog columns
    pub fn new(
        results: Receiver<FileResult>,
        writer: PersistenceWriter,
        logs: Sender<LogEvent>,
        stats: Arc<RwLock<ProcessingStats>>,
        cancel: CancellationToken,
    ) -> Self {
        let start = Instant::now();
        Self {
            results,
            writer,
            logs,
            stats,
            cancel,
            rates: RateWindow::new(start),
            seen_dirs: HashSet::new(),
            fatal: None,
            start,
        }
    }

    /// Consume results until every sender is gone, then finalize the
    /// writer exactly once
    pub fn run(mut self) -> AggregatorOutcome {
        while let Ok(result) = self.results.recv() {
            self.handle(result);
        }

        if let Err(e) = self.writer.finalize() {
            self.fail(e);
        }
        let writer = self.writer.stats();
        debug!(
            "Aggregator drained: {} committed, {} commits, {} permanently failed",
            writer.records_committed, writer.commits, writer.permanently_failed
        );
        AggregatorOutcome {
            writer,
            fatal: self.fatal,
        }
    }

    /// Account for one result
    pub fn handle(&mut self, result: FileResult) {
        for entry in &result.log_entries {
            self.emit(entry.clone());
        }

        let mut written = false;
        if result.success {
            if self.fatal.is_none() {
                let record = DatabaseRecord::from_result(&result, self.writer.columns());
                match self.writer.write(record) {
                    Ok(()) => written = true,
                    Err(e) => self.fail(e),
                }
            }
        } else {
            self.report_failure(&result);
        }

        let now = Instant::now();
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.files_processed += 1;
        if result.success {
            stats.files_succeeded += 1;
        } else {
            stats.files_failed += 1;
        }
        if written {
            stats.records_written += 1;
        }
        if let Some(parent) = result.path.parent() {
            if self.seen_dirs.insert(parent.to_path_buf()) {
                stats.dirs_processed += 1;
            }
        }
        let (files_per_sec, dirs_per_sec) =
            self.rates
                .record(now, stats.files_processed, stats.dirs_processed);
        stats.files_per_sec = files_per_sec;
        stats.dirs_per_sec = dirs_per_sec;
        stats.elapsed_ms = now.duration_since(self.start).as_millis() as u64;
        stats.eta_ms = if files_per_sec > 0.0 {
            Some((stats.remaining_files() as f64 / files_per_sec * 1000.0) as u64)
        } else {
            None
        };
    }

    fn report_failure(&self, result: &FileResult) {
        let (kind, message) = match &result.error {
            Some(e) => (e.kind, e.message.as_str()),
            None => (ErrorKind::Unknown, "no error recorded"),
        };
        let level = match kind {
            ErrorKind::WorkerCrashed | ErrorKind::DatabaseError | ErrorKind::Unknown => {
                LogLevel::Error
            }
            _ => LogLevel::Warning,
        };
        self.emit(
            LogEvent::new(
                level,
                Some(result.worker_id),
                format!("Failed {:?} [{}]: {}", result.path, kind, message),
            ),
        );
    }

    /// Record the first fatal writer error and stop the run
    fn fail(&mut self, error: WriterError) {
        self.emit(LogEvent::error(format!("Persistence failed: {}", error)));
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        self.cancel.cancel();
    }

    fn emit(&self, event: LogEvent) {
        // The coordinator may already be gone during shutdown
        let _ = self.logs.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{settings, RecordingStore, StoreCall};
    use crate::worker::tests::{batches, sample_result, ScriptedProcessor};
    use crate::worker::WorkerPool;
    use crate::config::FILE_PATH_COLUMN;
    use crossbeam_channel::unbounded;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn writer(store: &RecordingStore, write: usize, tx: usize) -> PersistenceWriter {
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(write, tx, 1, 0));
        writer
            .init(&crate::config::PipelineConfig::default().canonical_columns())
            .unwrap();
        writer
    }

    fn shared_stats(total: u64) -> Arc<RwLock<ProcessingStats>> {
        Arc::new(RwLock::new(ProcessingStats {
            total_files: total,
            ..Default::default()
        }))
    }

    #[test]
    fn test_successes_persisted_failures_logged() {
        let store = RecordingStore::default();
        let (tx, rx) = unbounded();
        let (log_tx, log_rx) = unbounded();
        let stats = shared_stats(4);
        let aggregator = ResultAggregator::new(
            rx,
            writer(&store, 2, 10),
            log_tx,
            Arc::clone(&stats),
            CancellationToken::new(),
        );

        tx.send(sample_result(Path::new("/a/1.jpg"), 0, true)).unwrap();
        tx.send(sample_result(Path::new("/a/2.jpg"), 1, false)).unwrap();
        tx.send(sample_result(Path::new("/b/3.jpg"), 0, true)).unwrap();
        tx.send(sample_result(Path::new("/b/4.jpg"), 1, true)).unwrap();
        drop(tx);

        let outcome = aggregator.run();
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.writer.records_committed, 3);
        assert_eq!(outcome.writer.finalize_calls, 1);

        let stats = stats.read().unwrap().clone();
        assert_eq!(stats.files_processed, 4);
        assert_eq!(stats.files_succeeded, 3);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.dirs_processed, 2);
        assert_eq!(stats.records_written, 3);
        assert_eq!(stats.remaining_files(), 0);

        let events: Vec<LogEvent> = log_rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, LogLevel::Warning);
        assert_eq!(events[0].worker_id, Some(1));
        assert!(events[0].message.contains("2.jpg"));
        assert!(events[0].message.contains("extraction_failed"));
    }

    #[test]
    fn test_worker_log_entries_forwarded() {
        let store = RecordingStore::default();
        let (tx, rx) = unbounded();
        let (log_tx, log_rx) = unbounded();
        let aggregator = ResultAggregator::new(
            rx,
            writer(&store, 1, 1),
            log_tx,
            shared_stats(1),
            CancellationToken::new(),
        );
        let mut result = sample_result(Path::new("/x.jpg"), 3, true);
        result.log_entries.push(LogEvent::info("hello").from_worker(3));
        tx.send(result).unwrap();
        drop(tx);
        aggregator.run();

        let events: Vec<LogEvent> = log_rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "hello");
        assert_eq!(events[0].worker_id, Some(3));
    }

    #[test]
    fn test_fatal_writer_error_cancels_and_keeps_draining() {
        let store = RecordingStore::failing(u32::MAX);
        let (tx, rx) = unbounded();
        let (log_tx, log_rx) = unbounded();
        let cancel = CancellationToken::new();
        let stats = shared_stats(3);
        let aggregator = ResultAggregator::new(
            rx,
            writer(&store, 1, 1),
            log_tx,
            Arc::clone(&stats),
            cancel.clone(),
        );
        for i in 0..3 {
            tx.send(sample_result(Path::new(&format!("/f/{i}.jpg")), 0, true))
                .unwrap();
        }
        drop(tx);

        let outcome = aggregator.run();
        assert!(matches!(
            outcome.fatal,
            Some(WriterError::TooManyFailures { failed: 1, limit: 0 })
        ));
        assert!(cancel.is_cancelled());
        assert_eq!(stats.read().unwrap().files_processed, 3);
        assert_eq!(outcome.writer.finalize_calls, 1);
        // Nothing is written after the writer gave up
        assert_eq!(store.inserts(), vec![1, 1]);
        assert!(log_rx
            .try_iter()
            .any(|e| e.level == LogLevel::Error && e.message.contains("Persistence failed")));
    }

    #[test]
    fn test_pool_with_failing_unit_feeds_only_successes_to_writer() {
        let store = RecordingStore::default();
        let (tx, rx) = unbounded();
        let (log_tx, _log_rx) = unbounded();
        let stats = shared_stats(5);
        let aggregator = ResultAggregator::new(
            rx,
            writer(&store, 2, 2),
            log_tx,
            Arc::clone(&stats),
            CancellationToken::new(),
        );
        let handle = std::thread::spawn(move || aggregator.run());

        // Batches dealt round-robin to two units; every batch of unit 1 fails
        let mut work = batches(5, 1);
        for batch in &mut work {
            batch.slot = batch.id as usize % 2;
        }
        let expected: BTreeSet<String> = work
            .iter()
            .filter(|b| b.slot == 0)
            .flat_map(|b| b.files.iter().map(|f| f.path.display().to_string()))
            .collect();
        let processor = ScriptedProcessor {
            failing_slots: vec![1],
            delay: Duration::from_millis(20),
            ..ScriptedProcessor::ok()
        };
        let mut pool =
            WorkerPool::start(2, 4, Arc::new(processor), tx, CancellationToken::new()).unwrap();
        for batch in work {
            pool.submit(batch);
        }
        pool.wait_idle();
        pool.stop();
        assert_eq!(pool.in_flight(), 0);
        drop(pool);

        let outcome = handle.join().unwrap();
        let stats = stats.read().unwrap().clone();
        assert_eq!(stats.files_processed, 5);
        assert_eq!(stats.files_succeeded, 3);
        assert_eq!(stats.files_failed, 2);
        assert_eq!(outcome.writer.records_committed, 3);
        let stored: BTreeSet<String> = store
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.get(FILE_PATH_COLUMN).map(str::to_string))
            .collect();
        assert_eq!(stored, expected);
        assert_eq!(store.count(&StoreCall::Rollback), 0);
    }

    #[test]
    fn test_rate_window_rates() {
        let start = Instant::now();
        let mut window = RateWindow::new(start);
        let (files, dirs) = window.record(start + Duration::from_secs(2), 10, 4);
        assert!((files - 5.0).abs() < 1e-9);
        assert!((dirs - 2.0).abs() < 1e-9);

        // Old samples fall out of the window
        window.record(start + Duration::from_secs(20), 30, 4);
        let (files, _) = window.record(start + Duration::from_secs(22), 40, 4);
        assert!((files - 5.0).abs() < 1e-9);
    }
}
