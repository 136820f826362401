//! Progress reporting for the driver binary
//!
//! Messages are single-line JSON objects written to stderr, tagged by
//! `_t`: `start`, `p` (progress), `err` and `done`.

use serde::Serialize;
use std::cell::Cell;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::coordinator::{ProgressSnapshot, RunSummary};
use crate::error::IngestError;
use crate::models::{LogEvent, PipelineState, ScanReport};

/// Pipeline phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Walking directories
    #[default]
    Scan,
    /// Extracting, hashing and persisting
    Process,
}

/// Sent once before scanning starts
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    #[serde(rename = "_t")]
    pub tag: &'static str,
    pub seq: u64,
    /// Milliseconds since reporter creation
    pub ts: u64,
    pub root: String,
    pub workers: usize,
    pub extractor: bool,
    pub db: String,
}

impl StartMessage {
    pub fn new(seq: u64, ts: u64, root: String, workers: usize, extractor: bool, db: String) -> Self {
        Self {
            tag: "start",
            seq,
            ts,
            root,
            workers,
            extractor,
            db,
        }
    }
}

/// Periodic progress
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    #[serde(rename = "_t")]
    pub tag: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub phase: Phase,
    pub state: PipelineState,
    /// Files seen (scan) or processed (process)
    #[serde(rename = "f")]
    pub files: u64,
    /// Directories walked (scan) or touched by results (process)
    #[serde(rename = "d")]
    pub dirs: u64,
    /// Media files found (scan) or total to process (process)
    #[serde(rename = "m")]
    pub media: u64,
    /// Failed files (process only)
    #[serde(rename = "x", skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    /// Files per second (process only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Elapsed time in milliseconds
    pub ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

impl ProgressMessage {
    pub fn from_snapshot(seq: u64, ts: u64, state: PipelineState, snapshot: &ProgressSnapshot) -> Self {
        match snapshot {
            ProgressSnapshot::Scan(scan) => Self {
                tag: "p",
                seq,
                ts,
                phase: Phase::Scan,
                state,
                files: scan.total_files,
                dirs: scan.directories,
                media: scan.media_files,
                failed: None,
                fps: None,
                dir: Some(scan.current_dir.clone()),
                ms: scan.elapsed_ms,
                eta_ms: None,
            },
            ProgressSnapshot::Process(stats) => Self {
                tag: "p",
                seq,
                ts,
                phase: Phase::Process,
                state,
                files: stats.files_processed,
                dirs: stats.dirs_processed,
                media: stats.total_files,
                failed: Some(stats.files_failed),
                fps: Some((stats.files_per_sec * 10.0).round() / 10.0),
                dir: None,
                ms: stats.elapsed_ms,
                eta_ms: stats.eta_ms,
            },
        }
    }
}

/// Sent immediately for every error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorProgressMessage {
    #[serde(rename = "_t")]
    pub tag: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
}

/// Sent once the pipeline is idle again
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage {
    #[serde(rename = "_t")]
    pub tag: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Total files seen by the scan
    #[serde(rename = "tf")]
    pub total_files: u64,
    #[serde(rename = "td")]
    pub total_dirs: u64,
    #[serde(rename = "mf")]
    pub media_files: u64,
    /// Records committed to the store
    #[serde(rename = "wf")]
    pub written_files: u64,
    /// Files that failed extraction, hashing or persistence
    #[serde(rename = "ff")]
    pub failed_files: u64,
    /// Scan errors (unreadable directories)
    #[serde(rename = "ec")]
    pub error_count: usize,
    pub aborted: bool,
    pub ms: u64,
}

/// Rate-limited JSON reporter writing to stderr
pub struct ProgressReporter {
    enabled: bool,
    interval_ms: u64,
    last_report: Cell<Instant>,
    seq: AtomicU64,
    start_time: Instant,
}

impl ProgressReporter {
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            interval_ms,
            last_report: Cell::new(now),
            seq: AtomicU64::new(0),
            start_time: now,
        }
    }

    /// Whether the interval has elapsed since the last progress message
    pub fn should_report(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.last_report.get().elapsed().as_millis() as u64 >= self.interval_ms
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since reporter creation
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn emit<T: Serialize>(&self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }

    pub fn report_start(&self, config: &PipelineConfig, root: &Path) {
        if !self.enabled {
            return;
        }
        let msg = StartMessage::new(
            self.next_seq(),
            self.elapsed_ms(),
            root.to_string_lossy().to_string(),
            config.effective_workers(),
            config.extractor.enabled,
            config.store.path.to_string_lossy().to_string(),
        );
        self.emit(&msg);
    }

    /// Returns true if a message was sent (respects the interval)
    pub fn report_progress(&self, state: PipelineState, snapshot: &ProgressSnapshot) -> bool {
        if !self.should_report() {
            return false;
        }
        let msg = ProgressMessage::from_snapshot(
            self.next_seq(),
            self.elapsed_ms(),
            state,
            snapshot,
        );
        self.emit(&msg);
        self.last_report.set(Instant::now());
        true
    }

    /// Report a per-file or per-directory error (ignores the interval)
    pub fn report_error(&self, error: &IngestError) {
        if !self.enabled {
            return;
        }
        let msg = ErrorProgressMessage {
            tag: "err",
            seq: self.next_seq(),
            ts: self.elapsed_ms(),
            error_type: error.kind.to_string(),
            message: error.message.clone(),
            path: error.path.as_ref().map(|p| p.to_string_lossy().to_string()),
            worker: None,
        };
        self.emit(&msg);
    }

    /// Report a warning or error pumped from the logging channel
    pub fn report_event(&self, event: &LogEvent) {
        if !self.enabled {
            return;
        }
        let msg = ErrorProgressMessage {
            tag: "err",
            seq: self.next_seq(),
            ts: self.elapsed_ms(),
            error_type: format!("{:?}", event.level).to_lowercase(),
            message: event.message.clone(),
            path: None,
            worker: event.worker_id,
        };
        self.emit(&msg);
    }

    pub fn report_done(&self, report: &ScanReport, run: Option<&RunSummary>, failed_files: u64) {
        if !self.enabled {
            return;
        }
        let msg = DoneMessage {
            tag: "done",
            seq: self.next_seq(),
            ts: self.elapsed_ms(),
            total_files: report.total_files,
            total_dirs: report.directories,
            media_files: report.media_files,
            written_files: run.map(|r| r.writer.records_committed).unwrap_or(0),
            failed_files,
            error_count: report.error_count(),
            aborted: report.aborted || run.map(|r| r.aborted).unwrap_or(false),
            ms: self.elapsed_ms(),
        };
        self.emit(&msg);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessingStats, ScanProgress};

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Scan).unwrap(), "\"scan\"");
        assert_eq!(serde_json::to_string(&Phase::Process).unwrap(), "\"process\"");
    }

    #[test]
    fn test_start_message_serialization() {
        let msg = StartMessage::new(1, 100, "/media".to_string(), 4, false, "c.db".to_string());
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed["_t"], "start");
        assert_eq!(parsed["seq"], 1);
        assert_eq!(parsed["root"], "/media");
        assert_eq!(parsed["workers"], 4);
        assert_eq!(parsed["extractor"], false);
    }

    #[test]
    fn test_scan_progress_message() {
        let snapshot = ProgressSnapshot::Scan(ScanProgress {
            total_files: 9,
            media_files: 7,
            sidecar_files: 1,
            directories: 3,
            current_dir: "/media/a".to_string(),
            elapsed_ms: 12,
        });
        let msg = ProgressMessage::from_snapshot(2, 200, PipelineState::Scanning, &snapshot);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["_t"], "p");
        assert_eq!(parsed["phase"], "scan");
        assert_eq!(parsed["state"], "Scanning");
        assert_eq!(parsed["f"], 9);
        assert_eq!(parsed["d"], 3);
        assert_eq!(parsed["m"], 7);
        assert_eq!(parsed["dir"], "/media/a");
        assert!(!json.contains("eta_ms"));
        assert!(!json.contains("fps"));
    }

    #[test]
    fn test_process_progress_message() {
        let snapshot = ProgressSnapshot::Process(ProcessingStats {
            total_files: 100,
            files_processed: 40,
            files_failed: 2,
            dirs_processed: 5,
            files_per_sec: 12.345,
            eta_ms: Some(4_860),
            elapsed_ms: 3_000,
            ..Default::default()
        });
        let msg = ProgressMessage::from_snapshot(3, 300, PipelineState::Processing, &snapshot);
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed["phase"], "process");
        assert_eq!(parsed["f"], 40);
        assert_eq!(parsed["m"], 100);
        assert_eq!(parsed["x"], 2);
        assert_eq!(parsed["fps"], 12.3);
        assert_eq!(parsed["eta_ms"], 4_860);
        assert!(parsed.get("dir").is_none());
    }

    #[test]
    fn test_reporter_sequence_numbers() {
        let reporter = ProgressReporter::new(true, 200);
        assert_eq!(reporter.next_seq(), 0);
        assert_eq!(reporter.next_seq(), 1);
        assert_eq!(reporter.next_seq(), 2);
    }

    #[test]
    fn test_reporter_interval() {
        let reporter = ProgressReporter::new(true, 10);
        reporter.last_report.set(Instant::now());
        assert!(!reporter.should_report());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(reporter.should_report());
    }

    #[test]
    fn test_disabled_reporter_is_silent() {
        let reporter = ProgressReporter::new(false, 0);
        assert!(!reporter.is_enabled());
        assert!(!reporter.should_report());
        reporter.report_start(&PipelineConfig::default(), Path::new("/media"));
        reporter.report_error(&IngestError::hash_error(std::path::PathBuf::from("/x"), "gone"));
        reporter.report_event(&LogEvent::warning("w"));
        reporter.report_done(&ScanReport::default(), None, 0);
        assert!(!reporter.report_progress(
            PipelineState::Scanning,
            &ProgressSnapshot::Scan(ScanProgress::default())
        ));
        // Nothing consumed a sequence number
        assert_eq!(reporter.next_seq(), 0);
    }
}
