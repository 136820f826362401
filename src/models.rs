//! Core data models for the ingestion pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::config::ExtensionClasses;
use crate::error::IngestError;

/// Canonical field -> value; every configured field is present, `None` when unknown
pub type MetadataMap = BTreeMap<String, Option<String>>;

/// File classification by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    /// Auxiliary file tied to a media file by shared stem
    Sidecar,
    Other,
}

impl FileKind {
    /// Classify an extension (case-insensitive, with or without leading dot)
    pub fn classify(ext: &str, classes: &ExtensionClasses) -> Self {
        let ext = ext.trim_start_matches('.').to_lowercase();
        if classes.image.contains(&ext) {
            FileKind::Image
        } else if classes.video.contains(&ext) {
            FileKind::Video
        } else if classes.sidecar.contains(&ext) {
            FileKind::Sidecar
        } else {
            FileKind::Other
        }
    }

    /// Classify a path by its extension
    pub fn classify_path(path: &Path, classes: &ExtensionClasses) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => Self::classify(ext, classes),
            None => FileKind::Other,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, FileKind::Image | FileKind::Video)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Video => "video",
            FileKind::Sidecar => "sidecar",
            FileKind::Other => "other",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A media file discovered by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    /// Absolute path
    pub path: PathBuf,
    /// Image or video
    pub kind: FileKind,
    /// Lowercase extensions of sidecars sharing this file's stem
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<String>,
}

impl CandidateFile {
    pub fn new(path: PathBuf, kind: FileKind) -> Self {
        Self {
            path,
            kind,
            sidecars: Vec::new(),
        }
    }

    /// Lowercase extension, empty when the path has none
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }
}

/// Result of one directory walk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Root that was walked
    pub root: PathBuf,
    /// Every regular file seen
    pub total_files: u64,
    /// Image + video files
    pub media_files: u64,
    /// Sidecar files
    pub sidecar_files: u64,
    /// Files of no recognized class
    pub other_files: u64,
    /// Directories visited, including the root
    pub directories: u64,
    /// Lowercase extension -> count (files without extension use "")
    pub extensions: HashMap<String, u64>,
    /// Media files in walk order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateFile>,
    /// Directories that could not be read
    #[serde(skip)]
    pub errors: Vec<IngestError>,
    /// The walk stopped early on cancellation
    pub aborted: bool,
    /// Total scan duration in milliseconds
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Counts so far, without the candidate list
    pub fn progress(&self, current_dir: &Path, elapsed_ms: u64) -> ScanProgress {
        ScanProgress {
            total_files: self.total_files,
            media_files: self.media_files,
            sidecar_files: self.sidecar_files,
            directories: self.directories,
            current_dir: current_dir.to_string_lossy().to_string(),
            elapsed_ms,
        }
    }
}

/// Incremental scan counts, published after every directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub total_files: u64,
    pub media_files: u64,
    pub sidecar_files: u64,
    pub directories: u64,
    /// Last directory fully processed
    pub current_dir: String,
    /// Elapsed time in milliseconds
    pub elapsed_ms: u64,
}

/// An ordered group of files assigned to one worker unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkBatch {
    /// Sequence number within the run
    pub id: u64,
    /// Preferred worker slot
    pub slot: usize,
    pub files: Vec<CandidateFile>,
}

/// Outcome code of a metadata extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractStatus {
    /// Fields parsed from the utility's output
    Success,
    /// Utility missing, failed, timed out or produced malformed output
    Failed,
    /// Utility disabled by configuration
    Disabled,
}

impl ExtractStatus {
    /// Numeric status code (0, 1 or 99)
    pub fn code(&self) -> u8 {
        match self {
            ExtractStatus::Success => 0,
            ExtractStatus::Failed => 1,
            ExtractStatus::Disabled => 99,
        }
    }
}

/// Severity of a pipeline log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_log_level(&self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// A structured log line destined for the logging sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: LogLevel, worker_id: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            level,
            worker_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, None, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, None, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, None, message)
    }

    /// Tag the event with the worker unit that produced it
    pub fn from_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }
}

/// Everything a worker learned about one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub kind: FileKind,
    pub worker_id: usize,
    pub success: bool,
    pub extract_status: ExtractStatus,
    pub metadata: MetadataMap,
    pub fingerprint: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_entries: Vec<LogEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IngestError>,
}

/// Throughput counters maintained by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// Files the run was started with
    pub total_files: u64,
    /// Results received (successful or not)
    pub files_processed: u64,
    pub files_succeeded: u64,
    pub files_failed: u64,
    /// Distinct parent directories seen in results
    pub dirs_processed: u64,
    /// Records handed to the writer
    pub records_written: u64,
    pub files_per_sec: f64,
    pub dirs_per_sec: f64,
    /// Estimated remaining time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    pub elapsed_ms: u64,
}

impl ProcessingStats {
    pub fn remaining_files(&self) -> u64 {
        self.total_files.saturating_sub(self.files_processed)
    }
}

/// Lifecycle of the ingestion coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Scanning,
    IdleScanDone,
    Processing,
    IdleActionDone,
    Aborted,
}

impl PipelineState {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Scanning => "scanning",
            PipelineState::IdleScanDone => "idle_scan_done",
            PipelineState::Processing => "processing",
            PipelineState::IdleActionDone => "idle_action_done",
            PipelineState::Aborted => "aborted",
        }
    }

    /// States from which `Abort` is accepted
    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            PipelineState::Scanning | PipelineState::Processing | PipelineState::IdleActionDone
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
