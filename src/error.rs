//! Error types for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that can occur while scanning or processing a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File or directory not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Database operation failed
    DatabaseError,
    /// Hash computation failed
    HashError,
    /// Invalid path encoding
    InvalidPath,
    /// The extraction utility failed or produced unusable output
    ExtractionFailed,
    /// The extraction utility did not finish within its timeout
    ExtractionTimeout,
    /// The worker unit panicked while processing the batch
    WorkerCrashed,
    /// Unknown error
    Unknown,
}

impl ErrorKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IoError => "io_error",
            ErrorKind::DatabaseError => "database_error",
            ErrorKind::HashError => "hash_error",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::ExtractionTimeout => "extraction_timeout",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an error that occurred on a single file or directory
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message} (path: {path:?})")]
pub struct IngestError {
    /// The kind of error
    pub kind: ErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl IngestError {
    /// Create a new error
    pub fn new(kind: ErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create a hash computation error
    pub fn hash_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HashError, Some(path), message)
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::IoError,
        };
        Self::new(kind, None, err.to_string())
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(ErrorKind::DatabaseError, None, err.to_string())
    }
}

/// A configuration value outside its documented range
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("extension class {0} is empty")]
    EmptyExtensionClass(&'static str),
    #[error("extension {extension:?} is listed in both {first} and {second}")]
    OverlappingExtension {
        extension: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid identifier {0:?}: expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),
    #[error("column name {0:?} is reserved")]
    ReservedColumn(String),
    #[error("field mapping has no entry for required column {0:?}")]
    MissingRequiredColumn(&'static str),
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

/// Errors raised by the persistence writer and its store
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema drift on table {table}: missing {missing:?}, extra {extra:?}")]
    SchemaDrift {
        table: String,
        missing: BTreeSet<String>,
        extra: BTreeSet<String>,
    },
    #[error("{failed} files permanently failed to persist (limit {limit})")]
    TooManyFailures { failed: u64, limit: u64 },
    #[error("store failure: {0}")]
    Other(String),
}

/// Errors surfaced to the collaborator driving the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("extraction utility {program:?} is required but unavailable: {reason}")]
    UtilityUnavailable { program: String, reason: String },
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: crate::models::PipelineState,
    },
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
    #[error("scan produced no candidate media files")]
    NoCandidates,
    #[error("persistence error: {0}")]
    Writer(#[from] WriterError),
    #[error("failed to start background thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
