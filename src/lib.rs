//! Concurrent media ingestion pipeline
//!
//! Walks a directory tree, extracts metadata from media files with an
//! external utility, fingerprints them and persists one row per file in
//! SQLite. Work runs on a rayon worker pool; results flow over crossbeam
//! channels to a single aggregator that owns the writer.
//!
//! [`IngestionCoordinator`] is the entry point.

pub mod aggregator;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod extractor;
pub mod hasher;
pub mod models;
pub mod progress;
pub mod scanner;
pub mod worker;

pub use aggregator::{AggregatorOutcome, ResultAggregator};
pub use cancel::CancellationToken;
pub use config::{ExtensionClasses, ExtractorConfig, FieldMapping, PipelineConfig, StoreConfig};
pub use coordinator::{CompletionBarrier, IngestionCoordinator, ProgressSnapshot, RunSummary};
pub use db::{
    DatabaseRecord, PersistenceWriter, RecordStore, SchemaReport, SqliteStore, WriterSettings,
    WriterStats,
};
pub use error::{ConfigError, ErrorKind, IngestError, PipelineError, WriterError};
pub use extractor::{Extraction, MetadataExtractor};
pub use hasher::HashComputer;
pub use models::{
    CandidateFile, ExtractStatus, FileKind, FileResult, LogEvent, LogLevel, MetadataMap,
    PipelineState, ProcessingStats, ScanProgress, ScanReport, WorkBatch,
};
pub use progress::{
    DoneMessage, ErrorProgressMessage, Phase, ProgressMessage, ProgressReporter, StartMessage,
};
pub use scanner::DirectoryScanner;
pub use worker::{BatchProcessor, PoolStats, Submission, Worker, WorkerPool};
