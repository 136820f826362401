//! Configuration for the ingestion pipeline
//!
//! A [`PipelineConfig`] is built once through [`PipelineConfigBuilder`] and
//! validated in [`PipelineConfig::validate`]; the coordinator re-validates
//! whatever it is handed, so components only ever see a checked value.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Default number of files handed to a worker per submission
pub const DEFAULT_READ_BATCH_SIZE: usize = 8;

/// Default number of records per multi-row insert
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 200;

/// Default number of insert batches grouped into one transaction
pub const DEFAULT_TRANSACTION_BATCH_SIZE: usize = 10;

/// Default number of commit retries before the pending rows are given up
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// Default number of files allowed to permanently fail persistence per run
pub const DEFAULT_MAX_FAILED_FILES: u64 = 100;

/// Default extraction timeout in milliseconds
pub const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 10_000;

/// Default number of header bytes hashed for a video fingerprint (64 KiB)
pub const DEFAULT_VIDEO_HEADER_BYTES: usize = 64 * 1024;

/// Default read buffer for full-content hashing (64 KiB)
pub const DEFAULT_HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Default progress interval in milliseconds
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

/// Canonical column holding the normalized file path
pub const FILE_PATH_COLUMN: &str = "file_path";

/// Canonical column holding the content fingerprint
pub const FILE_HASH_COLUMN: &str = "file_hash";

/// Identity column assigned by the store
pub const IDENTITY_COLUMN: &str = "id";

/// Extension classes recognized by the file classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionClasses {
    pub image: HashSet<String>,
    pub video: HashSet<String>,
    pub sidecar: HashSet<String>,
}

impl Default for ExtensionClasses {
    fn default() -> Self {
        Self {
            image: to_set(&[
                "jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "tif", "heic", "heif", "dng",
                "cr2", "cr3", "nef", "arw", "orf", "rw2", "raf",
            ]),
            video: to_set(&[
                "mp4", "mkv", "avi", "wmv", "flv", "mov", "webm", "m4v", "mts", "m2ts", "3gp",
            ]),
            sidecar: to_set(&["xmp", "aae", "thm", "json"]),
        }
    }
}

impl ExtensionClasses {
    fn validate(&mut self) -> Result<(), ConfigError> {
        for set in [&mut self.image, &mut self.video, &mut self.sidecar] {
            *set = set
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect();
        }
        if self.image.is_empty() {
            return Err(ConfigError::EmptyExtensionClass("image"));
        }
        if self.video.is_empty() {
            return Err(ConfigError::EmptyExtensionClass("video"));
        }
        let classes = [
            ("image", &self.image),
            ("video", &self.video),
            ("sidecar", &self.sidecar),
        ];
        for (i, (first, a)) in classes.iter().enumerate() {
            for (second, b) in &classes[i + 1..] {
                if let Some(extension) = a.intersection(b).next() {
                    return Err(ConfigError::OverlappingExtension {
                        extension: extension.clone(),
                        first: *first,
                        second: *second,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Source field -> canonical column tables
///
/// The three tables are applied as one union regardless of file type, so
/// a video-only field simply stays null on images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub file: BTreeMap<String, String>,
    pub image: BTreeMap<String, String>,
    pub video: BTreeMap<String, String>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            file: to_map(&[
                ("SourceFile", FILE_PATH_COLUMN),
                ("FileHash", FILE_HASH_COLUMN),
                ("FileName", "file_name"),
                ("Directory", "directory"),
                ("FileSize", "file_size"),
                ("FileType", "file_type"),
                ("MIMEType", "mime_type"),
                ("FileModifyDate", "file_modify_date"),
            ]),
            image: to_map(&[
                ("DateTimeOriginal", "date_time_original"),
                ("Make", "make"),
                ("Model", "model"),
                ("LensModel", "lens_model"),
                ("ImageWidth", "width"),
                ("ImageHeight", "height"),
                ("Orientation", "orientation"),
                ("GPSLatitude", "gps_latitude"),
                ("GPSLongitude", "gps_longitude"),
            ]),
            video: to_map(&[
                ("CreateDate", "date_time_original"),
                ("Duration", "duration"),
                ("ImageWidth", "width"),
                ("ImageHeight", "height"),
                ("VideoFrameRate", "frame_rate"),
                ("CompressorID", "codec"),
            ]),
        }
    }
}

impl FieldMapping {
    /// All (source, column) pairs, file table first, then image, then video
    pub fn entries(&self) -> Vec<(String, String)> {
        self.file
            .iter()
            .chain(self.image.iter())
            .chain(self.video.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Canonical columns in stable order, duplicates collapsed
    pub fn canonical_columns(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .file
            .values()
            .chain(self.image.values())
            .chain(self.video.values())
            .cloned()
            .collect();
        set.into_iter().collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let columns = self.canonical_columns();
        for column in &columns {
            validate_identifier(column)?;
            if column.eq_ignore_ascii_case(IDENTITY_COLUMN) {
                return Err(ConfigError::ReservedColumn(column.clone()));
            }
        }
        for required in [FILE_PATH_COLUMN, FILE_HASH_COLUMN] {
            if !columns.iter().any(|c| c == required) {
                return Err(ConfigError::MissingRequiredColumn(required));
            }
        }
        Ok(())
    }
}

/// External metadata-extraction utility settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Whether the utility is invoked at all
    pub enabled: bool,
    /// Refuse to start the pipeline when the utility cannot be run
    pub required: bool,
    /// Program name or path
    pub program: PathBuf,
    /// Per-file timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            program: PathBuf::from("exiftool"),
            timeout_ms: DEFAULT_EXTRACTOR_TIMEOUT_MS,
        }
    }
}

/// Persistence store location and tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path
    pub path: PathBuf,
    /// Catalog table name
    pub table: String,
    /// `PRAGMA journal_mode`
    pub journal_mode: String,
    /// `PRAGMA synchronous`
    pub synchronous: String,
    /// Page cache size in KiB (`PRAGMA cache_size = -N`)
    pub cache_size_kib: u32,
    /// Drop the catalog table before processing
    pub clean_start: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("media_ingest.db"),
            table: "media".to_string(),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size_kib: 64_000,
            clean_start: false,
        }
    }
}

/// Validated pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of worker units (0 = auto-detect)
    pub workers: usize,
    /// Files per worker submission
    pub read_batch_size: usize,
    /// Upper bound on submitted-but-unfinished batches (0 = 2 × workers)
    pub max_pending_batches: usize,
    pub extractor: ExtractorConfig,
    /// Records per multi-row insert
    pub write_batch_size: usize,
    /// Insert batches per commit
    pub transaction_batch_size: usize,
    /// Commit retries for a failed transaction
    pub write_retries: u32,
    /// Permanently-failed files tolerated before the writer gives up
    pub max_failed_files: u64,
    pub extensions: ExtensionClasses,
    pub field_mapping: FieldMapping,
    /// Canonical field holding the original capture time
    pub capture_date_field: String,
    /// Header bytes hashed for a video fingerprint
    pub video_header_bytes: usize,
    /// Read buffer for full-content hashing
    pub hash_buffer_size: usize,
    pub store: StoreConfig,
    /// Directory names pruned from the walk
    pub ignore_dirs: HashSet<String>,
    /// Follow symbolic links while walking
    pub follow_links: bool,
    /// Interval between progress ticks in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            max_pending_batches: 0,
            extractor: ExtractorConfig::default(),
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            transaction_batch_size: DEFAULT_TRANSACTION_BATCH_SIZE,
            write_retries: DEFAULT_WRITE_RETRIES,
            max_failed_files: DEFAULT_MAX_FAILED_FILES,
            extensions: ExtensionClasses::default(),
            field_mapping: FieldMapping::default(),
            capture_date_field: "date_time_original".to_string(),
            video_header_bytes: DEFAULT_VIDEO_HEADER_BYTES,
            hash_buffer_size: DEFAULT_HASH_BUFFER_SIZE,
            store: StoreConfig::default(),
            ignore_dirs: Self::default_ignore_dirs(),
            follow_links: false,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    /// Create a config builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Get the default directories to ignore
    pub fn default_ignore_dirs() -> HashSet<String> {
        to_set(&[
            "$RECYCLE.BIN",
            "System Volume Information",
            ".Trash",
            ".Trash-1000",
            "@eaDir",
            ".git",
            ".svn",
            "node_modules",
            "__pycache__",
            ".cache",
        ])
    }

    /// Check if a directory below the scan root should be ignored
    pub fn should_ignore_dir(&self, name: &str) -> bool {
        // Ignore hidden directories (starting with .)
        if name.starts_with('.') {
            return true;
        }
        self.ignore_dirs.contains(name)
    }

    /// Get the effective number of worker units
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }

    /// Get the effective pending-batch bound
    pub fn effective_max_pending(&self) -> usize {
        if self.max_pending_batches == 0 {
            self.effective_workers() * 2
        } else {
            self.max_pending_batches
        }
    }

    /// Columns of the catalog table, excluding the identity key
    pub fn canonical_columns(&self) -> Vec<String> {
        self.field_mapping.canonical_columns()
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker units
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the number of files per worker submission
    pub fn read_batch_size(mut self, size: usize) -> Self {
        self.config.read_batch_size = size;
        self
    }

    /// Set the pending-batch bound
    pub fn max_pending_batches(mut self, bound: usize) -> Self {
        self.config.max_pending_batches = bound;
        self
    }

    /// Replace the extraction utility settings
    pub fn extractor(mut self, extractor: ExtractorConfig) -> Self {
        self.config.extractor = extractor;
        self
    }

    /// Enable or disable the extraction utility
    pub fn extractor_enabled(mut self, enabled: bool) -> Self {
        self.config.extractor.enabled = enabled;
        self
    }

    /// Set the extraction timeout in milliseconds
    pub fn extractor_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.extractor.timeout_ms = timeout_ms;
        self
    }

    /// Set the number of records per insert
    pub fn write_batch_size(mut self, size: usize) -> Self {
        self.config.write_batch_size = size;
        self
    }

    /// Set the number of insert batches per transaction
    pub fn transaction_batch_size(mut self, size: usize) -> Self {
        self.config.transaction_batch_size = size;
        self
    }

    /// Set the commit retry count
    pub fn write_retries(mut self, retries: u32) -> Self {
        self.config.write_retries = retries;
        self
    }

    /// Set the permanently-failed file bound
    pub fn max_failed_files(mut self, max: u64) -> Self {
        self.config.max_failed_files = max;
        self
    }

    /// Replace the extension classes
    pub fn extensions(mut self, extensions: ExtensionClasses) -> Self {
        self.config.extensions = extensions;
        self
    }

    /// Replace the field mapping tables
    pub fn field_mapping(mut self, mapping: FieldMapping) -> Self {
        self.config.field_mapping = mapping;
        self
    }

    /// Set the canonical capture-date field
    pub fn capture_date_field(mut self, field: impl Into<String>) -> Self {
        self.config.capture_date_field = field.into();
        self
    }

    /// Set the number of video header bytes to hash
    pub fn video_header_bytes(mut self, bytes: usize) -> Self {
        self.config.video_header_bytes = bytes;
        self
    }

    /// Replace the store settings
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Set the database path
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.store.path = path;
        self
    }

    /// Drop the catalog before processing
    pub fn clean_start(mut self, enabled: bool) -> Self {
        self.config.store.clean_start = enabled;
        self
    }

    /// Add a directory to ignore
    pub fn add_ignore_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.ignore_dirs.insert(dir.into());
        self
    }

    /// Set the progress interval
    pub fn progress_interval_ms(mut self, interval: u64) -> Self {
        self.config.progress_interval_ms = interval;
        self
    }

    /// Validate and build the config
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let mut config = self.config;
        config.validate()?;
        Ok(config)
    }
}

impl PipelineConfig {
    /// Check every setting and normalize the extension classes.
    ///
    /// [`PipelineConfigBuilder::build`] runs this; a config assembled by
    /// hand or deserialized must pass it before a pipeline accepts it.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        check_range("workers", self.workers as u64, 0, 256)?;
        check_range("read_batch_size", self.read_batch_size as u64, 1, 10_000)?;
        check_range(
            "max_pending_batches",
            self.max_pending_batches as u64,
            0,
            100_000,
        )?;
        check_range(
            "extractor.timeout_ms",
            self.extractor.timeout_ms,
            100,
            600_000,
        )?;
        check_range("write_batch_size", self.write_batch_size as u64, 1, 100_000)?;
        check_range(
            "transaction_batch_size",
            self.transaction_batch_size as u64,
            1,
            10_000,
        )?;
        check_range("write_retries", self.write_retries as u64, 0, 100)?;
        check_range(
            "video_header_bytes",
            self.video_header_bytes as u64,
            1,
            64 * 1024 * 1024,
        )?;
        check_range(
            "hash_buffer_size",
            self.hash_buffer_size as u64,
            512,
            64 * 1024 * 1024,
        )?;
        check_range(
            "progress_interval_ms",
            self.progress_interval_ms,
            1,
            60_000,
        )?;

        if self.extractor.program.as_os_str().is_empty() {
            return Err(ConfigError::Empty {
                key: "extractor.program",
            });
        }
        if self.capture_date_field.is_empty() {
            return Err(ConfigError::Empty {
                key: "capture_date_field",
            });
        }
        validate_identifier(&self.store.table)?;
        validate_identifier(&self.store.journal_mode)?;
        validate_identifier(&self.store.synchronous)?;
        self.extensions.validate()?;
        self.field_mapping.validate()?;
        Ok(())
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// SQL identifiers are interpolated into statements, so only a plain
/// `[A-Za-z_][A-Za-z0-9_]*` form is accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

fn to_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn to_map(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
