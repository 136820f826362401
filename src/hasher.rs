//! Content fingerprints
//!
//! Images get a full SHA-256 of their content. Videos get a cheap hybrid
//! fingerprint `{ext}_{size}_{date}_{md5(header)}` so large files are never
//! read in full.

use chrono::{DateTime, NaiveDate, Utc};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::models::{FileKind, MetadataMap};

/// Computes deterministic fingerprints for media files
#[derive(Debug, Clone)]
pub struct HashComputer {
    buffer_size: usize,
    header_bytes: usize,
    capture_date_field: String,
}

impl HashComputer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            buffer_size: config.hash_buffer_size,
            header_bytes: config.video_header_bytes,
            capture_date_field: config.capture_date_field.clone(),
        }
    }

    /// Fingerprint a file; failures yield [`error_fingerprint`] instead of an error
    pub fn hash(&self, path: &Path, kind: FileKind, metadata: &MetadataMap) -> String {
        self.try_hash(path, kind, metadata)
            .unwrap_or_else(|_| error_fingerprint(path))
    }

    /// Fingerprint a file, reporting why it could not be read
    pub fn try_hash(
        &self,
        path: &Path,
        kind: FileKind,
        metadata: &MetadataMap,
    ) -> Result<String, IngestError> {
        let result = match kind {
            FileKind::Video => self.video_fingerprint(path, metadata),
            _ => self.content_hash(path),
        };
        result.map_err(|e| IngestError::hash_error(path.to_path_buf(), e.to_string()))
    }

    /// SHA-256 of the whole file, streamed through a fixed buffer
    fn content_hash(&self, path: &Path) -> std::io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(self.buffer_size, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn video_fingerprint(&self, path: &Path, metadata: &MetadataMap) -> std::io::Result<String> {
        let file = File::open(path)?;
        let fs_meta = file.metadata()?;
        let size = fs_meta.len();

        let mut header = Vec::with_capacity(self.header_bytes.min(size as usize));
        file.take(self.header_bytes as u64).read_to_end(&mut header)?;
        let header_hash = format!("{:x}", Md5::digest(&header));

        let date = metadata
            .get(&self.capture_date_field)
            .and_then(|v| v.as_deref())
            .and_then(parse_capture_date)
            .map(Ok)
            .unwrap_or_else(|| creation_date(&fs_meta))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        Ok(format!("{}_{}_{}_{}", extension, size, date, header_hash))
    }
}

/// `YYYY:MM:DD ...` -> `YYYY-MM-DD`; anything else is rejected
pub fn parse_capture_date(value: &str) -> Option<String> {
    let prefix = value.trim().get(..10)?;
    let date = NaiveDate::parse_from_str(prefix, "%Y:%m:%d").ok()?;
    // exiftool reports unknown dates as 0000:00:00
    Some(date.format("%Y-%m-%d").to_string())
}

/// Filesystem creation date, falling back to modification time where the
/// platform does not record creation
fn creation_date(meta: &std::fs::Metadata) -> std::io::Result<String> {
    let time = meta.created().or_else(|_| meta.modified())?;
    let time: DateTime<Utc> = time.into();
    Ok(time.format("%Y-%m-%d").to_string())
}

/// Synthetic fingerprint used when a file could not be hashed
pub fn error_fingerprint(path: &Path) -> String {
    let digest = Md5::digest(path.to_string_lossy().as_bytes());
    format!("error_{:x}", digest)
}
