//! Metadata extraction through an external utility (exiftool by default)
//!
//! The utility runs as a child process under a timeout and is killed when
//! the timeout expires. Whatever happens, [`MetadataExtractor::extract`]
//! returns a complete field map: every configured canonical column is
//! present, null unless the utility reported it.

use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{ExtractorConfig, PipelineConfig};
use crate::error::{ErrorKind, IngestError};
use crate::models::{ExtractStatus, FileKind, LogEvent, LogLevel, MetadataMap};

/// How often a running child is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one extraction
#[derive(Debug, Clone)]
pub struct Extraction {
    pub metadata: MetadataMap,
    pub status: ExtractStatus,
    pub error: Option<IngestError>,
    /// Failure notice for the logging sink
    pub log: Option<LogEvent>,
}

/// Output of a finished child process
struct ChildOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

enum RunError {
    Spawn(std::io::Error),
    Timeout,
    Wait(std::io::Error),
}

/// Maps the utility's raw fields onto canonical columns
pub struct MetadataExtractor {
    config: ExtractorConfig,
    /// (source field, canonical column), in precedence order
    mapping: Vec<(String, String)>,
    columns: Vec<String>,
    failure_reported: AtomicBool,
}

impl MetadataExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.extractor.clone(),
            mapping: config.field_mapping.entries(),
            columns: config.canonical_columns(),
            failure_reported: AtomicBool::new(false),
        }
    }

    /// Program name used for log messages
    pub fn program(&self) -> String {
        self.config.program.to_string_lossy().to_string()
    }

    /// Every configured column, all null
    pub fn empty_map(&self) -> MetadataMap {
        self.columns.iter().map(|c| (c.clone(), None)).collect()
    }

    /// Check that the utility can be run, returning its version string
    pub fn probe(&self) -> Result<String, String> {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-ver");
        match self.run(cmd) {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if version.is_empty() {
                    Err("empty version output".to_string())
                } else {
                    Ok(version)
                }
            }
            Ok(output) => Err(format!("exited with {}", output.status)),
            Err(RunError::Spawn(e)) => Err(e.to_string()),
            Err(RunError::Timeout) => Err("timed out".to_string()),
            Err(RunError::Wait(e)) => Err(e.to_string()),
        }
    }

    /// Extract canonical metadata for one file; never fails past this call
    pub fn extract(&self, path: &Path, kind: FileKind) -> Extraction {
        if !self.config.enabled {
            return Extraction {
                metadata: self.empty_map(),
                status: ExtractStatus::Disabled,
                error: None,
                log: None,
            };
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-json").arg("-q").arg(path);

        let parsed = match self.run(cmd) {
            Ok(output) if output.status.success() => self.map_fields(&output.stdout).map_err(|e| {
                IngestError::new(
                    ErrorKind::ExtractionFailed,
                    Some(path.to_path_buf()),
                    format!("malformed output: {}", e),
                )
            }),
            Ok(output) => Err(IngestError::new(
                ErrorKind::ExtractionFailed,
                Some(path.to_path_buf()),
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
            Err(RunError::Spawn(e)) => Err(IngestError::new(
                ErrorKind::ExtractionFailed,
                Some(path.to_path_buf()),
                format!("utility {} unavailable: {}", self.program(), e),
            )),
            Err(RunError::Timeout) => Err(IngestError::new(
                ErrorKind::ExtractionTimeout,
                Some(path.to_path_buf()),
                format!("timed out after {}ms", self.config.timeout_ms),
            )),
            Err(RunError::Wait(e)) => Err(IngestError::new(
                ErrorKind::ExtractionFailed,
                Some(path.to_path_buf()),
                e.to_string(),
            )),
        };

        match parsed {
            Ok(metadata) => Extraction {
                metadata,
                status: ExtractStatus::Success,
                error: None,
                log: None,
            },
            Err(error) => {
                // Only the first failure of a run is loud
                let level = if self.failure_reported.swap(true, Ordering::SeqCst) {
                    LogLevel::Info
                } else {
                    LogLevel::Warning
                };
                let log = LogEvent::new(
                    level,
                    None,
                    format!(
                        "Metadata extraction failed for {} {:?}: {}",
                        kind, path, error.message
                    ),
                );
                Extraction {
                    metadata: self.empty_map(),
                    status: ExtractStatus::Failed,
                    error: Some(error),
                    log: Some(log),
                }
            }
        }
    }

    /// Parse `-json` output (an array holding one object per file)
    fn map_fields(&self, stdout: &[u8]) -> Result<MetadataMap, String> {
        let json: Value = serde_json::from_slice(stdout).map_err(|e| e.to_string())?;
        let object = json
            .as_array()
            .and_then(|items| items.first())
            .and_then(Value::as_object)
            .ok_or_else(|| "expected an array of objects".to_string())?;

        let mut metadata = self.empty_map();
        for (source, column) in &self.mapping {
            let Some(slot) = metadata.get_mut(column) else {
                continue;
            };
            if slot.is_some() {
                continue;
            }
            *slot = object.get(source).and_then(value_to_text);
        }
        Ok(metadata)
    }

    fn run(&self, mut cmd: Command) -> Result<ChildOutput, RunError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(RunError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || drain(stdout));
        let err_reader = thread::spawn(move || drain(stderr));

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Readers finish once the pipes close; don't wait on them
                    return Err(RunError::Timeout);
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::Wait(e));
                }
            }
        };

        Ok(ChildOutput {
            status,
            stdout: out_reader.join().unwrap_or_default(),
            stderr: err_reader.join().unwrap_or_default(),
        })
    }
}

fn drain<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
