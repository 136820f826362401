//! Directory scanner - one walk of a tree producing a [`ScanReport`]
//!
//! Entries are sorted files-first within each directory, so every
//! directory's files arrive contiguously right after the directory entry.
//! That lets the walk finish one directory at a time: classify its files,
//! attach sidecars to media files by stem, publish a progress snapshot and
//! only then look at the cancellation token.

use log::{debug, info};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::{DirEntry, WalkDir};

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::error::{ErrorKind, IngestError};
use crate::models::{CandidateFile, FileKind, ScanProgress, ScanReport};

/// Walks a directory tree once, classifying files by extension.
///
/// The scanner never opens files; only names are inspected.
pub struct DirectoryScanner<'a> {
    config: &'a PipelineConfig,
}

/// Files of the directory currently being walked
struct DirBuffer {
    path: PathBuf,
    files: Vec<PathBuf>,
}

impl<'a> DirectoryScanner<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Walk `root` recursively.
    ///
    /// `on_progress` is called after each directory is fully processed.
    /// When `cancel` fires, the walk stops before the next directory and
    /// the partial report is returned with `aborted` set.
    pub fn scan<F>(&self, root: &Path, cancel: &CancellationToken, mut on_progress: F) -> ScanReport
    where
        F: FnMut(&ScanProgress),
    {
        let start = Instant::now();
        let mut report = ScanReport::new(root.to_path_buf());
        let mut current: Option<DirBuffer> = None;

        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_links)
            .sort_by(files_first)
            .into_iter()
            .filter_entry(|e| !self.is_ignored(e));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => {
                    if let Some(dir) = current.take() {
                        self.finish_dir(dir, &mut report, start, &mut on_progress);
                    }
                    if cancel.is_cancelled() {
                        info!("Scan of {:?} cancelled", root);
                        report.aborted = true;
                        break;
                    }
                    report.directories += 1;
                    current = Some(DirBuffer {
                        path: entry.into_path(),
                        files: Vec::new(),
                    });
                }
                Ok(entry) if entry.file_type().is_file() => {
                    let path = entry.into_path();
                    match current.as_mut() {
                        Some(dir) => dir.files.push(path),
                        // Root given as a file; treat its parent as the directory
                        None => {
                            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
                            current = Some(DirBuffer {
                                path: parent,
                                files: vec![path],
                            });
                        }
                    }
                }
                Ok(entry) => {
                    debug!("Skipping non-regular entry {:?}", entry.path());
                }
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf);
                    // A directory that could not be opened was counted when
                    // its entry came by; it never got enumerated
                    let unopened = matches!(
                        (&current, &path),
                        (Some(dir), Some(p)) if dir.files.is_empty() && dir.path == *p
                    );
                    if unopened {
                        current = None;
                        report.directories -= 1;
                    }
                    let kind = match e.io_error().map(|io| io.kind()) {
                        Some(std::io::ErrorKind::PermissionDenied) => ErrorKind::PermissionDenied,
                        Some(std::io::ErrorKind::NotFound) => ErrorKind::NotFound,
                        _ => ErrorKind::IoError,
                    };
                    info!("Skipping unreadable directory {:?}: {}", path, e);
                    report.errors.push(IngestError::new(kind, path, e.to_string()));
                }
            }
        }

        if let Some(dir) = current.take() {
            self.finish_dir(dir, &mut report, start, &mut on_progress);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Scanned {:?}: {} files ({} media, {} sidecar, {} other) in {} directories{}",
            root,
            report.total_files,
            report.media_files,
            report.sidecar_files,
            report.other_files,
            report.directories,
            if report.aborted { " (aborted)" } else { "" }
        );
        report
    }

    fn is_ignored(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        entry
            .file_name()
            .to_str()
            .map(|name| self.config.should_ignore_dir(name))
            .unwrap_or(false)
    }

    fn finish_dir<F>(&self, dir: DirBuffer, report: &mut ScanReport, start: Instant, on_progress: &mut F)
    where
        F: FnMut(&ScanProgress),
    {
        let classes = &self.config.extensions;
        let mut media = Vec::new();
        // sidecar stem -> extensions
        let mut sidecars: HashMap<String, Vec<String>> = HashMap::new();

        for path in dir.files {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            *report.extensions.entry(extension.clone()).or_insert(0) += 1;
            report.total_files += 1;

            match FileKind::classify(&extension, classes) {
                kind @ (FileKind::Image | FileKind::Video) => {
                    report.media_files += 1;
                    media.push(CandidateFile::new(path, kind));
                }
                FileKind::Sidecar => {
                    report.sidecar_files += 1;
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        sidecars
                            .entry(stem.to_lowercase())
                            .or_default()
                            .push(extension);
                    }
                }
                FileKind::Other => report.other_files += 1,
            }
        }

        for mut candidate in media {
            // Both "IMG_1.xmp" and "IMG_1.jpg.xmp" belong to "IMG_1.jpg"
            let keys = [
                candidate.path.file_stem().and_then(|s| s.to_str()),
                candidate.path.file_name().and_then(|s| s.to_str()),
            ];
            for key in keys.into_iter().flatten() {
                if let Some(exts) = sidecars.get(&key.to_lowercase()) {
                    candidate.sidecars.extend(exts.iter().cloned());
                }
            }
            candidate.sidecars.sort();
            candidate.sidecars.dedup();
            report.candidates.push(candidate);
        }

        on_progress(&report.progress(&dir.path, start.elapsed().as_millis() as u64));
    }
}

/// Files before directories, then by name
fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    let a_dir = a.file_type().is_dir();
    let b_dir = b.file_type().is_dir();
    a_dir
        .cmp(&b_dir)
        .then_with(|| a.file_name().cmp(b.file_name()))
}
