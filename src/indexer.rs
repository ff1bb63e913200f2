use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::DEFAULT_WORKERS;
use crate::error::IndexError;
use crate::extract::{metadata_to_text, DefaultExtractor, MetadataExtractor};
use crate::finder::ImageFinder;
use crate::model::{ExportRecord, IndexedImage};
use crate::pool::{run_pool, CancelToken, PoolExit, Progress};
use crate::repository::ImageIndexRepository;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub concurrency: usize,
    /// Written only when the rebuild completes.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKERS,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Completed {
        indexed: usize,
        removed: usize,
        skipped: usize,
        total: usize,
    },
    /// Stopped early. Nothing was removed from the store.
    Canceled { indexed: usize, total: usize },
}

impl IndexOutcome {
    pub fn indexed(&self) -> usize {
        match self {
            Self::Completed { indexed, .. } | Self::Canceled { indexed, .. } => *indexed,
        }
    }

    pub fn total(&self) -> usize {
        match self {
            Self::Completed { total, .. } | Self::Canceled { total, .. } => *total,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

pub fn file_mtime(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Walks folders, extracts metadata on a worker pool and rebuilds the index.
pub struct IndexerService<E = DefaultExtractor> {
    extractor: E,
    finder: ImageFinder,
}

impl<E: MetadataExtractor> IndexerService<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor,
            finder: ImageFinder::new(),
        }
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Stats and extracts one file. `None` means the file is skipped.
    pub fn build_item(&self, path: &Path) -> Option<IndexedImage> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skip: stat failed");
                return None;
            }
        };
        if !meta.is_file() {
            debug!(path = %path.display(), "skip: not a regular file");
            return None;
        }

        let metadata = self.extractor.extract(path);
        let metadata_text = metadata_to_text(&metadata);
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Some(IndexedImage {
            path: path.to_string_lossy().to_string(),
            filename,
            mtime: file_mtime(&meta),
            size: meta.len(),
            metadata,
            metadata_text,
        })
    }

    /// Full rebuild of `repo` from the images found below `folders`.
    ///
    /// Runs in a single store transaction. A completed run removes records
    /// whose files were not seen; a canceled run keeps them and leaves the
    /// search index covering every record. Store failures roll back.
    pub fn build_index(
        &self,
        repo: &mut ImageIndexRepository,
        folders: &[PathBuf],
        options: &IndexOptions,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(Progress<'_>),
    ) -> Result<IndexOutcome, IndexError> {
        let started = Instant::now();
        let paths: Vec<PathBuf> = self.finder.iter_images(folders).collect();
        let total = paths.len();
        info!(
            total,
            concurrency = options.concurrency,
            folders = folders.len(),
            "rebuild started"
        );

        let mut rebuild = repo.begin_rebuild()?;
        let mut seen: HashSet<String> = HashSet::with_capacity(total);
        let mut completed = 0usize;
        let mut indexed = 0usize;
        let mut skipped = 0usize;

        let exit = run_pool(
            &paths,
            options.concurrency,
            cancel,
            |path| self.build_item(path),
            |path, item| {
                completed += 1;
                on_progress(Progress {
                    completed,
                    total,
                    path,
                });
                let Some(image) = item else {
                    skipped += 1;
                    return ControlFlow::Continue(());
                };
                match rebuild.upsert(&image) {
                    Ok(_) => {
                        indexed += 1;
                        seen.insert(image.path);
                        ControlFlow::Continue(())
                    }
                    Err(err) => ControlFlow::Break(err),
                }
            },
        );

        let outcome = match exit {
            PoolExit::Broke(err) => {
                warn!(error = %err, completed, "rebuild failed, rolling back");
                return Err(err.into());
            }
            PoolExit::Canceled => {
                let restored = rebuild.restore_search_entries()?;
                rebuild.commit()?;
                info!(
                    indexed,
                    total,
                    restored,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "rebuild canceled"
                );
                IndexOutcome::Canceled { indexed, total }
            }
            PoolExit::Drained => {
                let removed = rebuild.delete_missing(&seen)?;
                rebuild.commit()?;
                info!(
                    indexed,
                    removed,
                    skipped,
                    total,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "rebuild completed"
                );
                if let Some(snapshot) = &options.snapshot_path {
                    write_snapshot(repo, snapshot)?;
                }
                IndexOutcome::Completed {
                    indexed,
                    removed,
                    skipped,
                    total,
                }
            }
        };
        Ok(outcome)
    }
}

/// Writes every record as a pretty-printed JSON array.
pub fn write_snapshot(repo: &ImageIndexRepository, path: &Path) -> Result<usize, IndexError> {
    let records: Vec<ExportRecord> = repo
        .all_records()?
        .into_iter()
        .map(ExportRecord::from)
        .collect();

    let snapshot_err = |source: std::io::Error| IndexError::Snapshot {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(snapshot_err)?;
    }
    let file = File::create(path).map_err(snapshot_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &records)?;
    writer.flush().map_err(snapshot_err)?;

    info!(path = %path.display(), records = records.len(), "snapshot written");
    Ok(records.len())
}
