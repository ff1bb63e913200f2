//! Fixed-size preview cache.
//!
//! One PNG per fingerprint of `(path, mtime, size)`. Entries are never
//! invalidated: a changed file hashes to a new name and the old file stays
//! until the directory is flushed with [`clear_cache`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, ImageDecoder, ImageReader};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::ThumbError;
use crate::indexer::file_mtime;
use crate::pool::{run_pool, CancelToken, PoolExit, Progress};

pub const THUMB_SIZE: u32 = 144;
pub const DEFAULT_MAX_SOURCE_BYTES: u64 = 200 * 1024 * 1024;
const THUMB_EXTENSION: &str = "png";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hex blake3 digest naming a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Falls back to hashing the path alone when the file cannot be stat'ed.
pub fn cache_key(path: &Path) -> Fingerprint {
    let raw = path.to_string_lossy();
    let input = match fs::metadata(path) {
        Ok(meta) => format!("{raw}|{}|{}", file_mtime(&meta), meta.len()),
        Err(_) => raw.into_owned(),
    };
    Fingerprint(blake3::hash(input.as_bytes()).to_hex().to_string())
}

pub fn cache_path(path: &Path, cache_dir: &Path) -> PathBuf {
    entry_path(&cache_key(path), cache_dir)
}

fn entry_path(key: &Fingerprint, cache_dir: &Path) -> PathBuf {
    cache_dir.join(format!("{key}.{THUMB_EXTENSION}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    Empty,
    Unreadable,
    Decode,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbStatus {
    /// Already on disk; the source was not opened.
    Hit(PathBuf),
    /// Decoded and written by this call.
    Cached(PathBuf),
    Skipped(SkipReason),
}

impl ThumbStatus {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Hit(path) | Self::Cached(path) => Some(path),
            Self::Skipped(_) => None,
        }
    }
}

pub fn ensure_thumbnail(path: &Path, cache_dir: &Path, max_source_bytes: u64) -> ThumbStatus {
    ensure_with_key(path, &cache_key(path), cache_dir, max_source_bytes)
}

fn ensure_with_key(
    path: &Path,
    key: &Fingerprint,
    cache_dir: &Path,
    max_source_bytes: u64,
) -> ThumbStatus {
    let target = entry_path(key, cache_dir);
    if target.is_file() {
        return ThumbStatus::Hit(target);
    }

    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "thumbnail skip: stat failed");
            return ThumbStatus::Skipped(SkipReason::Unreadable);
        }
    };
    if size == 0 {
        return ThumbStatus::Skipped(SkipReason::Empty);
    }
    if size > max_source_bytes {
        debug!(path = %path.display(), size, max_source_bytes, "thumbnail skip: source too large");
        return ThumbStatus::Skipped(SkipReason::TooLarge);
    }

    let thumb = match decode_oriented(path) {
        Ok(img) => img.thumbnail(THUMB_SIZE, THUMB_SIZE),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "thumbnail skip: decode failed");
            return ThumbStatus::Skipped(SkipReason::Decode);
        }
    };

    match write_png(&thumb, cache_dir, &target) {
        Ok(()) => ThumbStatus::Cached(target),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "thumbnail skip: write failed");
            ThumbStatus::Skipped(SkipReason::Write)
        }
    }
}

fn decode_oriented(path: &Path) -> image::ImageResult<DynamicImage> {
    let mut decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, png::EncodingError> {
    let rgba = img.to_rgba8();
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, rgba.width(), rgba.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba.as_raw())?;
        writer.finish()?;
    }
    Ok(out)
}

/// Writes through a unique temp file and renames into place, so readers
/// never see a partial entry. Racing writers produce identical bytes.
fn write_png(img: &DynamicImage, cache_dir: &Path, target: &Path) -> io::Result<()> {
    let bytes = encode_png(img).map_err(io::Error::other)?;
    fs::create_dir_all(cache_dir)?;

    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = cache_dir.join(format!(".thumb-{}-{seq}.tmp", std::process::id()));
    fs::write(&tmp, &bytes)?;
    if let Err(err) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// On-demand lookups for a presentation layer, memoized per fingerprint.
#[derive(Debug)]
pub struct ThumbnailCache {
    dir: PathBuf,
    max_source_bytes: u64,
    known: Mutex<HashMap<Fingerprint, Option<PathBuf>>>,
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>, max_source_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_source_bytes,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached preview for `path`, producing it when missing. `None` when the
    /// source was skipped; that answer is remembered too. A remembered entry
    /// that was flushed from disk is produced again.
    pub fn thumbnail_for(&self, path: &Path) -> Option<PathBuf> {
        let key = cache_key(path);
        match self.known.lock().get(&key) {
            Some(Some(entry)) if entry.is_file() => return Some(entry.clone()),
            Some(None) => return None,
            _ => {}
        }

        let status = ensure_with_key(path, &key, &self.dir, self.max_source_bytes);
        let entry = status.path().map(Path::to_path_buf);
        self.known.lock().insert(key, entry.clone());
        entry
    }
}

#[derive(Debug, Clone)]
pub struct WarmOptions {
    pub concurrency: usize,
    pub max_source_bytes: u64,
}

impl Default for WarmOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::config::DEFAULT_WORKERS,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmStats {
    pub total: usize,
    pub hits: usize,
    pub created: usize,
    pub skipped: usize,
}

impl WarmStats {
    /// Entries present after the run, whether found or produced.
    pub fn cached(&self) -> usize {
        self.hits + self.created
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    Completed(WarmStats),
    Canceled(WarmStats),
}

impl WarmOutcome {
    pub fn stats(&self) -> &WarmStats {
        match self {
            Self::Completed(stats) | Self::Canceled(stats) => stats,
        }
    }
}

/// Bulk pre-warming over a worker pool. Per-file problems count as skips.
pub fn warm_cache<P>(
    paths: &[P],
    cache_dir: &Path,
    options: &WarmOptions,
    cancel: &CancelToken,
    mut on_progress: impl FnMut(Progress<'_>),
) -> Result<WarmOutcome, ThumbError>
where
    P: AsRef<Path> + Sync,
{
    fs::create_dir_all(cache_dir).map_err(|source| ThumbError::CacheDir {
        path: cache_dir.to_path_buf(),
        source,
    })?;

    let mut stats = WarmStats {
        total: paths.len(),
        ..WarmStats::default()
    };
    let mut completed = 0usize;

    let exit = run_pool(
        paths,
        options.concurrency,
        cancel,
        |path| ensure_thumbnail(path.as_ref(), cache_dir, options.max_source_bytes),
        |path, status| {
            completed += 1;
            on_progress(Progress {
                completed,
                total: stats.total,
                path: path.as_ref(),
            });
            match status {
                ThumbStatus::Hit(_) => stats.hits += 1,
                ThumbStatus::Cached(_) => stats.created += 1,
                ThumbStatus::Skipped(_) => stats.skipped += 1,
            }
            ControlFlow::<std::convert::Infallible>::Continue(())
        },
    );

    let outcome = match exit {
        PoolExit::Drained => WarmOutcome::Completed(stats),
        PoolExit::Canceled => WarmOutcome::Canceled(stats),
        PoolExit::Broke(never) => match never {},
    };
    info!(
        total = stats.total,
        hits = stats.hits,
        created = stats.created,
        skipped = stats.skipped,
        canceled = matches!(outcome, WarmOutcome::Canceled(_)),
        "thumbnail warm finished"
    );
    Ok(outcome)
}

/// Deletes every file in the cache directory. Returns how many were removed.
pub fn clear_cache(cache_dir: &Path) -> Result<usize, ThumbError> {
    let clear_err = |source: io::Error| ThumbError::Clear {
        path: cache_dir.to_path_buf(),
        source,
    };
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(clear_err(err)),
    };

    let mut removed = 0usize;
    for entry in entries {
        let entry = entry.map_err(clear_err)?;
        if entry.file_type().map_err(clear_err)?.is_file() {
            fs::remove_file(entry.path()).map_err(clear_err)?;
            removed += 1;
        }
    }
    info!(dir = %cache_dir.display(), removed, "thumbnail cache cleared");
    Ok(removed)
}
