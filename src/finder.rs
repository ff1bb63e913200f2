use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "tif", "tiff", "png", "bmp", "gif", "webp"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Enumerates image files below a set of root folders.
///
/// Every call to [`ImageFinder::iter_images`] performs a fresh walk. Roots
/// that do not exist are skipped. Order is whatever the directory
/// traversal yields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFinder;

impl ImageFinder {
    pub fn new() -> Self {
        Self
    }

    pub fn iter_images<'a>(&self, folders: &'a [PathBuf]) -> impl Iterator<Item = PathBuf> + 'a {
        folders
            .iter()
            .filter(|folder| folder.is_dir())
            .map(|folder| std::path::absolute(folder).unwrap_or_else(|_| folder.clone()))
            .flat_map(|root| {
                WalkDir::new(root)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(err) => {
                            debug!(error = %err, "walk entry skipped");
                            None
                        }
                    })
                    .filter(is_candidate_file)
                    .map(DirEntry::into_path)
                    .filter(|path| is_image_file(path))
            })
    }
}

fn is_candidate_file(entry: &DirEntry) -> bool {
    let file_type = entry.file_type();
    file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())
}
