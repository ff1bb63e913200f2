use std::path::PathBuf;

use tracing::warn;

use crate::thumbs::DEFAULT_MAX_SOURCE_BYTES;

pub const DEFAULT_WORKERS: usize = 12;
pub const DEFAULT_PAGE_SIZE: usize = 100;
const APP_DIR: &str = "picindex";

pub const ENV_DB: &str = "PICINDEX_DB";
pub const ENV_THUMB_DIR: &str = "PICINDEX_THUMB_DIR";
pub const ENV_WORKERS: &str = "PICINDEX_WORKERS";
pub const ENV_MAX_THUMB_BYTES: &str = "PICINDEX_MAX_THUMB_BYTES";
pub const ENV_EXIFTOOL: &str = "PICINDEX_EXIFTOOL";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub thumb_dir: PathBuf,
    pub workers: usize,
    pub max_thumb_bytes: u64,
    pub page_size: usize,
    pub exiftool: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        Self {
            db_path: data_dir.join("index.db"),
            thumb_dir: cache_dir.join("thumbs"),
            workers: DEFAULT_WORKERS,
            max_thumb_bytes: DEFAULT_MAX_SOURCE_BYTES,
            page_size: DEFAULT_PAGE_SIZE,
            exiftool: PathBuf::from("exiftool"),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Applies `PICINDEX_*` overrides from `lookup`. Blank values are ignored,
    /// unparsable numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = lookup(ENV_DB) {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_THUMB_DIR) {
            self.thumb_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_EXIFTOOL) {
            self.exiftool = PathBuf::from(value);
        }
        if let Some(workers) = parse_number::<usize>(ENV_WORKERS, lookup(ENV_WORKERS)) {
            self.workers = workers.max(1);
        }
        if let Some(bytes) = parse_number::<u64>(ENV_MAX_THUMB_BYTES, lookup(ENV_MAX_THUMB_BYTES)) {
            self.max_thumb_bytes = bytes;
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "ignoring unparsable setting");
            None
        }
    }
}
