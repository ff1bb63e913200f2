use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of the persistent store itself. Fatal for the running operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create index directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("index store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// The full-text engine rejected the query text.
    #[error("malformed search query {query:?}: {message}")]
    Syntax { query: String, message: String },

    #[error("search failed: {0}")]
    Store(#[from] rusqlite::Error),
}

impl SearchError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

/// Rebuild failures. Cancellation is not an error; see `IndexOutcome`.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("rebuild failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to write snapshot {}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(err))
    }
}

#[derive(Debug, Error)]
pub enum ThumbError {
    #[error("failed to create thumbnail cache {}", path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to clear thumbnail cache {}", path.display())]
    Clear {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
