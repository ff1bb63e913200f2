//! Image metadata indexer: folder walk, metadata extraction on a worker
//! pool, SQLite FTS5 search and a thumbnail cache.

pub mod config;
pub mod error;
pub mod extract;
pub mod finder;
pub mod indexer;
pub mod model;
pub mod pool;
pub mod repository;
pub mod thumbs;

pub use config::Config;
pub use error::{IndexError, SearchError, StoreError, ThumbError};
pub use extract::{
    default_extractor, metadata_to_text, CompositeExtractor, ContainerInspector, DefaultExtractor,
    ExifToolExtractor, MetadataExtractor,
};
pub use finder::{is_image_file, ImageFinder, IMAGE_EXTENSIONS};
pub use indexer::{IndexOptions, IndexOutcome, IndexerService};
pub use model::{ExportRecord, ImageRecord, IndexedImage, Metadata, SearchPage, SearchResult};
pub use pool::{CancelToken, Progress};
pub use repository::{ImageIndexRepository, IndexReader, Rebuild};
pub use thumbs::{
    cache_key, cache_path, clear_cache, ensure_thumbnail, warm_cache, Fingerprint, SkipReason,
    ThumbStatus, ThumbnailCache, WarmOptions, WarmOutcome, WarmStats,
};
