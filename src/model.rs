use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Tag name -> value, in the order the extractor produced them.
pub type Metadata = IndexMap<String, String>;

/// One file's extraction result, handed from a worker to the writer once.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedImage {
    pub path: String,
    pub filename: String,
    pub mtime: f64,
    pub size: u64,
    pub metadata: Metadata,
    pub metadata_text: String,
}

/// A persisted row of the primary table.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub mtime: f64,
    pub size: u64,
    pub metadata_json: String,
}

impl ImageRecord {
    pub fn metadata(&self) -> serde_json::Result<Metadata> {
        serde_json::from_str(&self.metadata_json)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub metadata_json: String,
}

impl SearchResult {
    /// Parsed tags for a detail view of the selected result.
    pub fn metadata(&self) -> serde_json::Result<Metadata> {
        serde_json::from_str(&self.metadata_json)
    }
}

/// One page of results plus the total match count, for "X of Y" displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub results: Vec<SearchResult>,
    pub total: u64,
    pub offset: usize,
}

impl SearchPage {
    pub fn has_more(&self) -> bool {
        (self.offset + self.results.len()) < self.total as usize
    }
}

/// Snapshot document entry, written after a completed rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub path: String,
    pub filename: String,
    pub mtime: f64,
    pub size: u64,
    pub metadata: serde_json::Value,
}

impl From<ImageRecord> for ExportRecord {
    fn from(record: ImageRecord) -> Self {
        let metadata = serde_json::from_str(&record.metadata_json)
            .unwrap_or(serde_json::Value::String(record.metadata_json));
        Self {
            path: record.path,
            filename: record.filename,
            mtime: record.mtime,
            size: record.size,
            metadata,
        }
    }
}
