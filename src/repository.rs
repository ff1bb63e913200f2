//! SQLite-backed image index.
//!
//! `images` is the primary table, `images_fts` an FTS5 projection over
//! `(path, filename, metadata_text)` joined on `images_fts.rowid = images.id`.
//! Only [`ImageIndexRepository`] holds a writable connection and every write
//! goes through `&mut self`; [`IndexReader`] is a read-only view for other
//! threads.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OpenFlags, Row, Transaction};
use tracing::{debug, info};

use crate::error::{SearchError, StoreError};
use crate::extract::metadata_to_text;
use crate::model::{ImageRecord, IndexedImage, Metadata, SearchPage, SearchResult};

const SCHEMA_VERSION: i32 = 1;

type StoreResult<T> = Result<T, StoreError>;

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        PRAGMA busy_timeout=3000;
        "#,
    )
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version != SCHEMA_VERSION {
        conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS images_fts;
            DROP TABLE IF EXISTS images;
            "#,
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS images (
          id INTEGER PRIMARY KEY,
          path TEXT NOT NULL UNIQUE,
          filename TEXT NOT NULL,
          mtime REAL NOT NULL,
          size INTEGER NOT NULL,
          metadata_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_images_filename ON images(filename);

        CREATE VIRTUAL TABLE IF NOT EXISTS images_fts
        USING fts5(path, filename, metadata_text);
        "#,
    )
}

fn upsert_image(conn: &Connection, image: &IndexedImage) -> StoreResult<i64> {
    let metadata_json = serde_json::to_string(&image.metadata).unwrap_or_else(|_| "{}".into());
    conn.execute(
        r#"
        INSERT INTO images(path, filename, mtime, size, metadata_json)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(path) DO UPDATE SET
          filename = excluded.filename,
          mtime = excluded.mtime,
          size = excluded.size,
          metadata_json = excluded.metadata_json
        "#,
        params![
            image.path,
            image.filename,
            image.mtime,
            image.size as i64,
            metadata_json
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM images WHERE path = ?1",
        params![image.path],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO images_fts(rowid, path, filename, metadata_text) VALUES(?1, ?2, ?3, ?4)",
        params![id, image.path, image.filename, image.metadata_text],
    )?;
    Ok(id)
}

fn delete_missing_in(conn: &Connection, seen: &HashSet<String>) -> StoreResult<usize> {
    let stale: Vec<i64> = {
        let mut stmt = conn.prepare("SELECT id, path FROM images")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut stale = Vec::new();
        for row in rows {
            let (id, path) = row?;
            if !seen.contains(&path) {
                stale.push(id);
            }
        }
        stale
    };

    let mut delete_fts = conn.prepare("DELETE FROM images_fts WHERE rowid = ?1")?;
    let mut delete_image = conn.prepare("DELETE FROM images WHERE id = ?1")?;
    for id in &stale {
        delete_fts.execute(params![id])?;
        delete_image.execute(params![id])?;
    }
    Ok(stale.len())
}

/// Re-derives search entries for primary rows that currently have none.
fn restore_search_entries_in(conn: &Connection) -> StoreResult<usize> {
    let missing: Vec<(i64, String, String, String)> = {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, path, filename, metadata_json
            FROM images
            WHERE id NOT IN (SELECT rowid FROM images_fts)
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut insert = conn.prepare(
        "INSERT INTO images_fts(rowid, path, filename, metadata_text) VALUES(?1, ?2, ?3, ?4)",
    )?;
    for (id, path, filename, metadata_json) in &missing {
        let text = match serde_json::from_str::<Metadata>(metadata_json) {
            Ok(metadata) => metadata_to_text(&metadata),
            Err(_) => metadata_json.clone(),
        };
        insert.execute(params![id, path, filename, text])?;
    }
    Ok(missing.len())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        mtime: row.get(3)?,
        size: row.get::<_, i64>(4)?.max(0) as u64,
        metadata_json: row.get(5)?,
    })
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<SearchResult> {
    Ok(SearchResult {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        metadata_json: row.get(3)?,
    })
}

fn sql_int(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Messages the fts5 query parser produces for malformed query text.
const QUERY_ERROR_PREFIXES: &[&str] = &[
    "fts5:",
    "no such column",
    "unterminated string",
    "unknown special query",
];

/// Only errors raised by the fts5 query parser are syntax errors; anything
/// else (missing tables, I/O, corruption) is a store failure.
fn classify_search_error(err: rusqlite::Error, query: &str) -> SearchError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        let from_parser = QUERY_ERROR_PREFIXES
            .iter()
            .any(|prefix| message.starts_with(prefix));
        if failure.code == ErrorCode::Unknown && from_parser {
            return SearchError::Syntax {
                query: query.to_string(),
                message: message.clone(),
            };
        }
    }
    SearchError::Store(err)
}

fn search_in(
    conn: &Connection,
    query: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<SearchResult>, SearchError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, path, filename, metadata_json
            FROM images
            ORDER BY filename, path
            LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let rows = stmt.query_map(params![sql_int(limit), sql_int(offset)], row_to_result)?;
        return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
    }

    let mut stmt = conn.prepare(
        r#"
        SELECT images.id, images.path, images.filename, images.metadata_json
        FROM images_fts
        JOIN images ON images_fts.rowid = images.id
        WHERE images_fts MATCH ?1
        ORDER BY bm25(images_fts), images.id
        LIMIT ?2 OFFSET ?3
        "#,
    )?;
    let rows = stmt
        .query_map(params![trimmed, sql_int(limit), sql_int(offset)], row_to_result)
        .map_err(|e| classify_search_error(e, trimmed))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| classify_search_error(e, trimmed))
}

fn count_in(conn: &Connection, query: &str) -> Result<u64, SearchError> {
    let trimmed = query.trim();
    let count: i64 = if trimmed.is_empty() {
        conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?
    } else {
        conn.query_row(
            "SELECT COUNT(*) FROM images_fts WHERE images_fts MATCH ?1",
            params![trimmed],
            |row| row.get(0),
        )
        .map_err(|e| classify_search_error(e, trimmed))?
    };
    Ok(count.max(0) as u64)
}

fn search_page_in(
    conn: &Connection,
    query: &str,
    limit: usize,
    offset: usize,
) -> Result<SearchPage, SearchError> {
    let total = count_in(conn, query)?;
    let results = search_in(conn, query, limit, offset)?;
    Ok(SearchPage {
        results,
        total,
        offset,
    })
}

fn all_records_in(conn: &Connection) -> StoreResult<Vec<ImageRecord>> {
    let mut stmt =
        conn.prepare("SELECT id, path, filename, mtime, size, metadata_json FROM images")?;
    let rows = stmt.query_map([], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn count_rows(conn: &Connection, table: &str) -> StoreResult<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count.max(0) as u64)
}

/// The single writer of the index database.
pub struct ImageIndexRepository {
    conn: Connection,
    db_path: PathBuf,
}

impl ImageIndexRepository {
    /// Opens (creating when needed) the database and brings its schema up to date.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&db_path)?;
        apply_pragmas(&conn)?;
        init_schema(&conn)?;
        info!(db = %db_path.display(), "index database ready");

        Ok(Self { conn, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn upsert(&mut self, image: &IndexedImage) -> StoreResult<i64> {
        let tx = self.conn.transaction()?;
        let id = upsert_image(&tx, image)?;
        tx.commit()?;
        Ok(id)
    }

    /// Removes every record whose path is not in `seen`, from both tables.
    pub fn delete_missing(&mut self, seen: &HashSet<String>) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        let removed = delete_missing_in(&tx, seen)?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn clear_all(&mut self) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM images_fts;
            DELETE FROM images;
            "#,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Starts a full rebuild: one transaction that begins with an empty
    /// search index. Dropping the returned value without committing rolls
    /// everything back.
    pub fn begin_rebuild(&mut self) -> StoreResult<Rebuild<'_>> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM images_fts", [])?;
        Ok(Rebuild { tx })
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        search_in(&self.conn, query, limit, offset)
    }

    pub fn count(&self, query: &str) -> Result<u64, SearchError> {
        count_in(&self.conn, query)
    }

    pub fn search_page(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchPage, SearchError> {
        search_page_in(&self.conn, query, limit, offset)
    }

    pub fn all_records(&self) -> StoreResult<Vec<ImageRecord>> {
        all_records_in(&self.conn)
    }

    pub fn record_id(&self, path: &str) -> StoreResult<Option<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM images WHERE path = ?1")?;
        let mut rows = stmt.query(params![path])?;
        Ok(match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        })
    }

    pub fn record_count(&self) -> StoreResult<u64> {
        count_rows(&self.conn, "images")
    }

    pub fn search_entry_count(&self) -> StoreResult<u64> {
        count_rows(&self.conn, "images_fts")
    }
}

impl std::fmt::Debug for ImageIndexRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageIndexRepository")
            .field("db_path", &self.db_path)
            .finish()
    }
}

/// An in-progress full rebuild.
pub struct Rebuild<'a> {
    tx: Transaction<'a>,
}

impl Rebuild<'_> {
    pub fn upsert(&mut self, image: &IndexedImage) -> StoreResult<i64> {
        upsert_image(&self.tx, image)
    }

    pub fn delete_missing(&mut self, seen: &HashSet<String>) -> StoreResult<usize> {
        delete_missing_in(&self.tx, seen)
    }

    /// Used when a run stops early: records that were not re-upserted get
    /// their search entries back so the index stays 1:1 with the table.
    pub fn restore_search_entries(&mut self) -> StoreResult<usize> {
        let restored = restore_search_entries_in(&self.tx)?;
        debug!(restored, "search entries restored");
        Ok(restored)
    }

    pub fn commit(self) -> StoreResult<()> {
        self.tx.commit()?;
        Ok(())
    }
}

/// Read-only view of the index, safe to use while a rebuild runs elsewhere.
pub struct IndexReader {
    conn: Connection,
}

impl IndexReader {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(3000))?;
        Ok(Self { conn })
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        search_in(&self.conn, query, limit, offset)
    }

    pub fn count(&self, query: &str) -> Result<u64, SearchError> {
        count_in(&self.conn, query)
    }

    pub fn search_page(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchPage, SearchError> {
        search_page_in(&self.conn, query, limit, offset)
    }

    pub fn all_records(&self) -> StoreResult<Vec<ImageRecord>> {
        all_records_in(&self.conn)
    }
}
