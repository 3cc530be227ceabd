//! Document store backed by SQLite.
//!
//! Two tables: `documents` and `chunks` (cascading on document delete).
//! Every mutation runs in a single transaction. The connection sits behind a
//! mutex and all methods are blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use ulid::Ulid;

use super::chunker::Chunk;
use super::embeddings::Embedding;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Document {0} has no content")]
    EmptyContent(String),
    #[error("Chunk {chunk_id} does not belong to document {document_id}")]
    ChunkOwnership { chunk_id: String, document_id: String },
    #[error("Chunk {0} has no embedding")]
    MissingEmbedding(String),
    #[error("Corrupt embedding for chunk {chunk_id}: expected {expected} values, found {actual}")]
    CorruptEmbedding { chunk_id: String, expected: usize, actual: usize },
    #[error("Embedding dimension mismatch: corpus has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid timestamp {0}")]
    InvalidTimestamp(String),
    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored document with its chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    /// Display name
    pub name: String,
    /// Opaque reference to the source (usually a file path)
    pub path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

impl Document {
    pub fn new(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            name: name.into(),
            path: path.into(),
            content: content.into(),
            created_at: Utc::now(),
            chunks: Vec::new(),
        }
    }

    pub fn info(&self) -> DocumentInfo {
        DocumentInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            created_at: self.created_at,
            chunk_count: self.chunks.len(),
        }
    }

    /// Embedding dimension of the first chunk, if any
    pub fn dimensions(&self) -> Option<usize> {
        self.chunks.first().map(|c| c.embedding.len())
    }
}

/// Document metadata without content or chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub dimensions: Option<usize>,
}

/// SQLite-backed store for documents, chunks and embeddings
pub struct DocumentStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl DocumentStore {
    /// Open or create the store at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, Some(db_path))
    }

    /// Non-persistent store, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                start_index INTEGER NOT NULL,
                end_index INTEGER NOT NULL,
                -- little-endian f32 values
                embedding BLOB NOT NULL,
                dimensions INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at);
            "#,
        )?;

        debug!(path = ?db_path, "Document store ready");
        Ok(Self { conn: Mutex::new(conn), db_path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Upsert a document and replace its chunk set in one transaction
    pub fn store(&self, document: &Document) -> Result<()> {
        validate_document(document)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(actual) = document.dimensions() {
            if let Some(expected) = corpus_dimensions(&tx, Some(document.id.as_str()))? {
                if expected != actual {
                    return Err(StoreError::DimensionMismatch { expected, actual });
                }
            }
        }

        tx.execute(
            "INSERT INTO documents (id, name, path, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                path = excluded.path,
                content = excluded.content,
                created_at = excluded.created_at",
            params![
                document.id,
                document.name,
                document.path,
                document.content,
                encode_timestamp(&document.created_at),
            ],
        )?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document.id])?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO chunks (id, document_id, chunk_index, content, start_index, end_index, embedding, dimensions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for chunk in &document.chunks {
                insert.execute(params![
                    chunk.id,
                    chunk.document_id,
                    chunk.index,
                    chunk.content,
                    chunk.start_index as i64,
                    chunk.end_index as i64,
                    encode_embedding(&chunk.embedding),
                    chunk.embedding.len() as i64,
                ])?;
            }
        }

        tx.commit()?;
        info!(doc_id = %document.id, chunks = document.chunks.len(), "Stored document");
        Ok(())
    }

    /// All documents, newest first, fully hydrated
    pub fn get_all(&self) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, path, content, created_at FROM documents
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([], read_document_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| row.hydrate(&conn))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Document> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, path, content, created_at FROM documents WHERE id = ?1",
                params![id],
                read_document_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.hydrate(&conn)
    }

    /// Metadata for every document, newest first
    pub fn list(&self) -> Result<Vec<DocumentInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.name, d.path, d.created_at,
                    (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id)
             FROM documents d
             ORDER BY d.created_at DESC, d.rowid DESC",
        )?;
        let infos = stmt
            .query_map([], read_info_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        infos.into_iter().collect()
    }

    /// Remove a document and its chunks
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let chunks = tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit()?;
        info!(doc_id = %id, chunks, "Deleted document");
        Ok(())
    }

    pub fn count_documents(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let documents = self.count_documents()?;
        let chunks = self.count_chunks()?;
        let conn = self.conn.lock();
        let dimensions = corpus_dimensions(&conn, None)?;
        Ok(StoreStats { documents, chunks, dimensions })
    }

    /// Delete everything
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks", [])?;
        tx.execute("DELETE FROM documents", [])?;
        tx.commit()?;
        info!("Cleared document store");
        Ok(())
    }

    /// Every chunk in storage order, each with its owner's metadata
    pub fn search_candidates(&self) -> Result<Vec<(Chunk, DocumentInfo)>> {
        let infos: HashMap<String, DocumentInfo> = self
            .list()?
            .into_iter()
            .map(|info| (info.id.clone(), info))
            .collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY rowid", SELECT_CHUNKS))?;
        let chunks = stmt
            .query_map([], read_chunk_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        chunks
            .into_iter()
            .map(|raw| {
                let chunk = raw.decode()?;
                let info = infos
                    .get(&chunk.document_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(chunk.document_id.clone()))?;
                Ok((chunk, info))
            })
            .collect()
    }

    /// Overwrite embeddings for existing chunks in one transaction.
    ///
    /// All vectors must share a dimension; afterwards the whole corpus has it.
    pub fn replace_embeddings(&self, updates: &[(String, Embedding)]) -> Result<()> {
        let expected = match updates.first() {
            Some((_, embedding)) => embedding.len(),
            None => return Ok(()),
        };
        if expected == 0 {
            return Err(StoreError::MissingEmbedding(updates[0].0.clone()));
        }
        if let Some((_, bad)) = updates.iter().find(|(_, e)| e.len() != expected) {
            return Err(StoreError::DimensionMismatch { expected, actual: bad.len() });
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut update = tx.prepare("UPDATE chunks SET embedding = ?1, dimensions = ?2 WHERE id = ?3")?;
            for (chunk_id, embedding) in updates {
                let changed = update.execute(params![
                    encode_embedding(embedding),
                    embedding.len() as i64,
                    chunk_id,
                ])?;
                if changed == 0 {
                    return Err(StoreError::NotFound(chunk_id.clone()));
                }
            }
        }

        // Every chunk must be covered; report the first width left behind
        let stale: Option<i64> = tx
            .query_row(
                "SELECT dimensions FROM chunks WHERE dimensions != ?1 LIMIT 1",
                params![expected as i64],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(actual) = stale {
            return Err(StoreError::DimensionMismatch { expected, actual: actual as usize });
        }

        tx.commit()?;
        info!(chunks = updates.len(), dimensions = expected, "Replaced embeddings");
        Ok(())
    }
}

const SELECT_CHUNKS: &str =
    "SELECT id, document_id, chunk_index, content, start_index, end_index, embedding, dimensions FROM chunks";

fn validate_document(document: &Document) -> Result<()> {
    if document.content.trim().is_empty() {
        return Err(StoreError::EmptyContent(document.id.clone()));
    }

    let mut dimensions = None;
    for chunk in &document.chunks {
        if chunk.document_id != document.id {
            return Err(StoreError::ChunkOwnership {
                chunk_id: chunk.id.clone(),
                document_id: document.id.clone(),
            });
        }
        if chunk.embedding.is_empty() {
            return Err(StoreError::MissingEmbedding(chunk.id.clone()));
        }
        match dimensions {
            None => dimensions = Some(chunk.embedding.len()),
            Some(expected) if expected != chunk.embedding.len() => {
                return Err(StoreError::DimensionMismatch { expected, actual: chunk.embedding.len() });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Dimension of stored chunks, ignoring `exclude_document`
fn corpus_dimensions(conn: &Connection, exclude_document: Option<&str>) -> Result<Option<usize>> {
    let dims: Option<i64> = conn
        .query_row(
            "SELECT dimensions FROM chunks WHERE document_id != ?1 LIMIT 1",
            params![exclude_document.unwrap_or("")],
            |row| row.get(0),
        )
        .optional()?;
    Ok(dims.map(|d| d as usize))
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches chronological order
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(chunk_id: &str, blob: &[u8], expected: usize) -> Result<Embedding> {
    if blob.len() % 4 != 0 || blob.len() / 4 != expected {
        return Err(StoreError::CorruptEmbedding {
            chunk_id: chunk_id.to_string(),
            expected,
            actual: blob.len() / 4,
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

struct DocumentRow {
    id: String,
    name: String,
    path: String,
    content: String,
    created_at: String,
}

impl DocumentRow {
    fn hydrate(self, conn: &Connection) -> Result<Document> {
        let mut stmt = conn.prepare(&format!("{} WHERE document_id = ?1 ORDER BY chunk_index", SELECT_CHUNKS))?;
        let chunks = stmt
            .query_map(params![self.id], read_chunk_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(ChunkRow::decode)
            .collect::<Result<Vec<_>>>()?;

        Ok(Document {
            created_at: decode_timestamp(&self.created_at)?,
            id: self.id,
            name: self.name,
            path: self.path,
            content: self.content,
            chunks,
        })
    }
}

fn read_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn read_info_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<DocumentInfo>> {
    let created_at: String = row.get(3)?;
    let chunk_count: i64 = row.get(4)?;
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let path: String = row.get(2)?;
    Ok(decode_timestamp(&created_at).map(|created_at| DocumentInfo {
        id,
        name,
        path,
        created_at,
        chunk_count: chunk_count as usize,
    }))
}

struct ChunkRow {
    id: String,
    document_id: String,
    index: u32,
    content: String,
    start_index: i64,
    end_index: i64,
    embedding: Vec<u8>,
    dimensions: i64,
}

impl ChunkRow {
    fn decode(self) -> Result<Chunk> {
        let embedding = decode_embedding(&self.id, &self.embedding, self.dimensions as usize)?;
        Ok(Chunk {
            id: self.id,
            document_id: self.document_id,
            index: self.index,
            content: self.content,
            start_index: self.start_index as usize,
            end_index: self.end_index as usize,
            embedding,
        })
    }
}

fn read_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        index: row.get(2)?,
        content: row.get(3)?,
        start_index: row.get(4)?,
        end_index: row.get(5)?,
        embedding: row.get(6)?,
        dimensions: row.get(7)?,
    })
}
