//! SQLite-backed Memory Store (component D).
//!
//! Separate reader/writer connections give every method `&self` (not
//! `&mut self`), so `Storage` is `Send + Sync` and callers share it behind
//! an `Arc` rather than an `Arc<Mutex<Storage>>>`. Dense vector search is
//! served by an in-process [`VectorIndex`] per user, rebuilt from the
//! `chunks`/`memory_summaries` tables at startup; SQLite itself only ever
//! sees the embedding as an opaque BLOB.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::embeddings::Embedding;
use crate::model::{
    AccessKind, Chunk, Conversation, ContentType, Memory, MemorySummary, MemoryType, Message,
    Role, UserPreference, WebSource,
};
use crate::search::{ChunkCandidate, VectorIndex, VectorIndexConfig};

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vector index error: {0}")]
    VectorIndex(String),
    #[error("initialization error: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    chunk_indexes: Mutex<HashMap<Uuid, VectorIndex>>,
    summary_indexes: Mutex<HashMap<Uuid, VectorIndex>>,
    dim: usize,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Opens (creating if needed) the database at `db_path`, or the
    /// platform default data directory when `None`.
    pub fn new(db_path: Option<PathBuf>, dim: usize) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("rs", "memoria", "memoria")
                    .ok_or_else(|| StorageError::Init("could not determine data directory".to_string()))?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700));
                }
                data_dir.join("memoria.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        let storage = Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            chunk_indexes: Mutex::new(HashMap::new()),
            summary_indexes: Mutex::new(HashMap::new()),
            dim,
        };
        storage.load_indexes()?;
        Ok(storage)
    }

    /// In-memory instance for tests. Uses a named shared-cache URI so the
    /// reader and writer connections see the same database; the writer
    /// connection keeps it alive for the lifetime of `Storage`.
    pub fn open_in_memory(dim: usize) -> Result<Self> {
        let uri = format!("file:memoria-{}?mode=memory&cache=shared", Uuid::new_v4());
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI;

        let writer_conn = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            chunk_indexes: Mutex::new(HashMap::new()),
            summary_indexes: Mutex::new(HashMap::new()),
            dim,
        })
    }

    fn new_index(&self) -> Result<VectorIndex> {
        VectorIndex::with_config(VectorIndexConfig { dimensions: self.dim, ..VectorIndexConfig::default() })
            .map_err(|e| StorageError::VectorIndex(e.to_string()))
    }

    fn load_indexes(&self) -> Result<()> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;

        let mut stmt = reader.prepare(
            "SELECT c.id, m.user_id, c.embedding FROM chunks c JOIN memories m ON m.id = c.memory_id",
        )?;
        let rows: Vec<(String, String, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut indexes = self.chunk_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
        for (chunk_id, user_id, blob) in rows {
            let Some(user_id) = Uuid::parse_str(&user_id).ok() else { continue };
            let Some(embedding) = Embedding::from_bytes(&blob) else { continue };
            let index = indexes.entry(user_id).or_insert(self.new_index()?);
            let _ = index.add(&chunk_id, &embedding.vector);
        }
        drop(indexes);

        let mut stmt = reader.prepare("SELECT id, user_id, embedding FROM memory_summaries")?;
        let rows: Vec<(String, String, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut indexes = self.summary_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
        for (summary_id, user_id, blob) in rows {
            let Some(user_id) = Uuid::parse_str(&user_id).ok() else { continue };
            let Some(embedding) = Embedding::from_bytes(&blob) else { continue };
            let index = indexes.entry(user_id).or_insert(self.new_index()?);
            let _ = index.add(&summary_id, &embedding.vector);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory (D: create_memory, get_memories, delete_memory, search_dense)
    // ------------------------------------------------------------------

    /// Idempotently inserts a `users` row for `user_id` if one doesn't
    /// already exist, so `memories`/`conversations`/`user_preferences`
    /// foreign keys never fail for a user seen for the first time. There is
    /// no registration flow (spec places auth out of scope), so
    /// `credential_hash` is left empty.
    fn ensure_user(conn: &Connection, user_id: Uuid) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO users (id, credential_hash, created_at) VALUES (?1, ?2, ?3)",
            params![user_id.to_string(), "", Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Inserts `memory` and `chunks` in one transaction. Rolls back if any
    /// row fails to insert (e.g. an upstream embedding error left a chunk
    /// malformed).
    pub fn create_memory(&self, memory: &Memory, chunks: &[Chunk]) -> Result<()> {
        let mut writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        let tx = writer.transaction()?;

        Self::ensure_user(&tx, memory.user_id)?;

        tx.execute(
            "INSERT INTO memories (id, user_id, content_type, content, meta, blob_ref, created_at, last_accessed, memory_type, importance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                memory.id.to_string(),
                memory.user_id.to_string(),
                memory.content_type.as_str(),
                memory.content,
                memory.meta.to_string(),
                memory.blob_ref,
                memory.created_at.to_rfc3339(),
                memory.last_accessed.to_rfc3339(),
                memory.memory_type.as_str(),
                memory.importance,
            ],
        )?;

        for (expected_index, chunk) in chunks.iter().enumerate() {
            if chunk.chunk_index as usize != expected_index {
                return Err(StorageError::Validation(format!(
                    "chunk_index {} out of order, expected {}",
                    chunk.chunk_index, expected_index
                )));
            }
            if chunk.embedding.len() != self.dim {
                return Err(StorageError::Validation(format!(
                    "chunk embedding has {} dims, expected {}",
                    chunk.embedding.len(),
                    self.dim
                )));
            }
            let embedding = Embedding::new(chunk.embedding.clone());
            tx.execute(
                "INSERT INTO chunks (id, memory_id, chunk_index, text, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.id.to_string(),
                    chunk.memory_id.to_string(),
                    chunk.chunk_index,
                    chunk.text,
                    embedding.to_bytes(),
                ],
            )?;
        }

        tx.commit()?;
        drop(writer);

        let mut indexes = self.chunk_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
        let index = indexes.entry(memory.user_id).or_insert(self.new_index()?);
        for chunk in chunks {
            let _ = index.add(&chunk.id.to_string(), &chunk.embedding);
        }

        Ok(())
    }

    pub fn get_memories(&self, user_id: Uuid, skip: usize, limit: usize) -> Result<(Vec<Memory>, usize)> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;

        let total: usize = reader.query_row(
            "SELECT count(*) FROM memories WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;

        let mut stmt = reader.prepare(
            "SELECT id, user_id, content_type, content, meta, blob_ref, created_at, last_accessed, memory_type, importance
             FROM memories WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string(), limit as i64, skip as i64], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((rows, total))
    }

    /// Deletes a memory, cascading to its chunks and access log (FK
    /// `ON DELETE CASCADE`), and removes it from the in-process index.
    pub fn delete_memory(&self, user_id: Uuid, memory_id: Uuid) -> Result<()> {
        let chunk_ids: Vec<String> = {
            let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
            let mut stmt = reader.prepare("SELECT id FROM chunks WHERE memory_id = ?1")?;
            stmt.query_map(params![memory_id.to_string()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        let affected = writer.execute(
            "DELETE FROM memories WHERE id = ?1 AND user_id = ?2",
            params![memory_id.to_string(), user_id.to_string()],
        )?;
        drop(writer);

        if affected == 0 {
            return Err(StorageError::NotFound(format!("memory {memory_id}")));
        }

        let mut indexes = self.chunk_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
        if let Some(index) = indexes.get_mut(&user_id) {
            for chunk_id in chunk_ids {
                let _ = index.remove(&chunk_id);
            }
        }
        Ok(())
    }

    /// Stage 1 dense kNN over a user's chunks, optionally filtered by
    /// content type. `limit` should already be `2 * top_k` per the hybrid
    /// search contract; this function does not apply that multiplier.
    pub fn search_dense(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
        content_type: Option<ContentType>,
    ) -> Result<Vec<ChunkCandidate>> {
        let hits = {
            let indexes = self.chunk_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
            match indexes.get(&user_id) {
                Some(index) => index.search(query_vector, limit).map_err(|e| StorageError::VectorIndex(e.to_string()))?,
                None => return Ok(Vec::new()),
            }
        };
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut candidates = Vec::with_capacity(hits.len());
        for (chunk_id, similarity) in hits {
            let row = reader
                .query_row(
                    "SELECT c.text, c.memory_id, m.content_type, m.meta, m.created_at
                     FROM chunks c JOIN memories m ON m.id = c.memory_id WHERE c.id = ?1",
                    params![chunk_id],
                    |row| {
                        let text: String = row.get(0)?;
                        let memory_id: String = row.get(1)?;
                        let content_type: String = row.get(2)?;
                        let meta: String = row.get(3)?;
                        let created_at: String = row.get(4)?;
                        Ok((text, memory_id, content_type, meta, created_at))
                    },
                )
                .optional()?;

            let Some((text, memory_id, content_type_str, meta, created_at)) = row else { continue };
            let Some(row_content_type) = ContentType::parse_name(&content_type_str) else { continue };
            if let Some(filter) = content_type {
                if filter != row_content_type {
                    continue;
                }
            }

            candidates.push(ChunkCandidate {
                chunk_id: Uuid::parse_str(&chunk_id).map_err(|e| StorageError::Validation(e.to_string()))?,
                memory_id: Uuid::parse_str(&memory_id).map_err(|e| StorageError::Validation(e.to_string()))?,
                chunk_text: text,
                content_type: row_content_type,
                meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                created_at: parse_timestamp(&created_at)?,
                similarity,
            });
        }
        Ok(candidates)
    }

    /// Appends a `MemoryAccess` row and updates `Memory.last_accessed`
    /// atomically. §4.4.6 access logging is best-effort at the caller.
    pub fn log_access(&self, memory_id: Uuid, kind: AccessKind) -> Result<()> {
        let now = Utc::now();
        let mut writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO memory_access (id, memory_id, kind, accessed_at) VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), memory_id.to_string(), kind.as_str(), now.to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE memories SET last_accessed = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), memory_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn access_stats(&self, memory_id: Uuid) -> Result<(i64, Option<DateTime<Utc>>)> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let count: i64 = reader.query_row(
            "SELECT count(*) FROM memory_access WHERE memory_id = ?1",
            params![memory_id.to_string()],
            |row| row.get(0),
        )?;
        let last: Option<String> = reader
            .query_row(
                "SELECT max(accessed_at) FROM memory_access WHERE memory_id = ?1",
                params![memory_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let last_accessed = last.map(|s| parse_timestamp(&s)).transpose()?;
        Ok((count, last_accessed))
    }

    pub fn chunk_embeddings(&self, memory_id: Uuid) -> Result<Vec<Vec<f32>>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut stmt = reader.prepare("SELECT embedding FROM chunks WHERE memory_id = ?1")?;
        let blobs: Vec<Vec<u8>> = stmt
            .query_map(params![memory_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blobs
            .into_iter()
            .filter_map(|b| Embedding::from_bytes(&b))
            .map(|e| e.vector)
            .collect())
    }

    pub fn first_chunk_embedding(&self, memory_id: Uuid) -> Result<Option<Vec<f32>>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT embedding FROM chunks WHERE memory_id = ?1 ORDER BY chunk_index ASC LIMIT 1",
                params![memory_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.and_then(|b| Embedding::from_bytes(&b)).map(|e| e.vector))
    }

    pub fn consolidation_candidates(&self, user_id: Uuid, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Memory>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut stmt = reader.prepare(
            "SELECT m.id, m.user_id, m.content_type, m.content, m.meta, m.blob_ref, m.created_at, m.last_accessed, m.memory_type, m.importance
             FROM memories m
             WHERE m.user_id = ?1 AND m.memory_type = 'episodic' AND m.created_at < ?2
               AND NOT EXISTS (
                 SELECT 1 FROM memory_summaries s
                 WHERE s.user_id = m.user_id
                   AND ',' || s.source_memory_ids || ',' LIKE '%,' || m.id || ',%'
               )
             ORDER BY m.created_at ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string(), cutoff.to_rfc3339(), limit as i64], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_summary(&self, summary: &MemorySummary) -> Result<()> {
        let source_ids = summary.source_memory_ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
        let embedding = Embedding::new(summary.embedding.clone());

        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        writer.execute(
            "INSERT INTO memory_summaries (id, user_id, text, embedding, source_memory_ids, memory_count, date_range_start, date_range_end, importance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.id.to_string(),
                summary.user_id.to_string(),
                summary.text,
                embedding.to_bytes(),
                source_ids,
                summary.memory_count,
                summary.date_range_start.to_rfc3339(),
                summary.date_range_end.to_rfc3339(),
                summary.importance,
                summary.created_at.to_rfc3339(),
            ],
        )?;
        drop(writer);

        let mut indexes = self.summary_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
        let index = indexes.entry(summary.user_id).or_insert(self.new_index()?);
        let _ = index.add(&summary.id.to_string(), &summary.embedding);
        Ok(())
    }

    pub fn forgetting_candidates(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> Result<Vec<Memory>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut stmt = reader.prepare(
            "SELECT id, user_id, content_type, content, meta, blob_ref, created_at, last_accessed, memory_type, importance
             FROM memories WHERE user_id = ?1 AND created_at < ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string(), cutoff.to_rfc3339()], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn is_referenced_by_summary(&self, memory_id: Uuid) -> Result<bool> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let id = memory_id.to_string();
        let count: i64 = reader.query_row(
            "SELECT count(*) FROM memory_summaries WHERE ',' || source_memory_ids || ',' LIKE '%,' || ?1 || ',%'",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn recent_episodic_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<crate::memory_manager::HierarchicalMatch>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = self.search_dense(user_id, query_vector, limit * 4, None)?;
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;

        let mut matches = Vec::new();
        for candidate in candidates {
            if candidate.created_at < since {
                continue;
            }
            let memory_type: Option<String> = reader
                .query_row(
                    "SELECT memory_type FROM memories WHERE id = ?1 AND user_id = ?2",
                    params![candidate.memory_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(memory_type) = memory_type.as_deref().and_then(MemoryType::parse_name) else { continue };
            if memory_type != MemoryType::Episodic {
                continue;
            }
            matches.push(crate::memory_manager::HierarchicalMatch {
                memory_id: candidate.memory_id,
                content_type: candidate.content_type,
                chunk_text: candidate.chunk_text,
                similarity: candidate.similarity,
                memory_type: MemoryType::Episodic,
                created_at: candidate.created_at,
                meta: candidate.meta,
            });
            if matches.len() >= limit {
                break;
            }
        }
        Ok(matches)
    }

    pub fn summary_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<crate::memory_manager::HierarchicalMatch>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let hits = {
            let indexes = self.summary_indexes.lock().map_err(|_| StorageError::Init("index lock poisoned".into()))?;
            match indexes.get(&user_id) {
                Some(index) => index.search(query_vector, limit).map_err(|e| StorageError::VectorIndex(e.to_string()))?,
                None => return Ok(Vec::new()),
            }
        };

        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut matches = Vec::with_capacity(hits.len());
        for (summary_id, similarity) in hits {
            let row = reader
                .query_row(
                    "SELECT text, memory_count, date_range_start, date_range_end, created_at FROM memory_summaries WHERE id = ?1",
                    params![summary_id],
                    |row| {
                        let text: String = row.get(0)?;
                        let memory_count: i64 = row.get(1)?;
                        let start: String = row.get(2)?;
                        let end: String = row.get(3)?;
                        let created_at: String = row.get(4)?;
                        Ok((text, memory_count, start, end, created_at))
                    },
                )
                .optional()?;
            let Some((text, memory_count, start, end, created_at)) = row else { continue };
            matches.push(crate::memory_manager::HierarchicalMatch {
                memory_id: Uuid::parse_str(&summary_id).map_err(|e| StorageError::Validation(e.to_string()))?,
                content_type: ContentType::Text,
                chunk_text: text,
                similarity,
                memory_type: MemoryType::Semantic,
                created_at: parse_timestamp(&created_at)?,
                meta: serde_json::json!({ "memory_count": memory_count, "date_range": format!("{start} to {end}") }),
            });
        }
        Ok(matches)
    }

    pub fn list_summaries_for_user(&self, user_id: Uuid) -> Result<Vec<MemorySummary>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut stmt = reader.prepare(
            "SELECT id, user_id, text, embedding, source_memory_ids, memory_count, date_range_start, date_range_end, importance, created_at
             FROM memory_summaries WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Deletes `summary_id` if every one of its source memories has
    /// already been deleted (data model lifecycle: a summary is destroyed
    /// when all sources are gone).
    pub fn delete_summary_if_orphaned(&self, summary_id: Uuid) -> Result<bool> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let source_ids: Option<String> = reader
            .query_row(
                "SELECT source_memory_ids FROM memory_summaries WHERE id = ?1",
                params![summary_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(source_ids) = source_ids else { return Ok(false) };

        let remaining: i64 = {
            let ids: Vec<&str> = source_ids.split(',').filter(|s| !s.is_empty()).collect();
            if ids.is_empty() {
                0
            } else {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!("SELECT count(*) FROM memories WHERE id IN ({placeholders})");
                let mut stmt = reader.prepare(&sql)?;
                stmt.query_row(rusqlite::params_from_iter(ids), |row| row.get(0))?
            }
        };
        drop(reader);

        if remaining > 0 {
            return Ok(false);
        }
        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        writer.execute("DELETE FROM memory_summaries WHERE id = ?1", params![summary_id.to_string()])?;
        Ok(true)
    }

    pub fn delete_memory_for_forgetting(&self, user_id: Uuid, memory_id: Uuid) -> Result<()> {
        self.delete_memory(user_id, memory_id)
    }

    // ------------------------------------------------------------------
    // Preferences, conversations, web sources (supplemented ops)
    // ------------------------------------------------------------------

    pub fn get_preferences(&self, user_id: Uuid) -> Result<UserPreference> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let row = reader
            .query_row(
                "SELECT boost_topics, suppress_topics, search_opts FROM user_preferences WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    let boost: String = row.get(0)?;
                    let suppress: String = row.get(1)?;
                    let opts: String = row.get(2)?;
                    Ok((boost, suppress, opts))
                },
            )
            .optional()?;

        match row {
            Some((boost, suppress, opts)) => Ok(UserPreference {
                user_id,
                boost_topics: serde_json::from_str(&boost).unwrap_or_default(),
                suppress_topics: serde_json::from_str(&suppress).unwrap_or_default(),
                search_opts: serde_json::from_str(&opts).unwrap_or(serde_json::Value::Object(Default::default())),
            }),
            None => Ok(UserPreference { user_id, ..UserPreference::default() }),
        }
    }

    pub fn upsert_preferences(&self, pref: &UserPreference) -> Result<()> {
        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        Self::ensure_user(&writer, pref.user_id)?;
        writer.execute(
            "INSERT INTO user_preferences (user_id, boost_topics, suppress_topics, search_opts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET boost_topics = excluded.boost_topics,
                suppress_topics = excluded.suppress_topics, search_opts = excluded.search_opts",
            params![
                pref.user_id.to_string(),
                serde_json::to_string(&pref.boost_topics).unwrap_or_default(),
                serde_json::to_string(&pref.suppress_topics).unwrap_or_default(),
                pref.search_opts.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_web_source(&self, source: &WebSource) -> Result<()> {
        let embedding = Embedding::new(source.embedding.clone());
        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        writer.execute(
            "INSERT INTO web_sources (id, url, title, text, embedding, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(url) DO UPDATE SET title = excluded.title, text = excluded.text,
                embedding = excluded.embedding, scraped_at = excluded.scraped_at",
            params![
                source.id.to_string(),
                source.url,
                source.title,
                source.text,
                embedding.to_bytes(),
                source.scraped_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn create_conversation(&self, user_id: Uuid) -> Result<Conversation> {
        let conversation = Conversation { id: Uuid::new_v4(), user_id, created_at: Utc::now() };
        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        Self::ensure_user(&writer, user_id)?;
        writer.execute(
            "INSERT INTO conversations (id, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![conversation.id.to_string(), conversation.user_id.to_string(), conversation.created_at.to_rfc3339()],
        )?;
        Ok(conversation)
    }

    pub fn append_message(&self, message: &Message) -> Result<()> {
        let writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        writer.execute(
            "INSERT INTO messages (id, conversation_id, role, content, meta, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.role.as_str(),
                message.content,
                message.meta.to_string(),
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Appends a (user, assistant) pair atomically, per §5 ordering rules.
    pub fn append_message_pair(&self, user_message: &Message, assistant_message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().map_err(|_| StorageError::Init("writer lock poisoned".into()))?;
        let tx = writer.transaction()?;
        for message in [user_message, assistant_message] {
            tx.execute(
                "INSERT INTO messages (id, conversation_id, role, content, meta, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.role.as_str(),
                    message.content,
                    message.meta.to_string(),
                    message.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let reader = self.reader.lock().map_err(|_| StorageError::Init("reader lock poisoned".into()))?;
        let mut stmt = reader.prepare(
            "SELECT id, conversation_id, role, content, meta, created_at FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id.to_string()], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let content_type: String = row.get(2)?;
    let memory_type: String = row.get(8)?;
    let meta: String = row.get(4)?;
    Ok(Memory {
        id: parse_uuid_col(row, 0)?,
        user_id: parse_uuid_col(row, 1)?,
        content_type: ContentType::parse_name(&content_type).unwrap_or(ContentType::Text),
        content: row.get(3)?,
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        blob_ref: row.get(5)?,
        created_at: parse_timestamp_col(row, 6)?,
        last_accessed: parse_timestamp_col(row, 7)?,
        memory_type: MemoryType::parse_name(&memory_type).unwrap_or(MemoryType::Episodic),
        importance: row.get(9)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemorySummary> {
    let embedding_blob: Vec<u8> = row.get(3)?;
    let source_ids: String = row.get(4)?;
    Ok(MemorySummary {
        id: parse_uuid_col(row, 0)?,
        user_id: parse_uuid_col(row, 1)?,
        text: row.get(2)?,
        embedding: Embedding::from_bytes(&embedding_blob).map(|e| e.vector).unwrap_or_default(),
        source_memory_ids: source_ids.split(',').filter(|s| !s.is_empty()).filter_map(|s| Uuid::parse_str(s).ok()).collect(),
        memory_count: row.get(5)?,
        date_range_start: parse_timestamp_col(row, 6)?,
        date_range_end: parse_timestamp_col(row, 7)?,
        importance: row.get(8)?,
        created_at: parse_timestamp_col(row, 9)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let meta: String = row.get(4)?;
    Ok(Message {
        id: parse_uuid_col(row, 0)?,
        conversation_id: parse_uuid_col(row, 1)?,
        role: Role::parse_name(&role).unwrap_or(Role::User),
        content: row.get(3)?,
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        created_at: parse_timestamp_col(row, 5)?,
    })
}

fn parse_uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_timestamp_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other("invalid timestamp")),
        )
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Validation(format!("invalid timestamp {raw}: {e}")))
}

#[async_trait::async_trait]
impl crate::memory_manager::MemoryBackend for Storage {
    async fn access_stats(&self, memory_id: Uuid) -> crate::error::Result<(i64, Option<DateTime<Utc>>)> {
        Ok(Storage::access_stats(self, memory_id)?)
    }

    async fn chunk_embeddings(&self, memory_id: Uuid) -> crate::error::Result<Vec<Vec<f32>>> {
        Ok(Storage::chunk_embeddings(self, memory_id)?)
    }

    async fn first_chunk_embedding(&self, memory_id: Uuid) -> crate::error::Result<Option<Vec<f32>>> {
        Ok(Storage::first_chunk_embedding(self, memory_id)?)
    }

    async fn consolidation_candidates(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> crate::error::Result<Vec<Memory>> {
        Ok(Storage::consolidation_candidates(self, user_id, cutoff, limit)?)
    }

    async fn insert_summary(&self, summary: &MemorySummary) -> crate::error::Result<()> {
        Ok(Storage::insert_summary(self, summary)?)
    }

    async fn forgetting_candidates(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> crate::error::Result<Vec<Memory>> {
        Ok(Storage::forgetting_candidates(self, user_id, cutoff)?)
    }

    async fn is_referenced_by_summary(&self, memory_id: Uuid) -> crate::error::Result<bool> {
        Ok(Storage::is_referenced_by_summary(self, memory_id)?)
    }

    async fn delete_memory(&self, user_id: Uuid, memory_id: Uuid) -> crate::error::Result<()> {
        Ok(Storage::delete_memory(self, user_id, memory_id)?)
    }

    async fn recent_episodic_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
        since: DateTime<Utc>,
    ) -> crate::error::Result<Vec<crate::memory_manager::HierarchicalMatch>> {
        Ok(Storage::recent_episodic_matches(self, user_id, query_vector, limit, since)?)
    }

    async fn summary_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
    ) -> crate::error::Result<Vec<crate::memory_manager::HierarchicalMatch>> {
        Ok(Storage::summary_matches(self, user_id, query_vector, limit)?)
    }

    async fn log_access(&self, memory_id: Uuid, kind: AccessKind) -> crate::error::Result<()> {
        Ok(Storage::log_access(self, memory_id, kind)?)
    }
}

#[async_trait::async_trait]
impl crate::ingestion::IngestionBackend for Storage {
    async fn create_memory(&self, memory: &Memory, chunks: &[Chunk]) -> crate::error::Result<()> {
        Ok(Storage::create_memory(self, memory, chunks)?)
    }
}

#[async_trait::async_trait]
impl crate::rag::RagBackend for Storage {
    async fn get_conversation(&self, conversation_id: Uuid) -> crate::error::Result<Vec<Message>> {
        Ok(Storage::get_conversation(self, conversation_id)?)
    }

    async fn create_conversation(&self, user_id: Uuid) -> crate::error::Result<Conversation> {
        Ok(Storage::create_conversation(self, user_id)?)
    }

    async fn append_message_pair(&self, user_message: &Message, assistant_message: &Message) -> crate::error::Result<()> {
        Ok(Storage::append_message_pair(self, user_message, assistant_message)?)
    }

    async fn get_preferences(&self, user_id: Uuid) -> crate::error::Result<UserPreference> {
        Ok(Storage::get_preferences(self, user_id)?)
    }

    async fn upsert_web_source(&self, source: &WebSource) -> crate::error::Result<()> {
        Ok(Storage::upsert_web_source(self, source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_memory(user_id: Uuid) -> Memory {
        let now = Utc::now();
        Memory {
            id: Uuid::new_v4(),
            user_id,
            content_type: ContentType::Text,
            content: "the capital of france is paris".to_string(),
            meta: serde_json::Value::Null,
            blob_ref: None,
            created_at: now,
            last_accessed: now,
            memory_type: MemoryType::Semantic,
            importance: 50,
        }
    }

    fn sample_chunk(memory_id: Uuid, index: i64, dim: usize) -> Chunk {
        let mut embedding = vec![0.0f32; dim];
        embedding[0] = 1.0;
        Chunk { id: Uuid::new_v4(), memory_id, chunk_index: index, text: "paris".to_string(), embedding }
    }

    #[test]
    fn create_and_get_memories_round_trips() {
        let storage = Storage::open_in_memory(8).unwrap();
        let user_id = Uuid::new_v4();
        let memory = sample_memory(user_id);
        let chunk = sample_chunk(memory.id, 0, 8);
        storage.create_memory(&memory, &[chunk]).unwrap();

        let (rows, total) = storage.get_memories(user_id, 0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, memory.id);
    }

    #[test]
    fn create_memory_rejects_out_of_order_chunk_index() {
        let storage = Storage::open_in_memory(8).unwrap();
        let memory = sample_memory(Uuid::new_v4());
        let chunk = sample_chunk(memory.id, 1, 8);
        let err = storage.create_memory(&memory, &[chunk]).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn delete_memory_cascades_chunks() {
        let storage = Storage::open_in_memory(8).unwrap();
        let user_id = Uuid::new_v4();
        let memory = sample_memory(user_id);
        let chunk = sample_chunk(memory.id, 0, 8);
        storage.create_memory(&memory, &[chunk]).unwrap();
        storage.delete_memory(user_id, memory.id).unwrap();

        let (rows, total) = storage.get_memories(user_id, 0, 10).unwrap();
        assert_eq!(total, 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn log_access_updates_last_accessed_and_stats() {
        let storage = Storage::open_in_memory(8).unwrap();
        let user_id = Uuid::new_v4();
        let memory = sample_memory(user_id);
        let chunk = sample_chunk(memory.id, 0, 8);
        storage.create_memory(&memory, &[chunk]).unwrap();

        storage.log_access(memory.id, AccessKind::Retrieval).unwrap();
        let (count, last) = storage.access_stats(memory.id).unwrap();
        assert_eq!(count, 1);
        assert!(last.is_some());
    }

    #[test]
    fn preferences_default_to_empty_when_unset() {
        let storage = Storage::open_in_memory(8).unwrap();
        let pref = storage.get_preferences(Uuid::new_v4()).unwrap();
        assert!(pref.boost_topics.is_empty());
    }
}
