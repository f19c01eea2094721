//! Embedded SQL storage: schema, migrations, and scope-enforced queries.
//!
//! SQLite in WAL mode with a `chunks_fts` FTS5 virtual table for BM25-like
//! lexical ranking and a BLOB column for float32 embedding vectors. One
//! connection per worker thread is checked out of [`ConnectionPool`]; writes
//! are serialized by SQLite itself, readers proceed concurrently under WAL.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const GLOBAL_WORKSPACE: &str = "GLOBAL";

/// Schema version this build understands. Additive migrations bump this and
/// append a branch to [`run_migrations`]; destructive changes are rejected.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspaces (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id                 TEXT PRIMARY KEY,
    workspace_id       TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    artifact_entry_id  TEXT,
    source_type        TEXT NOT NULL,
    source_name        TEXT NOT NULL,
    source_path        TEXT,
    content_hash       TEXT NOT NULL,
    indexed_at         TEXT NOT NULL,
    file_size          INTEGER NOT NULL,
    stale_at           TEXT,
    UNIQUE(workspace_id, content_hash)
);
CREATE INDEX IF NOT EXISTS idx_documents_workspace ON documents(workspace_id);
CREATE INDEX IF NOT EXISTS idx_documents_stale ON documents(stale_at);

CREATE TABLE IF NOT EXISTS document_sessions (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    session_id  TEXT NOT NULL,
    PRIMARY KEY (document_id, session_id)
);
CREATE INDEX IF NOT EXISTS idx_document_sessions_session ON document_sessions(session_id);

CREATE TABLE IF NOT EXISTS chunks (
    id            TEXT PRIMARY KEY,
    document_id   TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    chunk_index   INTEGER NOT NULL,
    section_title TEXT,
    content       TEXT NOT NULL,
    token_count   INTEGER,
    UNIQUE(document_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    chunk_id UNINDEXED,
    content,
    section_title,
    source_name,
    tokenize = 'porter unicode61'
);

-- Cascading document/chunk deletes do not touch virtual tables automatically;
-- these triggers keep chunks_fts synchronized with chunks.
CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    DELETE FROM chunks_fts WHERE chunk_id = old.id;
END;

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id        TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    model_identifier TEXT NOT NULL,
    dims            INTEGER NOT NULL,
    vector_bytes    BLOB NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS index_registry (
    source_path     TEXT PRIMARY KEY,
    content_hash    TEXT,
    status          TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_seen_at    TEXT,
    last_indexed_at TEXT,
    error_message   TEXT,
    embedding_model TEXT
);
CREATE INDEX IF NOT EXISTS idx_registry_status ON index_registry(status);
"#;

/// Retrieval scope, enforced exclusively in SQL predicates — never by
/// post-filtering ranked results in application code (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Workspace { workspace_id: String },
    Session { session_id: String },
}

impl Scope {
    /// SQL fragment (joined after `FROM chunks c JOIN documents d ON d.id = c.document_id`)
    /// plus its bound parameters, in the order the fragment references them.
    fn predicate_sql(&self) -> &'static str {
        match self {
            Scope::Global => "d.workspace_id = ?1",
            Scope::Workspace { .. } => "d.workspace_id = ?1",
            Scope::Session { .. } => {
                "d.id IN (SELECT document_id FROM document_sessions WHERE session_id = ?1)"
            }
        }
    }

    fn predicate_param(&self) -> String {
        match self {
            Scope::Global => GLOBAL_WORKSPACE.to_string(),
            Scope::Workspace { workspace_id } => workspace_id.clone(),
            Scope::Session { session_id } => session_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub workspace_id: String,
    pub artifact_entry_id: Option<String>,
    pub source_type: String,
    pub source_name: String,
    pub source_path: Option<String>,
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
    pub file_size: i64,
    pub stale_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub section_title: Option<String>,
    pub content: String,
    pub token_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingCandidate {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub source_path: String,
    pub content_hash: Option<String>,
    pub status: String,
    pub retry_count: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub embedding_model: Option<String>,
}

/// A small pool of checked-out connections, matching the spec's "one
/// connection per OS thread is acceptable when WAL is enabled."
struct ConnectionPool {
    path: String,
    idle: Mutex<VecDeque<Connection>>,
}

pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl<'a> std::ops::Deref for PooledConnection<'a> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<'a> std::ops::DerefMut for PooledConnection<'a> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<'a> Drop for PooledConnection<'a> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push_back(conn);
        }
    }
}

impl ConnectionPool {
    fn new(path: &str) -> EngineResult<Self> {
        Ok(Self {
            path: path.to_string(),
            idle: Mutex::new(VecDeque::new()),
        })
    }

    fn checkout(&self) -> EngineResult<PooledConnection<'_>> {
        if let Some(conn) = self.idle.lock().pop_front() {
            return Ok(PooledConnection {
                pool: self,
                conn: Some(conn),
            });
        }
        let conn = open_connection(&self.path)?;
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }
}

fn open_connection(path: &str) -> EngineResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

pub struct Storage {
    pool: Arc<ConnectionPool>,
}

impl Storage {
    /// Creates schema idempotently, ensures the `GLOBAL` workspace row
    /// exists, and verifies the FTS virtual table's column order matches
    /// what this build expects. Fails with [`EngineError::StorageInit`] on
    /// an incompatible schema version.
    pub fn initialize(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::new(&path_str)?;
        let conn = pool.checkout()?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| EngineError::StorageInit(e.to_string()))?;

        verify_fts_columns(&conn)?;
        run_migrations(&conn)?;

        conn.execute(
            "INSERT OR IGNORE INTO workspaces (id, name, created_at) VALUES (?1, ?1, ?2)",
            params![GLOBAL_WORKSPACE, Utc::now().to_rfc3339()],
        )
        .map_err(|e| EngineError::StorageInit(e.to_string()))?;

        drop(conn);
        Ok(Self { pool: Arc::new(pool) })
    }

    fn conn(&self) -> EngineResult<PooledConnection<'_>> {
        self.pool.checkout()
    }

    // ---- Workspaces ----

    pub fn ensure_workspace(&self, workspace_id: &str, name: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![workspace_id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- Documents ----

    /// Looks up a document by `(workspace_id, content_hash)` — the identity
    /// key for dedup (spec.md §3 Document invariant).
    pub fn find_document_by_hash(
        &self,
        workspace_id: &str,
        content_hash: &str,
    ) -> EngineResult<Option<Document>> {
        let conn = self.conn()?;
        let doc = conn
            .query_row(
                "SELECT id, workspace_id, artifact_entry_id, source_type, source_name, \
                 source_path, content_hash, indexed_at, file_size, stale_at \
                 FROM documents WHERE workspace_id = ?1 AND content_hash = ?2",
                params![workspace_id, content_hash],
                row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn touch_indexed_at(&self, document_id: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE documents SET indexed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), document_id],
        )?;
        Ok(())
    }

    pub fn unlink_stale(&self, document_id: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE documents SET stale_at = NULL WHERE id = ?1",
            params![document_id],
        )?;
        Ok(())
    }

    pub fn mark_stale(&self, document_id: &str, at: DateTime<Utc>) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE documents SET stale_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), document_id],
        )?;
        Ok(())
    }

    /// Inserts the document, its chunks, and their FTS mirror rows within a
    /// single transaction (spec.md §4.4 step 5; §4.1 LexicalIndex invariant).
    pub fn insert_document_with_chunks(
        &self,
        doc: &Document,
        chunks: &[ChunkRow],
    ) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (id, workspace_id, artifact_entry_id, source_type, \
             source_name, source_path, content_hash, indexed_at, file_size, stale_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                doc.id,
                doc.workspace_id,
                doc.artifact_entry_id,
                doc.source_type,
                doc.source_name,
                doc.source_path,
                doc.content_hash,
                doc.indexed_at.to_rfc3339(),
                doc.file_size,
                doc.stale_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (id, document_id, chunk_index, section_title, content, token_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.chunk_index,
                    chunk.section_title,
                    chunk.content,
                    chunk.token_count,
                ],
            )?;
            tx.execute(
                "INSERT INTO chunks_fts (chunk_id, content, section_title, source_name) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![chunk.id, chunk.content, chunk.section_title, doc.source_name],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn insert_document_session_link(
        &self,
        document_id: &str,
        session_id: &str,
    ) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO document_sessions (document_id, session_id) VALUES (?1, ?2)",
            params![document_id, session_id],
        )?;
        Ok(())
    }

    pub fn chunks_for_document(&self, document_id: &str) -> EngineResult<Vec<ChunkRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, chunk_index, section_title, content, token_count \
             FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![document_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_document(&self, document_id: &str) -> EngineResult<()> {
        self.conn()?
            .execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;
        Ok(())
    }

    /// Session-scoped documents whose `stale_at` precedes the retention cutoff.
    /// The cleanup service must never be able to select a `GLOBAL` document
    /// through this query (spec.md §4.8).
    pub fn stale_session_documents(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d.id, d.workspace_id, d.artifact_entry_id, d.source_type, \
             d.source_name, d.source_path, d.content_hash, d.indexed_at, d.file_size, d.stale_at \
             FROM documents d \
             JOIN document_sessions ds ON ds.document_id = d.id \
             WHERE d.workspace_id != ?1 AND d.stale_at IS NOT NULL AND d.stale_at < ?2",
        )?;
        let rows = stmt
            .query_map(
                params![GLOBAL_WORKSPACE, cutoff.to_rfc3339()],
                row_to_document,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- Embeddings ----

    pub fn insert_embeddings(
        &self,
        rows: &[(String, String, usize, Vec<u8>)],
    ) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (chunk_id, model_identifier, dims, vector_bytes) in rows {
            debug_assert_eq!(vector_bytes.len(), dims * 4);
            tx.execute(
                "INSERT OR REPLACE INTO embeddings (chunk_id, model_identifier, dims, vector_bytes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chunk_id, model_identifier, *dims as i64, vector_bytes, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn has_embeddings_for_model(
        &self,
        document_id: &str,
        model_identifier: &str,
    ) -> EngineResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings e \
             JOIN chunks c ON c.id = e.chunk_id \
             WHERE c.document_id = ?1 AND e.model_identifier = ?2",
            params![document_id, model_identifier],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All embedding candidates visible under `scope`, for exact cosine
    /// similarity (spec.md explicitly rules out ANN at this scale).
    pub fn embedding_candidates(&self, scope: &Scope) -> EngineResult<Vec<EmbeddingCandidate>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT e.chunk_id, e.vector_bytes, e.dims FROM embeddings e \
             JOIN chunks c ON c.id = e.chunk_id \
             JOIN documents d ON d.id = c.document_id \
             WHERE {}",
            scope.predicate_sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let param = scope.predicate_param();
        let rows = stmt
            .query_map(params![param], |row| {
                let chunk_id: String = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                let dims: i64 = row.get(2)?;
                Ok((chunk_id, bytes, dims as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(chunk_id, bytes, dims)| EmbeddingCandidate {
                chunk_id,
                vector: bytes_to_f32_vec(&bytes, dims),
            })
            .collect())
    }

    // ---- Lexical search ----

    /// BM25-ranked full-text match under `scope`. `sanitized_query` must
    /// already have reserved FTS5 tokens stripped (see `chunker`/`retriever`
    /// query sanitization); an empty sanitized query yields no rows rather
    /// than a syntax error.
    pub fn lexical_search(
        &self,
        sanitized_query: &str,
        scope: &Scope,
        limit: usize,
    ) -> EngineResult<Vec<LexicalHit>> {
        if sanitized_query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT f.chunk_id, bm25(chunks_fts) AS rank FROM chunks_fts f \
             JOIN chunks c ON c.id = f.chunk_id \
             JOIN documents d ON d.id = c.document_id \
             WHERE chunks_fts MATCH ?1 AND {} \
             ORDER BY rank LIMIT ?2",
            scope.predicate_sql().replace("?1", "?3")
        );
        let scope_param = scope.predicate_param();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![sanitized_query, limit as i64, scope_param], |row| {
                let chunk_id: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((chunk_id, rank))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // bm25() in SQLite returns lower-is-better; invert so higher score wins,
        // matching the vector side's "higher is better" convention for RRF ranking.
        Ok(rows
            .into_iter()
            .map(|(chunk_id, rank)| LexicalHit {
                chunk_id,
                score: -rank,
            })
            .collect())
    }

    /// Fetches the `(document_id, source_name, section_title)` context
    /// needed to build a citation, plus the content, for a set of chunk ids.
    pub fn hydrate_chunks(&self, chunk_ids: &[String]) -> EngineResult<Vec<HydratedChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT c.id, c.document_id, c.chunk_index, c.section_title, c.content, \
             d.source_name, d.workspace_id, d.indexed_at \
             FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            chunk_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_refs.as_slice(), |row| {
                let indexed_at: String = row.get(7)?;
                Ok(HydratedChunk {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    chunk_index: row.get(2)?,
                    section_title: row.get(3)?,
                    content: row.get(4)?,
                    source_name: row.get(5)?,
                    workspace_id: row.get(6)?,
                    indexed_at: parse_rfc3339(&indexed_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Chunk ids attached to `session_id`, used to assert the decision
    /// subgraph's local-scope invariant (spec.md §4.7): every chunk a local
    /// retrieval returns must be attached to the session it claims.
    pub fn chunk_ids_for_session(&self, session_id: &str) -> EngineResult<std::collections::HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id FROM chunks c \
             JOIN documents d ON d.id = c.document_id \
             JOIN document_sessions ds ON ds.document_id = d.id \
             WHERE ds.session_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<std::collections::HashSet<_>, _>>()?;
        Ok(rows)
    }

    // ---- Registry ----

    pub fn registry_get(&self, source_path: &str) -> EngineResult<Option<RegistryEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT source_path, content_hash, status, retry_count, last_seen_at, \
                 last_indexed_at, error_message, embedding_model FROM index_registry WHERE source_path = ?1",
                params![source_path],
                row_to_registry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn registry_list(&self, status_filter: Option<&str>) -> EngineResult<Vec<RegistryEntry>> {
        let conn = self.conn()?;
        let rows = if let Some(status) = status_filter {
            let mut stmt = conn.prepare(
                "SELECT source_path, content_hash, status, retry_count, last_seen_at, \
                 last_indexed_at, error_message, embedding_model FROM index_registry WHERE status = ?1",
            )?;
            stmt.query_map(params![status], row_to_registry)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT source_path, content_hash, status, retry_count, last_seen_at, \
                 last_indexed_at, error_message, embedding_model FROM index_registry",
            )?;
            stmt.query_map([], row_to_registry)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn registry_upsert_pending(&self, source_path: &str, content_hash: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO index_registry (source_path, content_hash, status, retry_count, last_seen_at) \
             VALUES (?1, ?2, 'pending', 0, ?3) \
             ON CONFLICT(source_path) DO UPDATE SET content_hash = excluded.content_hash, \
             status = 'pending', last_seen_at = excluded.last_seen_at",
            params![source_path, content_hash, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn registry_touch_seen(&self, source_path: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE index_registry SET last_seen_at = ?1 WHERE source_path = ?2",
            params![Utc::now().to_rfc3339(), source_path],
        )?;
        Ok(())
    }

    pub fn registry_mark_indexed(
        &self,
        source_path: &str,
        embedding_model: Option<&str>,
    ) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE index_registry SET status = 'indexed', retry_count = 0, \
             last_indexed_at = ?1, error_message = NULL, embedding_model = ?2 WHERE source_path = ?3",
            params![Utc::now().to_rfc3339(), embedding_model, source_path],
        )?;
        Ok(())
    }

    pub fn registry_mark_failed(&self, source_path: &str, error: &str) -> EngineResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE index_registry SET status = 'failed', retry_count = retry_count + 1, \
             error_message = ?1 WHERE source_path = ?2",
            params![error, source_path],
        )?;
        let retry_count: i64 = conn.query_row(
            "SELECT retry_count FROM index_registry WHERE source_path = ?1",
            params![source_path],
            |row| row.get(0),
        )?;
        Ok(retry_count)
    }

    pub fn registry_mark_skipped(&self, source_path: &str, reason: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "UPDATE index_registry SET status = 'skipped', error_message = ?1 WHERE source_path = ?2",
            params![reason, source_path],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub section_title: Option<String>,
    pub content: String,
    pub source_name: String,
    pub workspace_id: String,
    pub indexed_at: DateTime<Utc>,
}

/// Reserved FTS5 syntax tokens the caller's free-text query must not be
/// allowed to inject (spec.md §4.1 Query sanitization). Translates free text
/// into a disjunction of quoted terms so punctuation and boolean keywords
/// can never be interpreted as FTS5 operators; an empty/degenerate query
/// yields an empty string, which `lexical_search` treats as zero results
/// rather than a MATCH syntax error.
pub fn sanitize_fts_query(query: &str) -> String {
    const RESERVED: &[&str] = &["AND", "OR", "NOT", "NEAR"];
    query
        .chars()
        .map(|c| if c == '"' || c == '*' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .filter(|term| !RESERVED.contains(&term.to_uppercase().as_str()))
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let indexed_at: String = row.get(7)?;
    let stale_at: Option<String> = row.get(8)?;
    Ok(Document {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        artifact_entry_id: row.get(2)?,
        source_type: row.get(3)?,
        source_name: row.get(4)?,
        source_path: row.get(5)?,
        content_hash: row.get(6)?,
        indexed_at: parse_rfc3339(&indexed_at),
        file_size: row.get(9)?,
        stale_at: stale_at.map(|s| parse_rfc3339(&s)),
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        chunk_index: row.get(2)?,
        section_title: row.get(3)?,
        content: row.get(4)?,
        token_count: row.get(5)?,
    })
}

fn row_to_registry(row: &rusqlite::Row) -> rusqlite::Result<RegistryEntry> {
    let last_seen_at: Option<String> = row.get(4)?;
    let last_indexed_at: Option<String> = row.get(5)?;
    Ok(RegistryEntry {
        source_path: row.get(0)?,
        content_hash: row.get(1)?,
        status: row.get(2)?,
        retry_count: row.get(3)?,
        last_seen_at: last_seen_at.map(|s| parse_rfc3339(&s)),
        last_indexed_at: last_indexed_at.map(|s| parse_rfc3339(&s)),
        error_message: row.get(6)?,
        embedding_model: row.get(7)?,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Little-endian IEEE-754 float32, `4·dims` bytes, no header (spec.md §6
/// "Bit-exact concerns"). See `DESIGN.md` for the magic-prefix open question.
pub fn f32_vec_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8], dims: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dims);
    for chunk in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out
}

fn verify_fts_columns(conn: &Connection) -> EngineResult<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(chunks_fts)")?;
    let cols: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    let expected = ["chunk_id", "content", "section_title", "source_name"];
    if !expected.iter().all(|c| cols.iter().any(|col| col == c)) {
        return Err(EngineError::StorageInit(format!(
            "chunks_fts column mismatch: expected {:?}, found {:?}",
            expected, cols
        )));
    }
    Ok(())
}

fn run_migrations(conn: &Connection) -> EngineResult<()> {
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match current {
        None => {
            conn.execute(
                "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) => {
            let version: i64 = v.parse().unwrap_or(0);
            if version > SCHEMA_VERSION {
                return Err(EngineError::StorageInit(format!(
                    "database schema version {} is newer than this build supports ({})",
                    version, SCHEMA_VERSION
                )));
            }
            // Additive migrations would branch here on `version < SCHEMA_VERSION`.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::initialize(dir.path().join("test.sqlite3")).unwrap();
        (dir, storage)
    }

    #[test]
    fn initializes_global_workspace() {
        let (_dir, storage) = open_temp();
        let conn = storage.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM workspaces WHERE id = ?1",
                params![GLOBAL_WORKSPACE],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn document_dedup_by_hash() {
        let (_dir, storage) = open_temp();
        let doc = Document {
            id: "doc1".into(),
            workspace_id: GLOBAL_WORKSPACE.into(),
            artifact_entry_id: None,
            source_type: "pdf".into(),
            source_name: "a.md".into(),
            source_path: None,
            content_hash: "abc".into(),
            indexed_at: Utc::now(),
            file_size: 10,
            stale_at: None,
        };
        storage.insert_document_with_chunks(&doc, &[]).unwrap();
        let found = storage
            .find_document_by_hash(GLOBAL_WORKSPACE, "abc")
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().id, "doc1");
    }

    #[test]
    fn lexical_search_empty_query_yields_no_rows() {
        let (_dir, storage) = open_temp();
        let hits = storage
            .lexical_search("", &Scope::Global, 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn vector_bytes_roundtrip() {
        let v = vec![1.0_f32, -2.5, 0.0, 3.25];
        let bytes = f32_vec_to_bytes(&v);
        assert_eq!(bytes.len(), v.len() * 4);
        assert_eq!(bytes_to_f32_vec(&bytes, v.len()), v);
    }

    #[test]
    fn sanitize_strips_reserved_tokens() {
        assert_eq!(sanitize_fts_query(""), "");
        assert_eq!(sanitize_fts_query("   "), "");
        assert_eq!(sanitize_fts_query("gamma"), "\"gamma\"");
        assert_eq!(sanitize_fts_query("foo AND bar"), "\"foo\" OR \"bar\"");
        assert_eq!(sanitize_fts_query("a\"*b"), "\"a\" OR \"b\"");
    }

    #[test]
    fn scope_isolation_global_excludes_session_only_docs() {
        let (_dir, storage) = open_temp();
        storage.ensure_workspace("ws1", "ws1").unwrap();
        let doc = Document {
            id: "doc-session".into(),
            workspace_id: "ws1".into(),
            artifact_entry_id: None,
            source_type: "pdf".into(),
            source_name: "b.md".into(),
            source_path: None,
            content_hash: "hash2".into(),
            indexed_at: Utc::now(),
            file_size: 5,
            stale_at: None,
        };
        storage.insert_document_with_chunks(&doc, &[]).unwrap();
        storage
            .insert_document_session_link("doc-session", "sess1")
            .unwrap();

        let global_candidates = storage.embedding_candidates(&Scope::Global).unwrap();
        assert!(global_candidates.is_empty());
    }
}
