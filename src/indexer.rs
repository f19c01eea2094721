//! The Indexer (spec.md §4.4): hash-based dedup, chunking, embedding, and
//! persistence, behind a bounded-concurrency worker pool that runs up to
//! five jobs in parallel, shortest-job-first, each under a deadline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cache::{MarkdownCache, VectorCache, VectorCacheKey};
use crate::chunker::{self, ChunkerConfig};
use crate::clock::Clock;
use crate::config::SettingsSnapshot;
use crate::embedding_client::{EmbedOutcome, EmbeddingClient};
use crate::error::{EngineError, EngineResult};
use crate::storage::{ChunkRow, Document, Storage};

const DEFAULT_MAX_PARALLEL_JOBS: usize = 5;
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The `MarkdownConverter` capability from spec.md §6: `(pdf_path) →
/// markdown_text` or error. Opaque to the engine — the indexer never
/// inspects the PDF itself, only the Markdown it gets back.
#[async_trait]
pub trait MarkdownConverter: Send + Sync {
    async fn convert(&self, pdf_path: &Path) -> EngineResult<String>;
}

#[derive(Debug, Clone)]
pub struct IndexInput {
    pub workspace_id: String,
    pub source_type: String,
    pub source_name: String,
    pub source_path: Option<String>,
    pub markdown_text: String,
    pub session_id: Option<String>,
    pub artifact_entry_id: Option<String>,
    pub file_size: i64,
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub document_id: String,
    pub embeddings_indexed: bool,
    /// Non-fatal warning (e.g. embedding unavailable) — indexing still
    /// succeeded lexically (spec.md §4.3 Failure modes).
    pub warning: Option<String>,
}

/// Canonicalizes Markdown before hashing: normalizes line endings to LF and
/// trims trailing whitespace from the whole document (spec.md §6 "Bit-exact
/// concerns"). Deliberately leaves internal content otherwise untouched —
/// canonicalization must stay stable across re-ingests of the same source.
fn canonicalize_markdown(markdown: &str) -> String {
    markdown.replace("\r\n", "\n").replace('\r', "\n").trim_end().to_string()
}

fn content_hash(canonical_markdown: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_markdown.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Indexer {
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingClient>,
    markdown_cache: Arc<MarkdownCache>,
    vector_cache: Arc<VectorCache>,
    semaphore: Arc<Semaphore>,
    job_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Indexer {
    pub fn new(
        storage: Arc<Storage>,
        embeddings: Arc<EmbeddingClient>,
        markdown_cache: Arc<MarkdownCache>,
        vector_cache: Arc<VectorCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            embeddings,
            markdown_cache,
            vector_cache,
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_PARALLEL_JOBS)),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            clock,
        }
    }

    pub fn with_concurrency(mut self, permits: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Converts via `converter`, consulting the Markdown cache first so a
    /// file dispatched twice (e.g. a watcher re-notify racing a still-running
    /// job) skips a second conversion (spec.md §4.4 caches).
    pub async fn convert_with_cache(
        &self,
        converter: &dyn MarkdownConverter,
        raw_file_hash: &str,
        pdf_path: &Path,
    ) -> EngineResult<String> {
        if let Some(cached) = self.markdown_cache.get(raw_file_hash) {
            return Ok(cached);
        }
        let markdown = converter.convert(pdf_path).await?;
        self.markdown_cache.put(raw_file_hash.to_string(), markdown.clone());
        Ok(markdown)
    }

    /// Runs one indexing job under the bounded-concurrency semaphore and the
    /// per-job deadline (spec.md §4.4 Concurrency). On timeout, the registry
    /// (if a `source_path` was given) is marked `failed` with its retry count
    /// incremented, mirroring the Watcher's own failure path.
    pub async fn index_document(
        &self,
        input: IndexInput,
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> EngineResult<IndexOutcome> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("indexer semaphore closed: {e}")))?;

        let source_path = input.source_path.clone();
        let result = tokio::time::timeout(self.job_timeout, self.index_document_inner(input, settings, api_key)).await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                if let Some(path) = &source_path {
                    let _ = self.storage.registry_mark_failed(path, "indexing job timed out");
                }
                Err(EngineError::Timeout(format!(
                    "indexing job exceeded {:?} deadline",
                    self.job_timeout
                )))
            }
        }
    }

    /// Sorts `inputs` shortest-job-first by `file_size` and runs them
    /// concurrently under the shared pool, matching spec.md §4.4's
    /// "prioritizing smaller files first" ordering. Every input still runs;
    /// only the dispatch order changes.
    pub async fn index_batch(
        &self,
        mut inputs: Vec<IndexInput>,
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> Vec<EngineResult<IndexOutcome>> {
        inputs.sort_by_key(|i| i.file_size);
        let jobs = inputs.into_iter().map(|input| self.index_document(input, settings, api_key));
        futures_util::future::join_all(jobs).await
    }

    async fn index_document_inner(
        &self,
        input: IndexInput,
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> EngineResult<IndexOutcome> {
        // Step 1: content hash over canonicalized Markdown.
        let canonical = canonicalize_markdown(&input.markdown_text);
        let hash = content_hash(&canonical);

        // Step 2: dedup by (workspace_id, content_hash).
        if let Some(existing) = self.storage.find_document_by_hash(&input.workspace_id, &hash)? {
            let has_embeddings = settings.embedding_model.is_empty()
                || self.storage.has_embeddings_for_model(&existing.id, &settings.embedding_model)?;

            if existing.stale_at.is_some() {
                self.storage.unlink_stale(&existing.id)?;
            }
            self.storage.touch_indexed_at(&existing.id)?;

            if let Some(session_id) = &input.session_id {
                self.storage.insert_document_session_link(&existing.id, session_id)?;
            }
            if let Some(path) = &input.source_path {
                self.storage.registry_mark_indexed(path, Some(&settings.embedding_model))?;
            }

            if has_embeddings {
                return Ok(IndexOutcome { document_id: existing.id, embeddings_indexed: true, warning: None });
            }

            // Document and chunks already exist; only the embedding phase
            // needs to run, against the chunks already committed.
            let chunks = self.storage.chunks_for_document(&existing.id)?;
            let warning = self.embed_and_persist(&hash, &chunks, settings, api_key).await?;
            return Ok(IndexOutcome {
                document_id: existing.id,
                embeddings_indexed: warning.is_none(),
                warning,
            });
        }

        // Step 3: chunk.
        let chunker_config = ChunkerConfig {
            chunk_size_chars: settings.chunk_size_chars,
            chunk_overlap_chars: settings.chunk_overlap_chars,
        };
        let chunks = chunker::chunk_markdown(&canonical, chunker_config);

        // Step 4: dedup identical chunk contents within the document,
        // retaining the first occurrence, then re-densify chunk_index.
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<_> = chunks
            .into_iter()
            .filter(|c| seen.insert(c.content.clone()))
            .enumerate()
            .map(|(idx, mut c)| {
                c.chunk_index = idx;
                c
            })
            .collect();

        let document_id = Uuid::new_v4().to_string();
        let document = Document {
            id: document_id.clone(),
            workspace_id: input.workspace_id.clone(),
            artifact_entry_id: input.artifact_entry_id.clone(),
            source_type: input.source_type.clone(),
            source_name: input.source_name.clone(),
            source_path: input.source_path.clone(),
            content_hash: hash.clone(),
            indexed_at: self.clock.now(),
            file_size: input.file_size,
            stale_at: None,
        };

        let chunk_rows: Vec<ChunkRow> = deduped
            .iter()
            .map(|c| ChunkRow {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.clone(),
                chunk_index: c.chunk_index as i64,
                section_title: c.section_title.clone(),
                content: c.content.clone(),
                token_count: c.token_count.map(|t| t as i64),
            })
            .collect();

        // Steps 5-6: document, chunks, and their FTS mirror rows in one
        // write transaction.
        self.storage.insert_document_with_chunks(&document, &chunk_rows)?;

        // Step 7: embeddings, in a second transaction; failure here is
        // non-fatal and does not unwind the committed lexical index.
        let warning = self.embed_and_persist(&hash, &chunk_rows, settings, api_key).await?;

        // Step 8.
        if let Some(session_id) = &input.session_id {
            self.storage.insert_document_session_link(&document_id, session_id)?;
        }

        // Step 9.
        if let Some(path) = &input.source_path {
            self.storage.registry_mark_indexed(path, Some(&settings.embedding_model))?;
        }

        Ok(IndexOutcome { document_id, embeddings_indexed: warning.is_none(), warning })
    }

    /// Embeds `chunks` and persists the resulting vectors, consulting and
    /// populating the `(content_hash, model, chunk_index)` vector cache along
    /// the way. Returns `Some(warning)` when embedding was skipped — never an
    /// `Err`, since the lexical index must remain usable regardless of
    /// embedding provider availability (spec.md §4.3, §4.4 step 7).
    async fn embed_and_persist(
        &self,
        doc_content_hash: &str,
        chunks: &[ChunkRow],
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> EngineResult<Option<String>> {
        if settings.embedding_model.is_empty() || chunks.is_empty() {
            return Ok(Some("embedding skipped: no model configured".to_string()));
        }

        let mut cached_bytes: Vec<Option<Vec<u8>>> = Vec::with_capacity(chunks.len());
        let mut to_embed: Vec<String> = Vec::new();

        for chunk in chunks {
            let key = VectorCacheKey {
                content_hash: doc_content_hash.to_string(),
                model_identifier: settings.embedding_model.clone(),
                chunk_index: chunk.chunk_index as usize,
            };
            match self.vector_cache.get(&key) {
                Some(bytes) => cached_bytes.push(Some(bytes)),
                None => {
                    cached_bytes.push(None);
                    to_embed.push(chunk.content.clone());
                }
            }
        }

        let mut fresh_bytes: Vec<Vec<u8>> = Vec::new();
        if !to_embed.is_empty() {
            match self.embeddings.embed_batched(&settings.embedding_model, api_key, &to_embed).await {
                Ok(EmbedOutcome::Vectors(vectors)) => {
                    fresh_bytes = vectors.iter().map(|v| crate::storage::f32_vec_to_bytes(v)).collect();
                }
                Ok(EmbedOutcome::Unavailable(reason)) => {
                    return Ok(Some(format!("embedding unavailable: {reason}")));
                }
                Err(e) => {
                    tracing::warn!("embedding request failed, continuing lexically: {e}");
                    return Ok(Some(format!("embedding failed: {e}")));
                }
            }
        }

        let dims = fresh_bytes
            .first()
            .map(|b| b.len() / 4)
            .or_else(|| cached_bytes.iter().flatten().next().map(|b| b.len() / 4))
            .unwrap_or(0);
        if dims == 0 {
            return Ok(Some("embedding skipped: provider returned no vectors".to_string()));
        }

        let mut rows = Vec::with_capacity(chunks.len());
        let mut fresh_iter = fresh_bytes.into_iter();
        for (i, chunk) in chunks.iter().enumerate() {
            let bytes = if let Some(cached) = &cached_bytes[i] {
                cached.clone()
            } else {
                let bytes = fresh_iter.next().ok_or_else(|| {
                    EngineError::DataIntegrity("embedding provider returned fewer vectors than requested".to_string())
                })?;
                self.vector_cache.put(
                    VectorCacheKey {
                        content_hash: doc_content_hash.to_string(),
                        model_identifier: settings.embedding_model.clone(),
                        chunk_index: chunk.chunk_index as usize,
                    },
                    bytes.clone(),
                );
                bytes
            };
            rows.push((chunk.id.clone(), settings.embedding_model.clone(), dims, bytes));
        }

        self.storage.insert_embeddings(&rows)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_client::EmbeddingProvider;
    use crate::storage::GLOBAL_WORKSPACE;

    struct FakeProvider {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed(&self, _model_id: &str, _api_key: Option<&str>, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.25_f32; self.dims]).collect())
        }
        fn dims_for_model(&self, _model_id: &str) -> Option<usize> {
            Some(self.dims)
        }
    }

    fn build_indexer(storage: Arc<Storage>) -> Indexer {
        let provider = Arc::new(FakeProvider { dims: 4 });
        let embeddings = Arc::new(EmbeddingClient::new(provider));
        Indexer::new(
            storage,
            embeddings,
            Arc::new(MarkdownCache::with_memory_budget_bytes(1024 * 1024)),
            Arc::new(VectorCache::with_memory_budget_bytes(1024 * 1024)),
            Arc::new(crate::clock::SystemClock),
        )
    }

    fn settings_with_model() -> SettingsSnapshot {
        let mut s = SettingsSnapshot::default();
        s.embedding_model = "test-model".to_string();
        s
    }

    fn open_temp() -> (tempfile::TempDir, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::initialize(dir.path().join("t.sqlite3")).unwrap());
        (dir, storage)
    }

    #[tokio::test]
    async fn dedup_on_reingest_keeps_single_document() {
        let (_dir, storage) = open_temp();
        let indexer = build_indexer(storage.clone());
        let settings = settings_with_model();

        let input = || IndexInput {
            workspace_id: GLOBAL_WORKSPACE.to_string(),
            source_type: "pdf".to_string(),
            source_name: "a.md".to_string(),
            source_path: None,
            markdown_text: "# Alpha\nBeta gamma delta.".to_string(),
            session_id: None,
            artifact_entry_id: None,
            file_size: 10,
        };

        let first = indexer.index_document(input(), &settings, Some("key")).await.unwrap();
        let second = indexer.index_document(input(), &settings, Some("key")).await.unwrap();
        assert_eq!(first.document_id, second.document_id);
    }

    #[tokio::test]
    async fn lexical_only_when_no_embedding_model_configured() {
        let (_dir, storage) = open_temp();
        let indexer = build_indexer(storage.clone());
        let mut settings = settings_with_model();
        settings.embedding_model = String::new();

        let outcome = indexer
            .index_document(
                IndexInput {
                    workspace_id: GLOBAL_WORKSPACE.to_string(),
                    source_type: "pdf".to_string(),
                    source_name: "a.md".to_string(),
                    source_path: None,
                    markdown_text: "# Alpha\nBeta gamma delta.".to_string(),
                    session_id: None,
                    artifact_entry_id: None,
                    file_size: 10,
                },
                &settings,
                None,
            )
            .await
            .unwrap();

        assert!(!outcome.embeddings_indexed);
        let chunks = storage.chunks_for_document(&outcome.document_id).unwrap();
        assert!(!chunks.is_empty());
    }

    #[tokio::test]
    async fn chunk_index_is_dense_after_intra_document_dedup() {
        let (_dir, storage) = open_temp();
        let indexer = build_indexer(storage.clone());
        let settings = settings_with_model();

        let md = "# A\nrepeated content\n\n# B\nrepeated content\n\n# C\nunique content";
        let outcome = indexer
            .index_document(
                IndexInput {
                    workspace_id: GLOBAL_WORKSPACE.to_string(),
                    source_type: "pdf".to_string(),
                    source_name: "a.md".to_string(),
                    source_path: None,
                    markdown_text: md.to_string(),
                    session_id: None,
                    artifact_entry_id: None,
                    file_size: 10,
                },
                &settings,
                Some("key"),
            )
            .await
            .unwrap();

        let chunks = storage.chunks_for_document(&outcome.document_id).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[tokio::test]
    async fn registry_marked_failed_records_retry_count() {
        let (_dir, storage) = open_temp();
        storage.registry_upsert_pending("/tmp/doc.pdf", "h0").unwrap();
        let retry_count = storage.registry_mark_failed("/tmp/doc.pdf", "indexing job timed out").unwrap();
        assert_eq!(retry_count, 1);
        let entry = storage.registry_get("/tmp/doc.pdf").unwrap().unwrap();
        assert_eq!(entry.status, "failed");
    }

    #[tokio::test]
    async fn batch_dispatch_preserves_all_inputs_regardless_of_order() {
        let (_dir, storage) = open_temp();
        let indexer = build_indexer(storage.clone());
        let settings = settings_with_model();

        let inputs = vec![
            IndexInput {
                workspace_id: GLOBAL_WORKSPACE.to_string(),
                source_type: "pdf".to_string(),
                source_name: "big.md".to_string(),
                source_path: None,
                markdown_text: "# Big\n".to_string() + &"word ".repeat(500),
                session_id: None,
                artifact_entry_id: None,
                file_size: 5000,
            },
            IndexInput {
                workspace_id: GLOBAL_WORKSPACE.to_string(),
                source_type: "pdf".to_string(),
                source_name: "small.md".to_string(),
                source_path: None,
                markdown_text: "# Small\nshort".to_string(),
                session_id: None,
                artifact_entry_id: None,
                file_size: 10,
            },
        ];

        let outcomes = indexer.index_batch(inputs, &settings, Some("key")).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_ok()));
    }
}
