//! End-to-end scenarios exercising the Coordinator directly, without going
//! through HTTP. Each test stands up a fresh SQLite-backed engine under a
//! `tempfile::TempDir` so scenarios never share state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rag_engine::config::{AppConfig, SettingsSnapshot};
use rag_engine::coordinator::Coordinator;
use rag_engine::embedding_client::EmbeddingProvider;
use rag_engine::error::EngineResult;
use rag_engine::indexer::IndexInput;
use rag_engine::storage::{Scope, GLOBAL_WORKSPACE};

/// Returns a fixed vector for exactly-known texts, so vector ranking in
/// hybrid-fusion tests is fully determined by the test rather than by a
/// real model's semantics.
struct FixedVectorProvider {
    vectors: HashMap<String, Vec<f32>>,
    dims: usize,
}

#[async_trait]
impl EmbeddingProvider for FixedVectorProvider {
    async fn embed(&self, _model_id: &str, _api_key: Option<&str>, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t.trim()).cloned().unwrap_or_else(|| vec![0.0; self.dims]))
            .collect())
    }

    fn dims_for_model(&self, _model_id: &str) -> Option<usize> {
        Some(self.dims)
    }
}

async fn build_coordinator(vectors: HashMap<String, Vec<f32>>) -> (tempfile::TempDir, Arc<Coordinator>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::from_env();
    config.data_dir = dir.path().to_string_lossy().to_string();
    config.db_path = dir.path().join("engine.sqlite3").to_string_lossy().to_string();
    // `Coordinator::index_document` embeds using `config.embedding_api_key`
    // regardless of any key passed at retrieval time; set one so tests that
    // configure an `embedding_model` actually get vectors persisted.
    config.embedding_api_key = Some("test-key".to_string());

    let provider: Arc<dyn EmbeddingProvider> = Arc::new(FixedVectorProvider { vectors, dims: 2 });
    let coordinator = Coordinator::with_embedding_provider(config, provider).await.unwrap();
    (dir, Arc::new(coordinator))
}

fn index_input(workspace_id: &str, source_name: &str, markdown: &str, session_id: Option<&str>) -> IndexInput {
    IndexInput {
        workspace_id: workspace_id.to_string(),
        source_type: "artifact".to_string(),
        source_name: source_name.to_string(),
        source_path: None,
        markdown_text: markdown.to_string(),
        session_id: session_id.map(|s| s.to_string()),
        artifact_entry_id: None,
        file_size: markdown.len() as i64,
    }
}

#[tokio::test]
async fn empty_corpus_retrieval_is_ungrounded() {
    let (_dir, coordinator) = build_coordinator(HashMap::new()).await;
    let settings = SettingsSnapshot::default();

    let result = coordinator
        .retrieve("what is the refund policy?", &[], Scope::Global, &settings, None)
        .await
        .unwrap();

    assert!(!result.grounded);
    assert!(result.context_text.is_empty());
    assert!(result.citations.is_empty());
    assert!(result.chunks.is_empty());
}

#[tokio::test]
async fn lexical_only_path_when_embedding_unconfigured() {
    let (_dir, coordinator) = build_coordinator(HashMap::new()).await;
    let mut settings = SettingsSnapshot::default();
    settings.embedding_model = String::new();

    coordinator
        .index_document(
            index_input(GLOBAL_WORKSPACE, "a.md", "# Alpha\nBeta gamma delta.", None),
            &settings,
        )
        .await
        .unwrap();

    let result = coordinator.retrieve("gamma", &[], Scope::Global, &settings, None).await.unwrap();

    assert!(result.grounded);
    assert_eq!(result.chunks.len(), 1);
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].marker, 1);
    assert_eq!(result.citations[0].source_name, "a.md");
    assert_eq!(result.citations[0].section_title.as_deref(), Some("Alpha"));
    assert!(result.context_text.starts_with("[1] a.md | Alpha"));
}

/// RRF combines a one-item lexical list with a two-item vector list whose
/// order is pinned by `FixedVectorProvider`; the fused order is the one the
/// RRF formula (`1/(rrf_k + rank)`, summed per chunk) produces for those two
/// lists, not a simple restatement of either signal alone.
#[tokio::test]
async fn hybrid_fusion_combines_lexical_and_vector_rank() {
    let fox_chunk = "The quick fox report.";
    let hare_chunk = "An unrelated brown hare story.";

    let mut vectors = HashMap::new();
    vectors.insert(fox_chunk.to_string(), vec![1.0_f32, 0.0]);
    vectors.insert(hare_chunk.to_string(), vec![0.0_f32, 1.0]);
    vectors.insert("quick".to_string(), vec![0.1_f32, 0.9]);

    let (_dir, coordinator) = build_coordinator(vectors).await;
    let mut settings = SettingsSnapshot::default();
    settings.embedding_model = "fake-model".to_string();
    settings.rrf_k = 60.0;

    coordinator
        .index_document(index_input(GLOBAL_WORKSPACE, "fox.md", fox_chunk, None), &settings)
        .await
        .unwrap();
    coordinator
        .index_document(index_input(GLOBAL_WORKSPACE, "hare.md", hare_chunk, None), &settings)
        .await
        .unwrap();

    let result = coordinator.retrieve("quick", &[], Scope::Global, &settings, Some("key")).await.unwrap();

    assert!(result.grounded);
    // "quick" only appears lexically in fox.md, so fox.md gets both a
    // lexical hit (rank 1) and a vector hit (rank 2, since its vector is
    // less similar to the query than hare.md's). hare.md only gets a
    // vector hit (rank 1). fox.md's fused score (1/61 + 1/62) still beats
    // hare.md's (1/61) because it accumulates across both signals.
    assert_eq!(result.chunks.len(), 2);
    assert_eq!(result.chunks[0].source_name, "fox.md");
    assert_eq!(result.chunks[1].source_name, "hare.md");
}

#[tokio::test]
async fn reingest_of_identical_markdown_dedups_to_one_document() {
    let (_dir, coordinator) = build_coordinator(HashMap::new()).await;
    let mut settings = SettingsSnapshot::default();
    settings.embedding_model = String::new();
    let markdown = "# Report\nThe same content, ingested twice.";

    let first = coordinator
        .index_document(index_input(GLOBAL_WORKSPACE, "report.md", markdown, None), &settings)
        .await
        .unwrap();
    let hash = content_hash_of(markdown);
    let indexed_at_first = coordinator
        .storage
        .find_document_by_hash(GLOBAL_WORKSPACE, &hash)
        .unwrap()
        .unwrap()
        .indexed_at;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = coordinator
        .index_document(index_input(GLOBAL_WORKSPACE, "report.md", markdown, None), &settings)
        .await
        .unwrap();

    assert_eq!(first.document_id, second.document_id);

    let indexed_at_second = coordinator
        .storage
        .find_document_by_hash(GLOBAL_WORKSPACE, &hash)
        .unwrap()
        .unwrap()
        .indexed_at;
    assert!(indexed_at_second >= indexed_at_first);

    // Only one row exists for this (workspace, content_hash) pair — the
    // dedup key is a SQL UNIQUE constraint, not an application-side check.
    assert_eq!(coordinator.storage.chunks_for_document(&first.document_id).unwrap().len(), 1);
}

fn content_hash_of(markdown: &str) -> String {
    use sha2::{Digest, Sha256};
    let canonical = markdown.replace("\r\n", "\n").replace('\r', "\n").trim_end().to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[tokio::test]
async fn session_scope_never_leaks_global_documents() {
    let (_dir, coordinator) = build_coordinator(HashMap::new()).await;
    let mut settings = SettingsSnapshot::default();
    settings.embedding_model = String::new();

    coordinator
        .index_document(
            index_input(GLOBAL_WORKSPACE, "global.md", "# Global\nshared secret topic details.", None),
            &settings,
        )
        .await
        .unwrap();
    let session_outcome = coordinator
        .index_document(
            index_input(GLOBAL_WORKSPACE, "session.md", "# Session\nsession scoped topic details.", Some("sess-1")),
            &settings,
        )
        .await
        .unwrap();

    let result = coordinator
        .retrieve("topic details", &[], Scope::Session { session_id: "sess-1".to_string() }, &settings, None)
        .await
        .unwrap();

    assert!(result.grounded);
    assert!(result.chunks.iter().all(|c| c.document_id == session_outcome.document_id));
}

#[tokio::test]
async fn cleanup_removes_only_stale_session_documents_past_retention() {
    let (_dir, coordinator) = build_coordinator(HashMap::new()).await;
    let mut settings = SettingsSnapshot::default();
    settings.embedding_model = String::new();

    let stale = coordinator
        .index_document(
            index_input(GLOBAL_WORKSPACE, "stale.md", "# Stale\nold session upload.", Some("sess-expired")),
            &settings,
        )
        .await
        .unwrap();
    coordinator
        .storage
        .mark_stale(&stale.document_id, chrono::Utc::now() - chrono::Duration::days(8))
        .unwrap();

    let fresh_global = coordinator
        .index_document(index_input(GLOBAL_WORKSPACE, "global.md", "# Keep\nnever tombstoned.", None), &settings)
        .await
        .unwrap();

    let report = coordinator.cleanup_stale(Some(7)).unwrap();
    assert_eq!(report.removed_documents, 1);

    assert!(coordinator.storage.chunks_for_document(&stale.document_id).unwrap().is_empty());
    assert!(!coordinator.storage.chunks_for_document(&fresh_global.document_id).unwrap().is_empty());
}
