//! The Coordinator (spec.md §2, §9 "process-wide mutable singletons →
//! explicit dependency passing"): wires Storage, Indexer, Watcher,
//! Retriever, DecisionGraph, and CleanupService, owns their lifecycles, and
//! exposes the external interface of spec.md §6. No global state — every
//! instance here is an explicit field the route handlers borrow through
//! `Arc<Coordinator>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::cache::{MarkdownCache, VectorCache, DEFAULT_CACHE_MEMORY_BUDGET_BYTES};
use crate::cleanup::{CleanupReport, CleanupService};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, SettingsSnapshot};
use crate::decision::{DecisionGraph, DecisionInput, DecisionOutput, IdentityRewriter, QueryRewriter};
use crate::embedding_client::{EmbeddingClient, EmbeddingProvider, HttpEmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::indexer::{IndexInput, IndexOutcome, Indexer, MarkdownConverter};
use crate::retriever::{LlmReranker, RetrievalResult, Retriever};
use crate::storage::{RegistryEntry, Scope, Storage};
use crate::watcher::{WatchJob, Watcher};
use crate::workspace::{Workspace, WorkspaceManager};

/// Events broadcast to connected WebSocket clients and the host UI. Distinct
/// from the teacher's code-search-specific `ServerEvent` this replaces: every
/// variant here names a spec.md §6/§7 operation outcome instead.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "workspace_created")]
    WorkspaceCreated { workspace_id: String, path: String },
    #[serde(rename = "workspace_removed")]
    WorkspaceRemoved { workspace_id: String },
    #[serde(rename = "document_indexed")]
    DocumentIndexed { workspace_id: String, document_id: String, source_name: String, warning: Option<String> },
    #[serde(rename = "indexing_failed")]
    IndexingFailed { source_path: String, error: String },
    #[serde(rename = "indexing_exhausted")]
    IndexingExhausted { source_path: String },
    #[serde(rename = "file_changed")]
    FileChanged { workspace_id: String, path: String, change_type: String },
    #[serde(rename = "cleanup_completed")]
    CleanupCompleted { removed_documents: usize },
}

/// A `MarkdownConverter` that refuses PDFs. The real converter is an
/// external collaborator (spec.md §1 "PDF-to-Markdown conversion... consumed
/// as a `(markdown_text, source_name)` pair"); this stub keeps the engine
/// self-contained until the host injects one via [`Coordinator::with_markdown_converter`].
struct UnconfiguredPdfConverter;

#[async_trait::async_trait]
impl MarkdownConverter for UnconfiguredPdfConverter {
    async fn convert(&self, pdf_path: &Path) -> EngineResult<String> {
        Err(EngineError::BadRequest(format!(
            "no MarkdownConverter configured; cannot convert {}",
            pdf_path.display()
        )))
    }
}

pub struct Coordinator {
    pub config: AppConfig,
    pub storage: Arc<Storage>,
    pub workspace_manager: Arc<WorkspaceManager>,
    pub indexer: Arc<Indexer>,
    pub retriever: Arc<Retriever>,
    pub decision: Arc<DecisionGraph>,
    pub cleanup: Arc<CleanupService>,
    pub watcher: Arc<Watcher>,
    pdf_converter: Arc<dyn MarkdownConverter>,
    settings: RwLock<SettingsSnapshot>,
    event_tx: broadcast::Sender<ServerEvent>,
    watch_job_rx: std::sync::Mutex<Option<tokio::sync::mpsc::Receiver<WatchJob>>>,
}

impl Coordinator {
    pub async fn new(config: AppConfig) -> EngineResult<Self> {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(config.embedding_endpoint.clone()));
        Self::with_embedding_provider(config, provider).await
    }

    pub async fn with_embedding_provider(config: AppConfig, provider: Arc<dyn EmbeddingProvider>) -> EngineResult<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let storage = Arc::new(Storage::initialize(&config.db_path)?);
        let workspace_manager = Arc::new(WorkspaceManager::new(data_dir.clone()));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let embeddings = Arc::new(EmbeddingClient::new(provider));
        let markdown_cache = Arc::new(MarkdownCache::with_memory_budget_bytes(DEFAULT_CACHE_MEMORY_BUDGET_BYTES / 2));
        let vector_cache = Arc::new(VectorCache::with_memory_budget_bytes(DEFAULT_CACHE_MEMORY_BUDGET_BYTES / 2));

        let indexer = Arc::new(
            Indexer::new(storage.clone(), embeddings.clone(), markdown_cache, vector_cache, clock.clone())
                .with_concurrency(config.indexing_concurrency)
                .with_job_timeout(std::time::Duration::from_secs(config.indexing_job_timeout_secs)),
        );

        let retriever = Arc::new(
            Retriever::new(storage.clone(), embeddings, clock)
                .with_soft_deadline(std::time::Duration::from_millis(config.retrieval_soft_deadline_ms)),
        );

        let rewriter: Arc<dyn QueryRewriter> = Arc::new(IdentityRewriter);
        let decision = Arc::new(DecisionGraph::new(retriever.clone(), rewriter));

        let cleanup = Arc::new(CleanupService::new(storage.clone(), SettingsSnapshot::default().retention_days));

        let (watcher, job_rx) = Watcher::new(storage.clone(), config.watcher_queue_capacity, config.watcher_debounce_ms, Vec::new());
        let watcher = Arc::new(watcher);

        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            config,
            storage,
            workspace_manager,
            indexer,
            retriever,
            decision,
            cleanup,
            watcher,
            pdf_converter: Arc::new(UnconfiguredPdfConverter),
            settings: RwLock::new(SettingsSnapshot::default()),
            event_tx,
            watch_job_rx: std::sync::Mutex::new(Some(job_rx)),
        })
    }

    /// Starts the Coordinator's background tasks: the consumer that drives
    /// the Watcher's job queue into the Indexer, and a bridge that relays
    /// `WatcherEvent`s (spec.md §4.5) onto the Coordinator's own
    /// `ServerEvent` broadcast so a single subscription sees everything.
    /// Takes `self` as an `Arc` so the spawned tasks can outlive the
    /// caller's stack frame; call once, right after wrapping the freshly
    /// built `Coordinator` in an `Arc` (see `main.rs`).
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        if let Some(job_rx) = self.watch_job_rx.lock().ok().and_then(|mut g| g.take()) {
            let this = self.clone();
            tokio::spawn(async move { this.run_watch_consumer(job_rx).await });
        }

        let this = self.clone();
        let mut watcher_events = self.watcher.subscribe();
        tokio::spawn(async move {
            loop {
                match watcher_events.recv().await {
                    Ok(crate::watcher::WatcherEvent::FileChanged { workspace_id, path, change_type }) => {
                        let _ = this.event_tx.send(ServerEvent::FileChanged { workspace_id, path, change_type });
                    }
                    Ok(crate::watcher::WatcherEvent::JobExhausted { path }) => {
                        let _ = this.event_tx.send(ServerEvent::IndexingExhausted { source_path: path });
                    }
                    // JobFailed is already surfaced as `IndexingFailed` by
                    // `process_watch_job`, which has the richer error text;
                    // forwarding it again here would duplicate every event.
                    Ok(crate::watcher::WatcherEvent::JobFailed { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn with_markdown_converter(mut self, converter: Arc<dyn MarkdownConverter>) -> Self {
        self.pdf_converter = converter;
        self
    }

    pub fn with_llm_reranker(self, _reranker: Arc<dyn LlmReranker>) -> Self {
        // Retriever is already behind an `Arc` shared with the DecisionGraph
        // by the time `new` returns; rerankers are configured before that
        // point via `Retriever::with_llm_reranker` in a custom build, not
        // through this late-binding setter. Kept as a documented no-op seam
        // for hosts that construct their own `Retriever`/`DecisionGraph`
        // pair instead of going through `Coordinator::new`.
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub fn current_settings(&self) -> SettingsSnapshot {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: SettingsSnapshot) -> Result<(), String> {
        settings.validate_chunking()?;
        *self.settings.write() = settings;
        Ok(())
    }

    async fn run_watch_consumer(self: Arc<Self>, mut job_rx: tokio::sync::mpsc::Receiver<WatchJob>) {
        while let Some(job) = job_rx.recv().await {
            let this = self.clone();
            tokio::spawn(async move {
                this.process_watch_job(job).await;
            });
        }
    }

    /// Indexes one job off the watch queue; on failure, records it against
    /// the registry and requeues it with backoff until `MAX_RETRY_ATTEMPTS`
    /// is reached (spec.md §4.5 step 3), mirroring the retry shape
    /// `EmbeddingClient::embed_with_retry` uses for embedding calls.
    async fn process_watch_job(&self, job: WatchJob) {
        let path_str = job.path.to_string_lossy().to_string();
        match self.index_from_path(&job).await {
            Ok(outcome) => {
                let _ = self.event_tx.send(ServerEvent::DocumentIndexed {
                    workspace_id: job.workspace_id.clone(),
                    document_id: outcome.document_id,
                    source_name: job.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                    warning: outcome.warning,
                });
            }
            Err(e) => {
                match self.watcher.record_failure(&path_str, &e.to_string()) {
                    Ok(retry_count) if retry_count < crate::watcher::MAX_RETRY_ATTEMPTS => {
                        self.watcher.schedule_retry(job.clone(), retry_count);
                    }
                    Ok(_) => {}
                    Err(log_err) => tracing::warn!("failed to record watcher failure for {path_str}: {log_err}"),
                }
                let _ = self.event_tx.send(ServerEvent::IndexingFailed { source_path: path_str, error: e.to_string() });
            }
        }
    }

    async fn index_from_path(&self, job: &WatchJob) -> EngineResult<IndexOutcome> {
        let metadata = tokio::fs::metadata(&job.path).await?;
        let extension = job.path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        let source_name = job.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

        let (source_type, markdown_text) = if extension == "pdf" {
            let raw_hash = {
                use sha2::{Digest, Sha256};
                let bytes = tokio::fs::read(&job.path).await?;
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>()
            };
            let markdown = self.indexer.convert_with_cache(self.pdf_converter.as_ref(), &raw_hash, &job.path).await?;
            ("pdf".to_string(), markdown)
        } else {
            ("artifact".to_string(), tokio::fs::read_to_string(&job.path).await?)
        };

        let settings = self.current_settings();
        let input = IndexInput {
            workspace_id: job.workspace_id.clone(),
            source_type,
            source_name,
            source_path: Some(job.path.to_string_lossy().to_string()),
            markdown_text,
            session_id: job.session_id.clone(),
            artifact_entry_id: None,
            file_size: metadata.len() as i64,
        };

        self.indexer.index_document(input, &settings, self.config.embedding_api_key.as_deref()).await
    }

    // ---- spec.md §6 exposed operations ----

    pub async fn index_document(&self, input: IndexInput, settings: &SettingsSnapshot) -> EngineResult<IndexOutcome> {
        if !self.workspace_is_known(&input.workspace_id) {
            return Err(EngineError::WorkspaceNotFound(input.workspace_id));
        }
        let workspace_id = input.workspace_id.clone();
        let source_name = input.source_name.clone();
        let outcome = self.indexer.index_document(input, settings, self.config.embedding_api_key.as_deref()).await?;
        let _ = self.event_tx.send(ServerEvent::DocumentIndexed {
            workspace_id,
            document_id: outcome.document_id.clone(),
            source_name,
            warning: outcome.warning.clone(),
        });
        Ok(outcome)
    }

    pub async fn retrieve(
        &self,
        query: &str,
        query_variants: &[String],
        scope: Scope,
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> EngineResult<RetrievalResult> {
        let api_key = api_key.or(self.config.embedding_api_key.as_deref());
        self.retriever.retrieve(query, query_variants, scope, settings, api_key).await
    }

    pub async fn decide_and_retrieve(&self, input: DecisionInput, settings: &SettingsSnapshot) -> EngineResult<DecisionOutput> {
        self.decision.run(input, settings).await
    }

    pub async fn enqueue_file(&self, workspace_id: &str, path: &Path) -> EngineResult<String> {
        if !self.workspace_is_known(workspace_id) {
            return Err(EngineError::WorkspaceNotFound(workspace_id.to_string()));
        }
        self.watcher.enqueue_file(workspace_id, path).await
    }

    pub async fn rescan(&self, workspace_id: &str, root: &Path) -> EngineResult<usize> {
        if !self.workspace_is_known(workspace_id) {
            return Err(EngineError::WorkspaceNotFound(workspace_id.to_string()));
        }
        self.watcher.rescan(workspace_id, root).await
    }

    pub fn list_registry(&self, status_filter: Option<&str>) -> EngineResult<Vec<RegistryEntry>> {
        self.storage.registry_list(status_filter)
    }

    pub fn cleanup_stale(&self, retention_days_override: Option<i64>) -> EngineResult<CleanupReport> {
        let report = self.cleanup.run_once(retention_days_override)?;
        let _ = self.event_tx.send(ServerEvent::CleanupCompleted { removed_documents: report.removed_documents });
        Ok(report)
    }

    fn workspace_is_known(&self, workspace_id: &str) -> bool {
        workspace_id == crate::storage::GLOBAL_WORKSPACE || self.workspace_manager.get_workspace(workspace_id).is_ok()
    }

    // ---- workspace CRUD (spec.md §3 Workspace, backed by Storage::ensure_workspace) ----

    pub fn create_workspace(&self, name: String, path: String) -> EngineResult<Workspace> {
        let ws = self.workspace_manager.create_workspace(name, path)?;
        self.storage.ensure_workspace(&ws.id, &ws.name)?;
        self.watcher.start_watching(&ws.id, &ws.path)?;
        let _ = self.event_tx.send(ServerEvent::WorkspaceCreated { workspace_id: ws.id.clone(), path: ws.path.clone() });
        Ok(ws)
    }

    pub fn list_workspaces(&self) -> Vec<Workspace> {
        self.workspace_manager.list_workspaces()
    }

    pub fn get_workspace(&self, id: &str) -> EngineResult<Workspace> {
        self.workspace_manager.get_workspace(id)
    }

    pub fn remove_workspace(&self, id: &str) -> EngineResult<()> {
        self.watcher.stop_watching(id);
        self.workspace_manager.remove_workspace(id)?;
        let _ = self.event_tx.send(ServerEvent::WorkspaceRemoved { workspace_id: id.to_string() });
        Ok(())
    }

    pub fn activate_workspace(&self, id: &str) -> EngineResult<Workspace> {
        self.workspace_manager.activate_workspace(id)
    }

    /// Restores watchers for every persisted workspace; called once at
    /// startup after the listener is bound (see `main.rs`).
    pub fn restore_watchers(&self) {
        for ws in self.workspace_manager.list_workspaces() {
            if let Err(e) = self.watcher.start_watching(&ws.id, &ws.path) {
                tracing::warn!("failed to restore watcher for workspace {}: {e}", ws.id);
            }
        }
    }
}
