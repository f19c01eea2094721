use serde::{Deserialize, Serialize};

/// Maximum allowed length for search/rescan path inputs (characters).
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Extensions the Watcher treats as candidate source artifacts. The engine
/// itself is content-type agnostic once it receives Markdown (spec.md
/// explicitly delegates PDF-to-Markdown conversion externally), so this list
/// only bounds what the directory walk considers worth hashing and handing
/// to the host for conversion.
pub const WATCHED_EXTENSIONS: &[&str] = &["md", "mdx", "markdown", "txt", "pdf"];

pub fn is_watched_extension(ext: &str) -> bool {
    WATCHED_EXTENSIONS.contains(&ext)
}

/// Directory names the Watcher's rescan walk never descends into.
const EXCLUDED_DIR_NAMES: &[&str] = &[
    "node_modules", ".git", "target", "dist", "build", "out", ".next", ".nuxt",
    ".cache", "__pycache__", ".venv", "venv", ".tox", ".mypy_cache", ".pytest_cache",
    "coverage", ".idea", ".vscode",
];

/// True when `name` is a directory the rescan walk should skip entirely.
pub fn is_excluded_directory(name: &str) -> bool {
    EXCLUDED_DIR_NAMES.contains(&name)
}

/// True when `name` matches one of the host-supplied exclude glob patterns.
/// Patterns are simple `*`-wildcard globs (no full glob syntax), matching
/// the lightweight matching the rest of the pack uses for user excludes.
pub fn matches_user_exclude_patterns(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| glob_match(pattern, name))
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        _ if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 1 => {
            candidate.contains(&pattern[1..pattern.len() - 1])
        }
        (Some(suffix), _) => candidate.ends_with(suffix),
        (_, Some(prefix)) => candidate.starts_with(prefix),
        _ => candidate == pattern,
    }
}

/// Process-level configuration, read once at startup from the environment.
/// Distinct from [`SettingsSnapshot`], which is the hot-reloadable,
/// per-request record the Retriever and Indexer consume (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,
    pub db_path: String,
    pub max_file_size_bytes: usize,
    pub watcher_debounce_ms: u64,
    pub watcher_queue_capacity: usize,
    pub indexing_concurrency: usize,
    pub indexing_job_timeout_secs: u64,
    pub cleanup_interval_hours: u64,
    pub embedding_endpoint: String,
    pub embedding_api_key: Option<String>,
    pub retrieval_soft_deadline_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("RAG_PORT").unwrap_or_else(|_| "9731".to_string());

        let data_dir = std::env::var("RAG_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("rag-engine").to_string_lossy().to_string())
                .unwrap_or_else(|| ".rag-engine-data".to_string())
        });

        let db_path = std::env::var("RAG_DB_PATH")
            .unwrap_or_else(|_| format!("{}/engine.sqlite3", data_dir));

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,
            db_path,
            max_file_size_bytes: std::env::var("RAG_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25 * 1024 * 1024),
            watcher_debounce_ms: std::env::var("RAG_WATCHER_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2500),
            watcher_queue_capacity: std::env::var("RAG_WATCHER_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            indexing_concurrency: std::env::var("RAG_INDEXING_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            indexing_job_timeout_secs: std::env::var("RAG_INDEXING_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            cleanup_interval_hours: std::env::var("RAG_CLEANUP_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            embedding_endpoint: std::env::var("RAG_EMBEDDING_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:11434/api/embed".to_string()),
            embedding_api_key: std::env::var("RAG_EMBEDDING_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            retrieval_soft_deadline_ms: std::env::var("RAG_RETRIEVAL_SOFT_DEADLINE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }
}

/// Hot-reloadable settings the Retriever and Indexer consume on every call.
/// Read-only from the engine's perspective — owned and persisted by the
/// host application. See spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub enabled: bool,
    pub scope_preference: ScopePreference,
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    pub k_lex: usize,
    pub k_vec: usize,
    pub rrf_k: f64,
    pub max_candidates: usize,
    pub embedding_model: String,
    pub enable_query_rewrite: bool,
    pub enable_llm_rerank: bool,
    pub retention_days: i64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            enabled: true,
            scope_preference: ScopePreference::Global,
            chunk_size_chars: 1200,
            chunk_overlap_chars: 150,
            k_lex: 8,
            k_vec: 8,
            rrf_k: 60.0,
            max_candidates: 50,
            embedding_model: String::new(),
            enable_query_rewrite: false,
            enable_llm_rerank: false,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePreference {
    Global,
    Workspace,
}

impl SettingsSnapshot {
    pub fn validate_chunking(&self) -> Result<(), String> {
        if !(200..=5000).contains(&self.chunk_size_chars) {
            return Err(format!(
                "chunk_size_chars {} out of range 200..=5000",
                self.chunk_size_chars
            ));
        }
        if self.chunk_overlap_chars >= self.chunk_size_chars {
            return Err("chunk_overlap_chars must be < chunk_size_chars".to_string());
        }
        if self.chunk_overlap_chars > 1000 {
            return Err("chunk_overlap_chars out of range 0..=1000".to_string());
        }
        Ok(())
    }
}
