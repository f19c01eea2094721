//! The Watcher (spec.md §4.5): observes configured workspace directories,
//! debounces filesystem events to quiescence, hashes candidate files against
//! the registry, and enqueues indexing jobs onto a bounded work queue.
//! Manual rescan walks a directory once through the same hash-and-dedup path.
//!
//! Two enqueue paths exist because the spec asks for two different
//! backpressure behaviors (§5 vs §6's `enqueue_file` error table): the
//! watcher's own debounced dispatch and `rescan` block on a full queue
//! (natural backpressure during bulk import), while the externally exposed
//! `enqueue_file` operation fails fast with `QueueFull` so a caller isn't
//! stuck waiting on an HTTP request. See `DESIGN.md`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use ignore::WalkBuilder;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};

use crate::config::{is_excluded_directory, is_watched_extension, matches_user_exclude_patterns};
use crate::error::{EngineError, EngineResult};
use crate::storage::Storage;

/// spec.md §4.5 step 3: retry up to 3 times before exhaustion.
pub const MAX_RETRY_ATTEMPTS: i64 = 3;

/// Base delay for [`Watcher::schedule_retry`]'s exponential backoff, the
/// same doubling shape as `embedding_client::embed_with_retry`.
const RETRY_BASE_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct WatchJob {
    pub workspace_id: String,
    pub path: PathBuf,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WatcherEvent {
    FileChanged { workspace_id: String, path: String, change_type: String },
    JobFailed { path: String, error: String, retry_count: i64 },
    JobExhausted { path: String },
}

struct WatcherHandle {
    _debouncer: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>,
}

pub struct Watcher {
    storage: std::sync::Arc<Storage>,
    job_tx: mpsc::Sender<WatchJob>,
    handles: DashMap<String, WatcherHandle>,
    debounce: std::time::Duration,
    user_exclude_patterns: Vec<String>,
    event_tx: broadcast::Sender<WatcherEvent>,
}

impl Watcher {
    /// Returns the watcher plus the receiving half of its bounded job queue;
    /// the Coordinator drives the receiver into the Indexer.
    pub fn new(
        storage: std::sync::Arc<Storage>,
        queue_capacity: usize,
        debounce_ms: u64,
        user_exclude_patterns: Vec<String>,
    ) -> (Self, mpsc::Receiver<WatchJob>) {
        let (job_tx, job_rx) = mpsc::channel(queue_capacity.max(1));
        let (event_tx, _) = broadcast::channel(1024);
        (
            Self {
                storage,
                job_tx,
                handles: DashMap::new(),
                debounce: std::time::Duration::from_millis(debounce_ms),
                user_exclude_patterns,
                event_tx,
            },
            job_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.event_tx.subscribe()
    }

    /// Begins observing `path` for workspace `workspace_id`. A 2-3s
    /// quiescence debounce precedes any dispatch (spec.md §4.5 step 1).
    pub fn start_watching(&self, workspace_id: &str, path: &str) -> EngineResult<()> {
        if self.handles.contains_key(workspace_id) {
            return Ok(());
        }

        let ws_id = workspace_id.to_string();
        let ws_path = PathBuf::from(path);
        let job_tx = self.job_tx.clone();
        let event_tx = self.event_tx.clone();
        let excludes = self.user_exclude_patterns.clone();
        let rt_handle = tokio::runtime::Handle::try_current().ok();

        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let mut changed: HashMap<PathBuf, String> = HashMap::new();
                    for event in &events {
                        let change_type = classify_debounced_event(event);
                        if change_type == "access" || change_type == "other" {
                            continue;
                        }
                        for p in &event.paths {
                            if !is_candidate_path(p, &excludes) {
                                continue;
                            }
                            changed.insert(p.clone(), change_type.to_string());
                        }
                    }

                    for (path, change_type) in changed {
                        let _ = event_tx.send(WatcherEvent::FileChanged {
                            workspace_id: ws_id.clone(),
                            path: path.to_string_lossy().to_string(),
                            change_type,
                        });

                        if let Some(handle) = &rt_handle {
                            let tx = job_tx.clone();
                            let job = WatchJob {
                                workspace_id: ws_id.clone(),
                                path: path.clone(),
                                session_id: None,
                            };
                            // Blocking send: natural backpressure on bulk
                            // changes (spec.md §5 Backpressure).
                            handle.spawn(async move {
                                if tx.send(job).await.is_err() {
                                    tracing::warn!("watch queue closed, dropping job");
                                }
                            });
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::warn!("watcher error: {e:?}");
                    }
                }
            }
        })?;

        debouncer.watch(ws_path.as_path(), RecursiveMode::Recursive)?;
        self.handles.insert(workspace_id.to_string(), WatcherHandle { _debouncer: debouncer });
        tracing::info!(workspace_id, path, "started watching directory");
        Ok(())
    }

    pub fn stop_watching(&self, workspace_id: &str) {
        if self.handles.remove(workspace_id).is_some() {
            tracing::info!(workspace_id, "stopped watching");
        }
    }

    pub fn is_watching(&self, workspace_id: &str) -> bool {
        self.handles.contains_key(workspace_id)
    }

    /// Hashes `path` and consults the registry (spec.md §4.5 step 2).
    /// Returns `None` when the file is already indexed under this hash (the
    /// caller should skip it); otherwise returns the path string and hash
    /// ready to be marked `pending` and enqueued.
    async fn hash_and_check(&self, path: &Path) -> EngineResult<Option<(String, String)>> {
        if !path.is_absolute() {
            return Err(EngineError::PathInvalid(format!("path must be absolute: {}", path.display())));
        }
        let path_str = path.to_string_lossy().to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::PathInvalid(format!("cannot read {}: {e}", path.display())))?;
        let hash = content_hash_bytes(&bytes);

        if let Some(entry) = self.storage.registry_get(&path_str)? {
            if entry.status == "indexed" && entry.content_hash.as_deref() == Some(hash.as_str()) {
                self.storage.registry_touch_seen(&path_str)?;
                return Ok(None);
            }
        }
        self.storage.registry_upsert_pending(&path_str, &hash)?;
        Ok(Some((path_str, hash)))
    }

    /// Internal dispatch path used by the watcher's own event loop and by
    /// `rescan`: blocks when the queue is full rather than failing.
    async fn enqueue_path(&self, workspace_id: &str, path: &Path) -> EngineResult<Option<String>> {
        let Some((path_str, _hash)) = self.hash_and_check(path).await? else {
            return Ok(None);
        };
        self.job_tx
            .send(WatchJob { workspace_id: workspace_id.to_string(), path: path.to_path_buf(), session_id: None })
            .await
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("watch queue closed")))?;
        Ok(Some(path_str))
    }

    /// The `enqueue_file` operation of spec.md §6: fails fast with
    /// `QueueFull` instead of blocking an external caller indefinitely.
    pub async fn enqueue_file(&self, workspace_id: &str, path: &Path) -> EngineResult<String> {
        let Some((path_str, _hash)) = self.hash_and_check(path).await? else {
            return Ok(path.to_string_lossy().to_string());
        };
        match self.job_tx.try_send(WatchJob {
            workspace_id: workspace_id.to_string(),
            path: path.to_path_buf(),
            session_id: None,
        }) {
            Ok(()) => Ok(path_str),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::Internal(anyhow::anyhow!("watch queue closed")))
            }
        }
    }

    /// The `rescan` operation of spec.md §6: walks `root` once, applying the
    /// same hash-and-dedup path as the debounced watcher.
    pub async fn rescan(&self, workspace_id: &str, root: &Path) -> EngineResult<usize> {
        let excludes = self.user_exclude_patterns.clone();
        let candidates: Vec<PathBuf> = tokio::task::spawn_blocking({
            let root = root.to_path_buf();
            move || walk_candidates(&root, &excludes)
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("rescan walk panicked: {e}")))?;

        let mut enqueued = 0usize;
        for path in candidates {
            match self.enqueue_path(workspace_id, &path).await {
                Ok(Some(_)) => enqueued += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("rescan skipped {}: {e}", path.display()),
            }
        }
        Ok(enqueued)
    }

    /// spec.md §4.5 step 3: the retry policy after an indexing job failure.
    /// Bumps `retry_count` in the registry and broadcasts `JobExhausted` once
    /// it reaches the cap so a host UI can offer a retry affordance (spec.md
    /// §7), otherwise `JobFailed`. Returns the post-increment `retry_count`;
    /// the caller (`Coordinator::process_watch_job`) uses it to decide
    /// whether to actually requeue the job via [`Watcher::schedule_retry`] —
    /// this method only does the bookkeeping and the event, the same
    /// separation `embedding_client::embed_with_retry` draws between
    /// recording an attempt and deciding whether to retry it.
    pub fn record_failure(&self, path: &str, error: &str) -> EngineResult<i64> {
        let retry_count = self.storage.registry_mark_failed(path, error)?;
        if retry_count >= MAX_RETRY_ATTEMPTS {
            let _ = self.event_tx.send(WatcherEvent::JobExhausted { path: path.to_string() });
        } else {
            let _ = self.event_tx.send(WatcherEvent::JobFailed {
                path: path.to_string(),
                error: error.to_string(),
                retry_count,
            });
        }
        Ok(retry_count)
    }

    /// Re-enqueues `job` after an exponential backoff delay, mirroring
    /// `embedding_client::embed_with_retry`'s `200ms * 2^attempt` shape.
    /// Call only when `retry_count` (as returned by `record_failure`) is
    /// still under `MAX_RETRY_ATTEMPTS` — the cap decision stays in
    /// `record_failure` so the two never disagree about when a job is
    /// exhausted. A closed queue at delivery time (shutdown mid-backoff) is
    /// logged and dropped, not retried again.
    pub fn schedule_retry(&self, job: WatchJob, retry_count: i64) {
        let delay = std::time::Duration::from_millis(RETRY_BASE_DELAY_MS * 2u64.pow(retry_count.max(0) as u32));
        let job_tx = self.job_tx.clone();
        let path = job.path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if job_tx.send(job).await.is_err() {
                tracing::warn!("watch queue closed, dropping retry for {}", path.display());
            }
        });
    }
}

fn is_candidate_path(path: &Path, excludes: &[String]) -> bool {
    let under_excluded_dir = path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        is_excluded_directory(&name) || matches_user_exclude_patterns(&name, excludes)
    });
    if under_excluded_dir {
        return false;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => is_watched_extension(ext),
        None => false,
    }
}

/// Walks `root` once, filtering to watched-extension files outside excluded
/// directories. The candidate filter runs in parallel via `rayon` once the
/// (cheap, sequential) directory walk has enumerated entries.
fn walk_candidates(root: &Path, excludes: &[String]) -> Vec<PathBuf> {
    let entries: Vec<PathBuf> = WalkBuilder::new(root)
        .hidden(false)
        .build()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect();

    entries
        .into_par_iter()
        .filter(|p| p.is_file() && is_candidate_path(p, excludes))
        .collect()
}

fn content_hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn classify_debounced_event(event: &DebouncedEvent) -> &'static str {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => "create",
        EventKind::Modify(_) => "modify",
        EventKind::Remove(_) => "remove",
        EventKind::Access(_) => "access",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, std::sync::Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(Storage::initialize(dir.path().join("t.sqlite3")).unwrap());
        (dir, storage)
    }

    #[tokio::test]
    async fn enqueue_file_skips_unchanged_indexed_file() {
        let (dir, storage) = open_temp();
        let (watcher, mut rx) = Watcher::new(storage.clone(), 8, 50, vec![]);

        let file = dir.path().join("doc.md");
        tokio::fs::write(&file, b"# Alpha").await.unwrap();
        let path_str = file.to_string_lossy().to_string();
        let bytes = tokio::fs::read(&file).await.unwrap();
        let hash = content_hash_bytes(&bytes);
        storage.registry_upsert_pending(&path_str, &hash).unwrap();
        storage.registry_mark_indexed(&path_str, None).unwrap();

        watcher.enqueue_file("GLOBAL", &file).await.unwrap();
        assert!(rx.try_recv().is_err(), "unchanged indexed file should not enqueue a job");
    }

    #[tokio::test]
    async fn enqueue_file_enqueues_new_file() {
        let (dir, storage) = open_temp();
        let (watcher, mut rx) = Watcher::new(storage, 8, 50, vec![]);

        let file = dir.path().join("doc.md");
        tokio::fs::write(&file, b"# Alpha").await.unwrap();
        watcher.enqueue_file("GLOBAL", &file).await.unwrap();
        let job = rx.try_recv().unwrap();
        assert_eq!(job.path, file);
    }

    #[tokio::test]
    async fn enqueue_file_returns_queue_full_without_blocking() {
        let (dir, storage) = open_temp();
        let (watcher, _rx) = Watcher::new(storage, 1, 50, vec![]);

        let file_a = dir.path().join("a.md");
        let file_b = dir.path().join("b.md");
        tokio::fs::write(&file_a, b"# A").await.unwrap();
        tokio::fs::write(&file_b, b"# B").await.unwrap();

        watcher.enqueue_file("GLOBAL", &file_a).await.unwrap();
        let result = watcher.enqueue_file("GLOBAL", &file_b).await;
        assert!(matches!(result, Err(EngineError::QueueFull)));
    }

    #[tokio::test]
    async fn rescan_finds_watched_files_and_skips_excluded_dirs() {
        let (dir, storage) = open_temp();
        let (watcher, mut rx) = Watcher::new(storage, 16, 50, vec![]);

        tokio::fs::create_dir_all(dir.path().join("node_modules")).await.unwrap();
        tokio::fs::write(dir.path().join("node_modules/skip.md"), b"# skip").await.unwrap();
        tokio::fs::write(dir.path().join("keep.md"), b"# keep").await.unwrap();
        tokio::fs::write(dir.path().join("ignore.png"), b"not text").await.unwrap();

        let enqueued = watcher.rescan("GLOBAL", dir.path()).await.unwrap();
        assert_eq!(enqueued, 1);
        let job = rx.try_recv().unwrap();
        assert!(job.path.ends_with("keep.md"));
    }

    #[test]
    fn record_failure_broadcasts_exhausted_after_cap() {
        let (_dir, storage) = open_temp();
        storage.registry_upsert_pending("/tmp/x.md", "h0").unwrap();
        let (watcher, _rx) = Watcher::new(storage, 8, 50, vec![]);
        let mut events = watcher.subscribe();

        for _ in 0..MAX_RETRY_ATTEMPTS {
            let _retry_count = watcher.record_failure("/tmp/x.md", "boom").unwrap();
        }
        let mut saw_exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WatcherEvent::JobExhausted { .. }) {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn schedule_retry_reenqueues_the_job_after_its_backoff_delay() {
        let (dir, storage) = open_temp();
        let (watcher, mut rx) = Watcher::new(storage, 8, 50, vec![]);

        let file = dir.path().join("doc.md");
        let job = WatchJob { workspace_id: "GLOBAL".to_string(), path: file.clone(), session_id: None };

        watcher.schedule_retry(job, 0);
        assert!(rx.try_recv().is_err(), "job should not be requeued before its backoff delay elapses");

        let requeued = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("retry should have been requeued within the timeout")
            .expect("queue should still be open");
        assert_eq!(requeued.path, file);
    }
}
