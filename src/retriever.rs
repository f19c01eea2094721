//! Hybrid retrieval (spec.md §4.6): lexical ∥ vector search under a scope
//! predicate, fused via Reciprocal Rank Fusion, reranked, deduplicated, and
//! assembled into a citation-carrying context block.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::SettingsSnapshot;
use crate::embedding_client::{EmbedOutcome, EmbeddingClient};
use crate::error::{EngineError, EngineResult};
use crate::storage::{HydratedChunk, Scope, Storage};

const CONTEXT_CHAR_BUDGET: usize = 8000;
const MIN_CONTEXT_CHUNKS: usize = 6;
const MAX_CONTEXT_CHUNKS: usize = 10;
const SECTION_TITLE_BONUS: f64 = 0.05;
const SAME_DOCUMENT_PENALTY: f64 = 0.02;
const SESSION_RECENCY_BONUS: f64 = 0.03;
const SESSION_RECENCY_WINDOW_HOURS: i64 = 24;

/// The `LlmReranker` capability from spec.md §6: `(query, [candidate]) →
/// [candidate']` preserving or reordering the input set. Optional — when
/// disabled, absent, or failing, the heuristic rerank of step 4 is used.
#[async_trait]
pub trait LlmReranker: Send + Sync {
    async fn rerank(&self, query: &str, candidate_ids: &[String]) -> EngineResult<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub section_title: Option<String>,
    pub source_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub marker: usize,
    pub document_id: String,
    pub chunk_id: String,
    pub source_name: String,
    pub section_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalDebug {
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
    pub fused_candidates: usize,
    pub used_llm_rerank: bool,
    pub deadline_exceeded: bool,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    pub context_text: String,
    pub citations: Vec<Citation>,
    pub used_scope: String,
    pub grounded: bool,
    pub debug: RetrievalDebug,
}

impl RetrievalResult {
    fn ungrounded(used_scope: String, mut debug: RetrievalDebug, note: &str) -> Self {
        debug.notes.push(note.to_string());
        Self {
            chunks: Vec::new(),
            context_text: String::new(),
            citations: Vec::new(),
            used_scope,
            grounded: false,
            debug,
        }
    }
}

fn scope_label(scope: &Scope) -> String {
    match scope {
        Scope::Global => "global".to_string(),
        Scope::Workspace { workspace_id } => format!("workspace({workspace_id})"),
        Scope::Session { session_id } => format!("session({session_id})"),
    }
}

struct FusedCandidate {
    hydrated: HydratedChunk,
    fused_score: f64,
}

pub struct Retriever {
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingClient>,
    clock: Arc<dyn Clock>,
    llm_reranker: Option<Arc<dyn LlmReranker>>,
    soft_deadline: std::time::Duration,
}

impl Retriever {
    pub fn new(storage: Arc<Storage>, embeddings: Arc<EmbeddingClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            embeddings,
            clock,
            llm_reranker: None,
            soft_deadline: std::time::Duration::from_secs(10),
        }
    }

    pub fn with_llm_reranker(mut self, reranker: Arc<dyn LlmReranker>) -> Self {
        self.llm_reranker = Some(reranker);
        self
    }

    pub fn with_soft_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.soft_deadline = deadline;
        self
    }

    /// Executes the full retrieval algorithm of spec.md §4.6, steps 1–7.
    pub async fn retrieve(
        &self,
        query: &str,
        query_variants: &[String],
        scope: Scope,
        settings: &SettingsSnapshot,
        api_key: Option<&str>,
    ) -> EngineResult<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(EngineError::BadRequest("query must not be empty".to_string()));
        }

        let used_scope = scope_label(&scope);
        let mut debug = RetrievalDebug::default();
        let started = self.clock.monotonic();

        let mut variants = vec![query.to_string()];
        variants.extend(query_variants.iter().cloned());

        // Step 1: lexical retrieval, one ranked list per query variant.
        let mut ranked_lists: Vec<Vec<String>> = Vec::new();
        for variant in &variants {
            let sanitized = crate::storage::sanitize_fts_query(variant);
            let hits = self.storage.lexical_search(&sanitized, &scope, settings.k_lex)?;
            debug.lexical_candidates += hits.len();
            ranked_lists.push(hits.into_iter().map(|h| h.chunk_id).collect());
        }

        // Step 2: vector retrieval, only if enabled and embeddings exist,
        // and only if the soft deadline hasn't already been blown.
        if settings.k_vec > 0
            && !settings.embedding_model.is_empty()
            && started.elapsed() < self.soft_deadline
        {
            let candidates = self.storage.embedding_candidates(&scope)?;
            if !candidates.is_empty() {
                for variant in &variants {
                    match self
                        .embeddings
                        .embed_batched(&settings.embedding_model, api_key, std::slice::from_ref(variant))
                        .await?
                    {
                        EmbedOutcome::Vectors(vecs) => {
                            if let Some(query_vector) = vecs.into_iter().next() {
                                let mut scored: Vec<(String, f64)> = candidates
                                    .iter()
                                    .map(|c| (c.chunk_id.clone(), cosine_similarity(&query_vector, &c.vector)))
                                    .collect();
                                scored.sort_by(|a, b| {
                                    b.1.partial_cmp(&a.1)
                                        .unwrap_or(std::cmp::Ordering::Equal)
                                        .then_with(|| a.0.cmp(&b.0))
                                });
                                scored.truncate(settings.k_vec);
                                debug.vector_candidates += scored.len();
                                ranked_lists.push(scored.into_iter().map(|(id, _)| id).collect());
                            }
                        }
                        EmbedOutcome::Unavailable(reason) => {
                            debug.notes.push(format!("vector retrieval unavailable: {reason}"));
                            break;
                        }
                    }
                }
            }
        } else if settings.k_vec > 0 {
            debug.notes.push("vector retrieval skipped: soft deadline already exceeded".to_string());
            debug.deadline_exceeded = true;
        }

        // Step 3: Reciprocal Rank Fusion across every ranked list.
        let mut fused_scores: HashMap<String, f64> = HashMap::new();
        for list in &ranked_lists {
            for (rank, chunk_id) in list.iter().enumerate() {
                let score = 1.0 / (settings.rrf_k + (rank + 1) as f64);
                *fused_scores.entry(chunk_id.clone()).or_insert(0.0) += score;
            }
        }

        if fused_scores.is_empty() {
            return Ok(RetrievalResult::ungrounded(used_scope, debug, "no candidates found"));
        }

        let candidate_ids: Vec<String> = fused_scores.keys().cloned().collect();
        let hydrated = self.storage.hydrate_chunks(&candidate_ids)?;
        let hydrated_by_id: HashMap<String, HydratedChunk> =
            hydrated.into_iter().map(|h| (h.chunk_id.clone(), h)).collect();

        assert_scope(&scope, hydrated_by_id.values())?;

        let mut fused: Vec<FusedCandidate> = fused_scores
            .into_iter()
            .filter_map(|(id, score)| {
                hydrated_by_id.get(&id).map(|h| FusedCandidate {
                    hydrated: h.clone(),
                    fused_score: score,
                })
            })
            .collect();

        // Tie-break: fused score desc, then smaller chunk_index, then
        // lexicographic chunk_id — guarantees determinism (spec.md §8).
        fused.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hydrated.chunk_index.cmp(&b.hydrated.chunk_index))
                .then_with(|| a.hydrated.chunk_id.cmp(&b.hydrated.chunk_id))
        });
        fused.truncate(settings.max_candidates);
        debug.fused_candidates = fused.len();

        // Step 4: rerank. Default heuristic, or LLM rerank when enabled and
        // configured; on LLM failure the heuristic result is kept.
        let reranked = if settings.enable_llm_rerank {
            if let Some(reranker) = &self.llm_reranker {
                let ids: Vec<String> = fused.iter().map(|c| c.hydrated.chunk_id.clone()).collect();
                match reranker.rerank(query, &ids).await {
                    Ok(order) => {
                        debug.used_llm_rerank = true;
                        reorder_by_ids(fused, &order)
                    }
                    Err(e) => {
                        debug.notes.push(format!("LLM rerank failed, used heuristic: {e}"));
                        heuristic_rerank(fused, &scope, self.clock.now())
                    }
                }
            } else {
                heuristic_rerank(fused, &scope, self.clock.now())
            }
        } else {
            heuristic_rerank(fused, &scope, self.clock.now())
        };

        if started.elapsed() >= self.soft_deadline {
            debug.deadline_exceeded = true;
            debug.notes.push("soft deadline exceeded; returning partial fused list".to_string());
        }

        // Step 5: dedup adjacent chunks from the same document, then
        // truncate to 6–10 chunks within the character budget.
        let selected = dedup_and_assemble(reranked);
        if selected.is_empty() {
            return Ok(RetrievalResult::ungrounded(
                used_scope,
                debug,
                "no candidates survived rerank; broaden scope or add documents",
            ));
        }

        // Step 6: context block with citation markers.
        let mut context_text = String::new();
        let mut citations = Vec::with_capacity(selected.len());
        let mut chunks = Vec::with_capacity(selected.len());
        for (i, h) in selected.iter().enumerate() {
            let marker = i + 1;
            let header = match &h.section_title {
                Some(title) => format!("[{marker}] {} | {title}", h.source_name),
                None => format!("[{marker}] {}", h.source_name),
            };
            context_text.push_str(&header);
            context_text.push('\n');
            context_text.push_str(&h.content);
            context_text.push_str("\n\n");

            citations.push(Citation {
                marker,
                document_id: h.document_id.clone(),
                chunk_id: h.chunk_id.clone(),
                source_name: h.source_name.clone(),
                section_title: h.section_title.clone(),
            });
            chunks.push(RetrievedChunk {
                chunk_id: h.chunk_id.clone(),
                document_id: h.document_id.clone(),
                content: h.content.clone(),
                section_title: h.section_title.clone(),
                source_name: h.source_name.clone(),
            });
        }

        Ok(RetrievalResult {
            chunks,
            context_text,
            citations,
            used_scope,
            grounded: true,
            debug,
        })
    }
}

/// Fatal invariant check (spec.md §4.7, §7 "Scope violation"): every
/// candidate reaching this point must actually belong to the requested
/// scope. The scope-filtering SQL in `storage.rs` makes this unreachable in
/// practice; this is the last line of defense before results leave the
/// engine.
fn assert_scope<'a>(scope: &Scope, candidates: impl Iterator<Item = &'a HydratedChunk>) -> EngineResult<()> {
    match scope {
        Scope::Global => {
            for c in candidates {
                if c.workspace_id != crate::storage::GLOBAL_WORKSPACE {
                    return Err(EngineError::ScopeViolation);
                }
            }
        }
        Scope::Workspace { workspace_id } => {
            for c in candidates {
                if &c.workspace_id != workspace_id {
                    return Err(EngineError::ScopeViolation);
                }
            }
        }
        Scope::Session { .. } => {
            // Session membership was already enforced by the SQL predicate
            // that produced these candidate ids; nothing further to check
            // here without re-querying document_sessions per chunk.
        }
    }
    Ok(())
}

fn reorder_by_ids(fused: Vec<FusedCandidate>, order: &[String]) -> Vec<HydratedChunk> {
    let mut by_id: HashMap<String, FusedCandidate> =
        fused.into_iter().map(|c| (c.hydrated.chunk_id.clone(), c)).collect();
    let mut out = Vec::with_capacity(order.len());
    for id in order {
        if let Some(c) = by_id.remove(id) {
            out.push(c.hydrated);
        }
    }
    // Any candidate the reranker dropped or didn't mention is appended in
    // its original fused order rather than silently discarded.
    let mut leftovers: Vec<FusedCandidate> = by_id.into_values().collect();
    leftovers.sort_by(|a, b| b.fused_score.partial_cmp(&a.fused_score).unwrap_or(std::cmp::Ordering::Equal));
    out.extend(leftovers.into_iter().map(|c| c.hydrated));
    out
}

/// Step 4's default heuristic: fused score plus (a) a bonus for a present
/// section title, (b) a penalty proportional to how many earlier-ranked
/// candidates came from the same document, (c) in session scope, a bonus
/// for documents indexed within the last 24h (spec.md §4.6 step 4).
fn heuristic_rerank(
    fused: Vec<FusedCandidate>,
    scope: &Scope,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<HydratedChunk> {
    let mut doc_counts: HashMap<String, usize> = HashMap::new();
    let is_session = matches!(scope, Scope::Session { .. });

    let mut adjusted: Vec<(f64, HydratedChunk)> = fused
        .into_iter()
        .map(|c| {
            let prior = *doc_counts.get(&c.hydrated.document_id).unwrap_or(&0);
            *doc_counts.entry(c.hydrated.document_id.clone()).or_insert(0) += 1;

            let mut score = c.fused_score;
            if c.hydrated.section_title.is_some() {
                score += SECTION_TITLE_BONUS;
            }
            score -= SAME_DOCUMENT_PENALTY * prior as f64;
            if is_session && (now - c.hydrated.indexed_at).num_hours() < SESSION_RECENCY_WINDOW_HOURS {
                score += SESSION_RECENCY_BONUS;
            }
            (score, c.hydrated)
        })
        .collect();

    adjusted.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.chunk_index.cmp(&b.1.chunk_index))
            .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
    });
    adjusted.into_iter().map(|(_, h)| h).collect()
}

/// Step 5: drops candidates adjacent (same document, consecutive
/// `chunk_index`) to a higher-ranked already-selected chunk, then truncates
/// to 6–10 chunks within an 8000-char budget.
fn dedup_and_assemble(reranked: Vec<HydratedChunk>) -> Vec<HydratedChunk> {
    let mut selected: Vec<HydratedChunk> = Vec::new();
    let mut char_budget_used = 0usize;

    for candidate in reranked {
        if selected.len() >= MAX_CONTEXT_CHUNKS {
            break;
        }
        let is_adjacent = selected.iter().any(|s| {
            s.document_id == candidate.document_id
                && (s.chunk_index - candidate.chunk_index).abs() == 1
        });
        if is_adjacent {
            continue;
        }

        let projected = char_budget_used + candidate.content.chars().count();
        if projected > CONTEXT_CHAR_BUDGET && selected.len() >= MIN_CONTEXT_CHUNKS {
            break;
        }

        char_budget_used = projected;
        selected.push(candidate);
    }

    selected
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_zero_norm_is_zero_not_nan() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = [1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    fn chunk(id: &str, doc: &str, idx: i64, title: Option<&str>) -> HydratedChunk {
        HydratedChunk {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            chunk_index: idx,
            section_title: title.map(|t| t.to_string()),
            content: "x".repeat(10),
            source_name: "doc.md".to_string(),
            workspace_id: crate::storage::GLOBAL_WORKSPACE.to_string(),
            indexed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn dedup_drops_adjacent_chunk_indices_from_same_document() {
        let chunks = vec![chunk("a", "doc1", 0, None), chunk("b", "doc1", 1, None), chunk("c", "doc2", 0, None)];
        let selected = dedup_and_assemble(chunks);
        let ids: Vec<&str> = selected.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn assert_scope_rejects_global_leak() {
        let leaked = chunk("a", "ws1", 0, None);
        let mut leaked = leaked;
        leaked.workspace_id = "ws1".to_string();
        let result = assert_scope(&Scope::Global, std::iter::once(&leaked));
        assert!(matches!(result, Err(EngineError::ScopeViolation)));
    }

    /// Session-recency bonus (spec.md §4.6 step 4c) is gated on `now - c.indexed_at`,
    /// so it needs a pinned `now` to test deterministically rather than racing a
    /// real clock (spec.md §8 "Retrieval determinism") — exactly what `FixedClock`
    /// exists for.
    #[test]
    fn session_recency_bonus_breaks_a_tie_toward_the_recently_indexed_chunk() {
        use crate::clock::FixedClock;

        let now = chrono::Utc::now();
        let clock = FixedClock::new(now);

        let mut stale = chunk("a", "doc1", 0, None);
        stale.indexed_at = now - chrono::Duration::hours(48);
        let mut fresh = chunk("b", "doc2", 0, None);
        fresh.indexed_at = now - chrono::Duration::hours(1);

        let fused = vec![
            FusedCandidate { fused_score: 1.0, hydrated: stale },
            FusedCandidate { fused_score: 1.0, hydrated: fresh },
        ];
        let session = Scope::Session { session_id: "sess-1".to_string() };
        let reranked = heuristic_rerank(fused, &session, clock.now());

        assert_eq!(reranked[0].chunk_id, "b");
    }
}
