//! The retrieval decision subgraph (spec.md §4.7): a four-node state
//! machine — `Decide` → `SelectScope` → `RewriteQuery` → `{LocalExecute |
//! GlobalExecute}` — that the chat dialog graph calls before answering a
//! user message. Cooperative: each node completes before the next runs;
//! there are no suspension points mid-node that cross a storage transaction.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SettingsSnapshot;
use crate::error::EngineResult;
use crate::retriever::{RetrievalResult, Retriever};
use crate::storage::Scope;

/// The `QueryRewriter` capability from spec.md §6: `(text) → [variant]`,
/// length 1..3. Failure falls back to the original query untouched.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, query: &str) -> EngineResult<Vec<String>>;
}

/// A rewriter that never changes the query, used when
/// `enable_query_rewrite` is off or no capability is configured.
pub struct IdentityRewriter;

#[async_trait]
impl QueryRewriter for IdentityRewriter {
    async fn rewrite(&self, _query: &str) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Short greeting/acknowledgment phrases the `Decide` node's classifier
/// treats as not worth retrieving for (spec.md §4.7, §9 "a conforming
/// implementation MUST document its chosen classifier"). Case-insensitive,
/// matched against the trimmed message in full.
const SKIP_PHRASES: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "yes", "no",
    "sure", "got it", "cool", "nice", "great", "bye", "goodbye",
];

/// Conversation mode that binds retrieval to a single session-scoped
/// document (spec.md Glossary "ChatPDF mode").
pub const CHATPDF_MODE: &str = "chatpdf";

#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub user_message: String,
    pub conversation_mode: String,
    pub has_session_pdf: bool,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionDebug {
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub scope_chosen: Option<String>,
    pub query_variants_used: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub context_text: String,
    pub citations: Vec<crate::retriever::Citation>,
    pub grounded: bool,
    pub used_scope: String,
    pub debug: DecisionDebug,
}

impl DecisionOutput {
    fn skipped(reason: &str) -> Self {
        Self {
            context_text: String::new(),
            citations: Vec::new(),
            grounded: false,
            used_scope: "none".to_string(),
            debug: DecisionDebug {
                skipped: true,
                skip_reason: Some(reason.to_string()),
                scope_chosen: None,
                query_variants_used: 0,
            },
        }
    }
}

pub struct DecisionGraph {
    retriever: Arc<Retriever>,
    rewriter: Arc<dyn QueryRewriter>,
}

impl DecisionGraph {
    pub fn new(retriever: Arc<Retriever>, rewriter: Arc<dyn QueryRewriter>) -> Self {
        Self { retriever, rewriter }
    }

    /// Runs the full subgraph. Never mutates persistent storage (spec.md
    /// §4.7). On any classifier skip, returns an empty, ungrounded result
    /// without touching the Retriever.
    pub async fn run(&self, input: DecisionInput, settings: &SettingsSnapshot) -> EngineResult<DecisionOutput> {
        // Node: Decide
        if let Some(reason) = decide_skip(&input, settings) {
            return Ok(DecisionOutput::skipped(&reason));
        }

        // Node: SelectScope
        let scope = select_scope(&input, settings);
        let scope_label = match &scope {
            Scope::Global => "global".to_string(),
            Scope::Workspace { workspace_id } => format!("workspace({workspace_id})"),
            Scope::Session { session_id } => format!("session({session_id})"),
        };

        // Node: RewriteQuery
        let variants = if settings.enable_query_rewrite {
            match self.rewriter.rewrite(&input.user_message).await {
                Ok(v) if !v.is_empty() && v.len() <= 3 => v,
                Ok(_) => Vec::new(),
                Err(e) => {
                    tracing::warn!("query rewrite failed, falling back to original query: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Node: LocalExecute / GlobalExecute
        let result: RetrievalResult = self
            .retriever
            .retrieve(&input.user_message, &variants, scope, settings, input.api_key.as_deref())
            .await?;

        verify_scope_invariant(&scope_label, &result)?;

        Ok(DecisionOutput {
            context_text: result.context_text,
            citations: result.citations,
            grounded: result.grounded,
            used_scope: result.used_scope,
            debug: DecisionDebug {
                skipped: false,
                skip_reason: None,
                scope_chosen: Some(scope_label),
                query_variants_used: variants.len(),
            },
        })
    }

}

/// Node: Decide. Skip when retrieval is disabled, the message is empty, or
/// the lightweight greeting/acknowledgment classifier fires. This is the
/// single heuristic spec.md §4.7 calls for; `settings.enabled` is the
/// documented way to disable it entirely.
fn decide_skip(input: &DecisionInput, settings: &SettingsSnapshot) -> Option<String> {
    if !settings.enabled {
        return Some("retrieval disabled via settings".to_string());
    }
    let trimmed = input.user_message.trim();
    if trimmed.is_empty() {
        return Some("empty message".to_string());
    }
    let normalized = trimmed.trim_end_matches(['.', '!', '?']).to_lowercase();
    if SKIP_PHRASES.contains(&normalized.as_str()) {
        return Some(format!("short greeting/acknowledgment: \"{trimmed}\""));
    }
    None
}

/// Node: SelectScope. ChatPDF mode or an active session document binds
/// retrieval to that session; otherwise the configured global/workspace
/// preference applies (spec.md §4.7).
fn select_scope(input: &DecisionInput, settings: &SettingsSnapshot) -> Scope {
    if input.conversation_mode == CHATPDF_MODE || input.has_session_pdf {
        if let Some(session_id) = &input.session_id {
            return Scope::Session { session_id: session_id.clone() };
        }
    }
    match (&input.workspace_id, settings.scope_preference) {
        (Some(workspace_id), crate::config::ScopePreference::Workspace) => {
            Scope::Workspace { workspace_id: workspace_id.clone() }
        }
        _ => Scope::Global,
    }
}

/// spec.md §4.7 invariant: the scope the Retriever reports executing
/// against (`result.used_scope`) must be the same scope `SelectScope` chose.
/// The SQL predicate in `storage.rs` is what actually keeps chunks from
/// leaking across scopes; this is the subgraph-level re-assertion the spec
/// calls out explicitly. Violation is a fatal error, not a warning.
fn verify_scope_invariant(scope_label: &str, result: &RetrievalResult) -> EngineResult<()> {
    if scope_label != result.used_scope {
        return Err(crate::error::EngineError::ScopeViolation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(message: &str) -> DecisionInput {
        DecisionInput {
            user_message: message.to_string(),
            conversation_mode: "chat".to_string(),
            has_session_pdf: false,
            session_id: None,
            workspace_id: None,
            api_key: None,
        }
    }

    #[test]
    fn empty_message_skips() {
        let settings = SettingsSnapshot::default();
        assert!(decide_skip(&input("   "), &settings).is_some());
    }

    #[test]
    fn greeting_skips() {
        let settings = SettingsSnapshot::default();
        assert!(decide_skip(&input("thanks!"), &settings).is_some());
        assert!(decide_skip(&input("what is the refund policy?"), &settings).is_none());
    }

    #[test]
    fn disabled_settings_always_skip() {
        let mut settings = SettingsSnapshot::default();
        settings.enabled = false;
        assert!(decide_skip(&input("what is the refund policy?"), &settings).is_some());
    }

    #[test]
    fn chatpdf_mode_selects_session_scope() {
        let mut decision_input = input("summarize this");
        decision_input.conversation_mode = CHATPDF_MODE.to_string();
        decision_input.session_id = Some("sess1".to_string());
        let settings = SettingsSnapshot::default();
        let scope = select_scope(&decision_input, &settings);
        assert!(matches!(scope, Scope::Session { session_id } if session_id == "sess1"));
    }

    #[test]
    fn default_mode_without_workspace_preference_selects_global() {
        let settings = SettingsSnapshot::default();
        let scope = select_scope(&input("what is the refund policy?"), &settings);
        assert_eq!(scope, Scope::Global);
    }
}
