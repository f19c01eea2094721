//! `POST /retrieve` — the `retrieve` operation of spec.md §6, run straight
//! through the Retriever. For the chat-facing decision subgraph (classifier
//! skip, scope selection, query rewrite) see `decide` below, which wraps the
//! same Retriever behind `DecisionGraph::run`.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::decision::{DecisionInput, DecisionOutput};
use crate::error::{EngineError, EngineResult};
use crate::retriever::RetrievalResult;
use crate::storage::Scope;

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub query_variants: Vec<String>,
    pub scope: Scope,
    pub api_key: Option<String>,
}

pub async fn retrieve(
    State(state): State<Arc<Coordinator>>,
    Json(req): Json<RetrieveRequest>,
) -> EngineResult<Json<RetrievalResult>> {
    let settings = state.current_settings();
    settings.validate_chunking().map_err(EngineError::BadRequest)?;
    let result = state
        .retrieve(&req.query, &req.query_variants, req.scope, &settings, req.api_key.as_deref())
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub user_message: String,
    #[serde(default)]
    pub conversation_mode: String,
    #[serde(default)]
    pub has_session_pdf: bool,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub api_key: Option<String>,
}

pub async fn decide(
    State(state): State<Arc<Coordinator>>,
    Json(req): Json<DecideRequest>,
) -> EngineResult<Json<DecisionOutput>> {
    let settings = state.current_settings();
    let input = DecisionInput {
        user_message: req.user_message,
        conversation_mode: req.conversation_mode,
        has_session_pdf: req.has_session_pdf,
        session_id: req.session_id,
        workspace_id: req.workspace_id,
        api_key: req.api_key,
    };
    let output = state.decide_and_retrieve(input, &settings).await?;
    Ok(Json(output))
}
