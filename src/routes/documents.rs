//! `POST /documents` — the `index_document` operation of spec.md §6. The
//! host already has `markdown_text` in hand (converted PDF, pasted text, a
//! chat-attached artifact); this route never reads from disk itself — see
//! `routes/watch.rs` for the filesystem-driven path.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::error::EngineResult;
use crate::indexer::{IndexInput, IndexOutcome};

#[derive(Debug, Deserialize)]
pub struct IndexDocumentRequest {
    pub workspace_id: String,
    pub source_type: String,
    pub source_name: String,
    pub source_path: Option<String>,
    pub markdown_text: String,
    pub session_id: Option<String>,
    pub artifact_entry_id: Option<String>,
    #[serde(default)]
    pub file_size: i64,
}

pub async fn index_document(
    State(state): State<Arc<Coordinator>>,
    Json(req): Json<IndexDocumentRequest>,
) -> EngineResult<Json<IndexOutcome>> {
    let settings = state.current_settings();
    let input = IndexInput {
        workspace_id: req.workspace_id,
        source_type: req.source_type,
        source_name: req.source_name,
        source_path: req.source_path,
        markdown_text: req.markdown_text,
        session_id: req.session_id,
        artifact_entry_id: req.artifact_entry_id,
        file_size: req.file_size,
    };
    let outcome = state.index_document(input, &settings).await?;
    Ok(Json(outcome))
}
