//! `POST /watch/{workspace_id}/enqueue` and `POST /watch/{workspace_id}/rescan`
//! — the `enqueue_file` and `rescan` operations of spec.md §6.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::Coordinator;
use crate::error::EngineResult;

#[derive(Debug, Deserialize)]
pub struct EnqueueFileRequest {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueFileResponse {
    pub enqueued_path: String,
}

pub async fn enqueue_file(
    State(state): State<Arc<Coordinator>>,
    Path(workspace_id): Path<String>,
    Json(req): Json<EnqueueFileRequest>,
) -> EngineResult<Json<EnqueueFileResponse>> {
    let enqueued_path = state.enqueue_file(&workspace_id, &PathBuf::from(req.path)).await?;
    Ok(Json(EnqueueFileResponse { enqueued_path }))
}

#[derive(Debug, Deserialize)]
pub struct RescanRequest {
    pub root: String,
}

#[derive(Debug, Serialize)]
pub struct RescanResponse {
    pub enqueued_count: usize,
}

pub async fn rescan(
    State(state): State<Arc<Coordinator>>,
    Path(workspace_id): Path<String>,
    Json(req): Json<RescanRequest>,
) -> EngineResult<Json<RescanResponse>> {
    let enqueued_count = state.rescan(&workspace_id, &PathBuf::from(req.root)).await?;
    Ok(Json(RescanResponse { enqueued_count }))
}
