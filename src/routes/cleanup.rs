//! `GET /registry` and `POST /cleanup` — the `list_registry` and
//! `cleanup_stale` operations of spec.md §6.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::cleanup::CleanupReport;
use crate::coordinator::Coordinator;
use crate::error::EngineResult;
use crate::storage::RegistryEntry;

#[derive(Debug, Deserialize)]
pub struct RegistryQuery {
    pub status: Option<String>,
}

pub async fn list_registry(
    State(state): State<Arc<Coordinator>>,
    Query(query): Query<RegistryQuery>,
) -> EngineResult<Json<Vec<RegistryEntry>>> {
    let entries = state.list_registry(query.status.as_deref())?;
    Ok(Json(entries))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub retention_days: Option<i64>,
}

pub async fn cleanup_stale(
    State(state): State<Arc<Coordinator>>,
    Json(req): Json<CleanupRequest>,
) -> EngineResult<Json<CleanupReport>> {
    let report = state.cleanup_stale(req.retention_days)?;
    Ok(Json(report))
}
