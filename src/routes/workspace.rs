use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::error::EngineResult;
use crate::workspace::Workspace;

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    /// Accepts both "path" and "root_path" from the client.
    #[serde(alias = "root_path")]
    pub path: String,
}

pub async fn list_workspaces(State(state): State<Arc<Coordinator>>) -> Json<Vec<Workspace>> {
    Json(state.list_workspaces())
}

pub async fn create_workspace(
    State(state): State<Arc<Coordinator>>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> EngineResult<Json<Workspace>> {
    let workspace = state.create_workspace(req.name, req.path)?;
    Ok(Json(workspace))
}

pub async fn get_workspace(
    State(state): State<Arc<Coordinator>>,
    Path(workspace_id): Path<String>,
) -> EngineResult<Json<Workspace>> {
    Ok(Json(state.get_workspace(&workspace_id)?))
}

pub async fn remove_workspace(
    State(state): State<Arc<Coordinator>>,
    Path(workspace_id): Path<String>,
) -> EngineResult<Json<serde_json::Value>> {
    state.remove_workspace(&workspace_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn activate_workspace(
    State(state): State<Arc<Coordinator>>,
    Path(workspace_id): Path<String>,
) -> EngineResult<Json<Workspace>> {
    Ok(Json(state.activate_workspace(&workspace_id)?))
}
