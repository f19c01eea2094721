use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::coordinator::Coordinator;
use crate::routes;

pub fn create_app(state: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only).
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // Protected routes — require RAG_AUTH_TOKEN when configured.
    let protected_routes = Router::new()
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/workspaces", get(routes::workspace::list_workspaces))
        .route("/workspaces", post(routes::workspace::create_workspace))
        .route("/workspaces/{workspace_id}", get(routes::workspace::get_workspace))
        .route("/workspaces/{workspace_id}", delete(routes::workspace::remove_workspace))
        .route("/workspaces/{workspace_id}/activate", post(routes::workspace::activate_workspace))
        .route("/documents", post(routes::documents::index_document))
        .route("/retrieve", post(routes::retrieve::retrieve))
        .route("/retrieve/decide", post(routes::retrieve::decide))
        .route("/watch/{workspace_id}/enqueue", post(routes::watch::enqueue_file))
        .route("/watch/{workspace_id}/rescan", post(routes::watch::rescan))
        .route("/registry", get(routes::cleanup::list_registry))
        .route("/cleanup", post(routes::cleanup::cleanup_stale))
        .route("/ws", get(ws_handler))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `RAG_AUTH_TOKEN` environment variable. If the env var is not set or
/// empty, auth is skipped (development mode).
async fn auth_middleware(req: Request, next: Next) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| std::env::var("RAG_AUTH_TOKEN").ok().filter(|t| !t.is_empty()));

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await),
    };

    let auth_header = req.headers().get("authorization").and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("auth token mismatch — rejecting request");
                Err((StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401}))))
            }
        }
        _ => {
            tracing::warn!("missing or malformed Authorization header — rejecting request");
            Err((StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401}))))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<Coordinator>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bidirectional WebSocket handler.
/// Server → Client: broadcasts `ServerEvent`s as JSON.
/// Client → Server: accepts a small command set for on-demand operations.
async fn handle_socket(socket: WebSocket, state: Arc<Coordinator>) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("WebSocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let command_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                let text_str: &str = &text;
                if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(text_str) {
                    let cmd_type = cmd.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    tracing::debug!(command = cmd_type, "WebSocket command received");
                    match cmd_type {
                        "enqueue_file" => {
                            let ws_id = cmd.get("workspace_id").and_then(|v| v.as_str()).unwrap_or("");
                            let path = cmd.get("path").and_then(|v| v.as_str()).unwrap_or("");
                            if !ws_id.is_empty() && !path.is_empty() {
                                if let Err(e) = command_state.enqueue_file(ws_id, std::path::Path::new(path)).await {
                                    tracing::warn!("WebSocket enqueue_file failed: {e}");
                                }
                            }
                        }
                        "rescan" => {
                            let ws_id = cmd.get("workspace_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            if let Ok(workspace) = command_state.get_workspace(&ws_id) {
                                if let Err(e) = command_state.rescan(&ws_id, std::path::Path::new(&workspace.path)).await {
                                    tracing::warn!("WebSocket rescan failed: {e}");
                                }
                            }
                        }
                        _ => {
                            tracing::debug!("unknown WS command: {}", cmd_type);
                        }
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); },
        _ = &mut recv_task => { send_task.abort(); },
    }
    tracing::info!("WebSocket client disconnected");
}
