use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use rag_engine::{config, coordinator, routes, server};

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("RAG_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("rag-engine").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".rag-engine-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "rag-engine.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rag_engine=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "rag_engine::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        max_file_size_bytes = config.max_file_size_bytes,
        watcher_debounce_ms = config.watcher_debounce_ms,
        indexing_concurrency = config.indexing_concurrency,
        log_dir = %log_dir,
        "RAG engine starting"
    );

    let coordinator = Arc::new(coordinator::Coordinator::new(config).await?);
    coordinator.spawn_background_tasks();

    routes::health::init_shutdown_notify();

    let app = server::create_app(coordinator.clone());

    // Bind the TCP listener and start serving BEFORE restoring workspace
    // watchers, so /health is reachable immediately rather than waiting on
    // potentially slow watcher setup I/O.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("RAG engine listening on {}", addr);

    let watcher_coordinator = coordinator.clone();
    tokio::spawn(async move {
        let workspaces = watcher_coordinator.list_workspaces();
        let total = workspaces.len();
        watcher_coordinator.restore_watchers();
        if total > 0 {
            info!("restored {} workspace watcher(s) in background", total);
        }
    });

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("RAG engine shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await.expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("received HTTP shutdown request, initiating shutdown"); },
    }

    info!("shutdown signal received");
}
