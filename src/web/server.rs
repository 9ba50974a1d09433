use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::ws;
use crate::config::MediaSyncConfig;
use crate::sync::SyncService;

/// Finished progress files kept on startup; older ones are deleted.
const PROGRESS_FILES_KEPT: usize = 200;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS so a UI dev server on another port can call the API.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8642,
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &MediaSyncConfig, dev_mode: bool) -> Self {
        Self {
            host: config.toml.server.host.clone(),
            port: config.toml.server.port,
            dev_mode,
        }
    }
}

/// Build the full application router: JSON API plus the event WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "no such endpoint"})),
    )
}

/// Start the server and block until Ctrl-C.
pub async fn start_server(config: Arc<MediaSyncConfig>, server: ServerConfig) -> Result<()> {
    let service = SyncService::from_config(Arc::clone(&config))
        .context("Failed to initialize sync service")?;
    service.recover_interrupted().await?;
    match service.progress_store().prune(PROGRESS_FILES_KEPT) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "pruned old progress files"),
        Err(e) => tracing::warn!(error = %format!("{:#}", e), "failed to prune progress files"),
    }

    let (ws_tx, _rx) = broadcast::channel(256);
    let state = Arc::new(AppState {
        service: Arc::new(service),
        ws_tx,
    });

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, dev_mode = server.dev_mode, "media-sync server listening");
    println!("media-sync API running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::remote::tests::ScriptedShell;
    use crate::sync::service::tests::{service, target};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_router(dir: &tempfile::TempDir) -> Router {
        let service = service(
            dir,
            "exit 0",
            vec![target("comfy", Some("/o"))],
            ScriptedShell::new(vec![]),
            None,
        );
        let (ws_tx, _) = broadcast::channel(16);
        build_router(Arc::new(AppState {
            service: Arc::new(service),
            ws_tx,
        }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempdir().unwrap();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router(&dir).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let dir = tempdir().unwrap();
        let req = Request::builder()
            .uri("/index.html")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(&dir).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let dir = tempdir().unwrap();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = test_router(&dir).oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8642);
        assert!(!config.dev_mode);
    }
}
