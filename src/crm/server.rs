use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, NurtureDb};
use super::ghl::GhlClient;
use crate::config::NurtureConfig;

/// Build the full application router.
pub fn build_router(state: SharedState, cors: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the database at `path`.
pub fn open_database(path: &Path) -> Result<NurtureDb> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    NurtureDb::new(path).context("Failed to initialize NurtureFlow database")
}

/// Wire the database and GoHighLevel client into shared state.
pub fn build_state(config: &NurtureConfig) -> Result<SharedState> {
    let db = open_database(&config.server.db_path)?;
    let ghl = GhlClient::from_config(&config.ghl)?;
    Ok(Arc::new(AppState::new(DbHandle::new(db), config, ghl)))
}

/// Start the HTTP server and run until Ctrl+C.
pub async fn start_server(config: NurtureConfig) -> Result<()> {
    let state = build_state(&config)?;
    if !state.client_id_configured {
        warn!("GHL_CLIENT_ID is not set; OAuth authorization will fail");
    }
    if !state.webhook_secret_configured {
        warn!("GHL_WEBHOOK_SECRET is not set; webhook signatures are not checked");
    }

    let app = build_router(state, config.server.cors_enabled());
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        db = %config.server.db_path.display(),
        dev_mode = config.server.dev_mode,
        "NurtureFlow listening"
    );
    println!("NurtureFlow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router(cors: bool) -> Router {
        let config = NurtureConfig::default();
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let ghl = GhlClient::with_http(&config.ghl, reqwest::Client::new());
        build_router(Arc::new(AppState::new(db, &config, ghl)), cors)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/api/leads")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"[]");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_only_when_enabled() {
        let preflight = || {
            Request::builder()
                .method("OPTIONS")
                .uri("/api/leads")
                .header(header::ORIGIN, "http://localhost:5173")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap()
        };
        let flagged = NurtureConfig::from_toml("[server]\ncors = true\n").unwrap();
        let dev = test_router(flagged.server.cors_enabled())
            .oneshot(preflight())
            .await
            .unwrap();
        assert!(dev.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let prod = test_router(false).oneshot(preflight()).await.unwrap();
        assert!(!prod.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_open_database_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.db");
        let db = open_database(&path).unwrap();
        assert!(path.exists());
        assert!(db.table_names().unwrap().contains(&"leads".to_string()));
    }
}
