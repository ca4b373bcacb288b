use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::auth::TokenPolicy;
use super::db::{DbHandle, FleetDb};
use super::liveness::SystemClock;
use super::remote::HttpStackClient;
use crate::config::DockhandConfig;
use crate::updater::{AutoUpdateScheduler, DbSettingsStore, DockerUpdateChecker, UpdateSettings};

/// Configuration for the dockhand server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub admin_token: Option<String>,
    pub agent_default_port: u16,
    pub agent_request_timeout: std::time::Duration,
    pub update_seed: UpdateSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::from(&DockhandConfig::default())
    }
}

impl From<&DockhandConfig> for ServerConfig {
    fn from(config: &DockhandConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            admin_token: config.auth.admin_token.clone(),
            agent_default_port: config.agents.default_port,
            agent_request_timeout: config.agents.request_timeout(),
            update_seed: UpdateSettings::from(&config.updates),
        }
    }
}

/// Build the full application router: API routes, request tracing, and
/// permissive CORS in dev mode.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the fleet database at `path`.
pub fn open_db(path: &std::path::Path) -> Result<FleetDb> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    FleetDb::new(path).context("Failed to initialize fleet database")
}

/// Start the dockhand server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = DbHandle::new(open_db(&config.db_path)?);

    let settings = Arc::new(DbSettingsStore::new(db.clone()));
    settings
        .seed(&config.update_seed)
        .await
        .context("Failed to seed auto-update settings")?;

    let checker = DockerUpdateChecker::connect()?;
    let scheduler = Arc::new(AutoUpdateScheduler::new(
        Arc::new(checker),
        settings.clone(),
    ));

    if config.admin_token.is_none() {
        warn!("no admin token configured; admin routes will reject every request");
    }
    let remote = HttpStackClient::new(config.agent_default_port, config.agent_request_timeout)?;

    let state = Arc::new(AppState::new(
        db,
        Arc::new(SystemClock),
        Arc::new(TokenPolicy::new(config.admin_token)),
        Arc::new(remote),
        settings,
        scheduler.clone(),
    ));

    if let Err(e) = scheduler.init().await {
        warn!(error = %format!("{:#}", e), "auto-update scheduler not started");
    }

    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.db_path.display(), "dockhand listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.stop().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C, shutting down");
        return;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::remote::RemoteStackClient;
    use crate::fleet::models::Agent;
    use crate::updater::{CheckSummary, PruneMode, UpdateChecker};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoRemote;

    #[async_trait]
    impl RemoteStackClient for NoRemote {
        async fn list_stacks(&self, _agent: &Agent) -> crate::errors::FleetResult<serde_json::Value> {
            Ok(serde_json::json!([]))
        }
    }

    struct NoChecks;

    #[async_trait]
    impl UpdateChecker for NoChecks {
        async fn check_containers(&self) -> Result<CheckSummary> {
            Ok(CheckSummary::default())
        }
        async fn check_stacks(&self) -> Result<CheckSummary> {
            Ok(CheckSummary::default())
        }
        async fn prune_images(&self, _mode: PruneMode) -> Result<()> {
            Ok(())
        }
    }

    fn test_router(dev_mode: bool) -> Router {
        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        let settings = Arc::new(DbSettingsStore::new(db.clone()));
        let scheduler = Arc::new(AutoUpdateScheduler::new(Arc::new(NoChecks), settings.clone()));
        let state = Arc::new(AppState::new(
            db,
            Arc::new(SystemClock),
            Arc::new(TokenPolicy::new(None)),
            Arc::new(NoRemote),
            settings,
            scheduler,
        ));
        build_router(state, dev_mode)
    }

    #[tokio::test]
    async fn test_health_through_full_router() {
        let app = test_router(false);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(false);
        let response = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_without_admin_token_admin_routes_are_forbidden() {
        let app = test_router(false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/settings")
                    .header("authorization", "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let app = test_router(true);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[test]
    fn server_config_from_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.agent_default_port, 7070);
        assert!(!config.update_seed.auto_update);
    }

    #[test]
    fn open_db_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        open_db(&path).unwrap();
        assert!(path.exists());
    }
}
