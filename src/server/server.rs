//! Router assembly, bootstrap and the serve loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::routing::post;
use axum::{middleware, Router};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::{spawn_refresh_task, CatalogError, SkillCatalog};
use crate::config::AppConfig;
use crate::mcp::{McpEngine, SessionRegistry};
use crate::storage::{
    FsObjectStore, InvocationLog, InvocationStore, MetadataStore, ObjectStore,
    SqliteInvocationStore, SqliteMetadataStore, DEFAULT_QUEUE_CAPACITY,
};

use super::admin::admin_routes;
use super::auth::StaticTokenVerifier;
use super::health::health_routes;
use super::requests_logging::log_requests;
use super::state::ServerState;
use super::transport::{delete_mcp, get_mcp, post_mcp};

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BootError {
    #[error("storage unreachable: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Build every store and service, boot the catalog, and spawn the background
/// tasks (invocation log drain, session cleanup, catalog refresh). All tasks
/// stop when `cancel` fires.
pub async fn bootstrap(config: AppConfig, cancel: CancellationToken) -> Result<ServerState, BootError> {
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| BootError::Storage(format!("data dir: {e}")))?;
    std::fs::create_dir_all(&config.skill_cache_dir)
        .map_err(|e| BootError::Storage(format!("skill cache dir: {e}")))?;

    let objects: Arc<dyn ObjectStore> = Arc::new(
        FsObjectStore::new(&config.object_store_bucket, config.object_store_prefix.clone())
            .map_err(|e| BootError::Storage(format!("object store: {e}")))?,
    );

    let db_path = config.database_path();
    let metadata: Arc<dyn MetadataStore> = Arc::new(
        SqliteMetadataStore::new(&db_path, &config.metadata_table)
            .map_err(|e| BootError::Storage(format!("metadata store: {e}")))?,
    );
    metadata
        .ping()
        .map_err(|e| BootError::Storage(format!("metadata store: {e}")))?;

    let invocation_store: Arc<dyn InvocationStore> = Arc::new(
        SqliteInvocationStore::new(&db_path, &config.invocation_log_table)
            .map_err(|e| BootError::Storage(format!("invocation log store: {e}")))?,
    );

    let catalog = Arc::new(SkillCatalog::new(
        objects,
        metadata,
        config.skill_cache_dir.clone(),
    ));
    match catalog.boot().await {
        Ok(count) => info!("loaded {} skills", count),
        Err(CatalogError::Storage(e)) => {
            return Err(BootError::Storage(e.to_string()));
        }
        Err(e) => return Err(BootError::Other(e.into())),
    }

    let sessions = SessionRegistry::new(config.session_idle, config.session_expiry);
    sessions.spawn_cleanup(SESSION_CLEANUP_INTERVAL, cancel.clone());

    let invocation_log = InvocationLog::new(DEFAULT_QUEUE_CAPACITY);
    invocation_log.spawn_drain(Arc::clone(&invocation_store), cancel.clone());

    spawn_refresh_task(Arc::clone(&catalog), config.catalog_refresh, cancel.clone());

    let engine = Arc::new(McpEngine::new(
        Arc::clone(&catalog),
        Arc::clone(&sessions),
        Arc::clone(&invocation_log),
        config.server_name().to_string(),
        config.server_version(),
        config.tool_call_timeout,
        config.invocation_log_ttl_days,
    ));

    let admin_verifier = Arc::new(StaticTokenVerifier::new(config.admin_auth_token.clone()));

    Ok(ServerState {
        config: Arc::new(config),
        start_time: Instant::now(),
        catalog,
        sessions,
        engine,
        invocation_log,
        invocation_store,
        admin_verifier,
    })
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/mcp", post(post_mcp).get(get_mcp).delete(delete_mcp))
        .merge(health_routes())
        .nest("/admin", admin_routes())
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

pub async fn run_server(state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let app = make_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
