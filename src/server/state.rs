use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRef;

use super::auth::StaticTokenVerifier;
use crate::catalog::SkillCatalog;
use crate::config::AppConfig;
use crate::mcp::{McpEngine, SessionRegistry};
use crate::storage::{InvocationLog, InvocationStore};

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub start_time: Instant,
    pub catalog: Arc<SkillCatalog>,
    pub sessions: Arc<SessionRegistry>,
    pub engine: Arc<McpEngine>,
    pub invocation_log: Arc<InvocationLog>,
    pub invocation_store: Arc<dyn InvocationStore>,
    pub admin_verifier: Arc<StaticTokenVerifier>,
}

impl FromRef<ServerState> for Arc<SkillCatalog> {
    fn from_ref(input: &ServerState) -> Self {
        input.catalog.clone()
    }
}

impl FromRef<ServerState> for Arc<McpEngine> {
    fn from_ref(input: &ServerState) -> Self {
        input.engine.clone()
    }
}

impl FromRef<ServerState> for Arc<SessionRegistry> {
    fn from_ref(input: &ServerState) -> Self {
        input.sessions.clone()
    }
}
