//! Admin REST surface for skill management.
//!
//! Bypasses MCP session state entirely. Guarded by a static bearer token
//! when `ADMIN_AUTH_TOKEN` is configured, open otherwise.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::catalog::CatalogError;
use crate::server::auth::TokenVerifier;
use crate::skill::{Skill, SkillFiles, SkillManifest, SkillStatus};

use super::state::ServerState;

/// Uploads are capped slightly above the package limit so oversized packages
/// get a proper validation error instead of a connection reset.
const UPLOAD_BODY_LIMIT: usize = 12 * 1024 * 1024;

pub fn admin_routes() -> Router<ServerState> {
    Router::new()
        .route("/skills", get(list_skills))
        .route("/skills/upload", post(upload_skill).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)))
        .route(
            "/skills/validate",
            post(validate_skill).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/skills/reload-all", post(reload_all))
        .route("/skills/{id}", get(get_skill))
        .route("/skills/{id}", delete(delete_skill))
        .route("/skills/{id}/instructions", get(get_instructions))
        .route("/skills/{id}/logs", get(get_logs))
        .route("/skills/{id}/versions", get(get_versions))
        .route("/skills/{id}/reload", post(reload_skill))
        .route("/skills/{id}/rollback", post(rollback_skill))
}

// ============================================================================
// Auth guard
// ============================================================================

pub struct AdminAuth;

impl FromRequestParts<ServerState> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        if !state.admin_verifier.requires_token() {
            return Ok(AdminAuth);
        }

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if state.admin_verifier.verify(token).is_ok() => Ok(AdminAuth),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing or invalid bearer token"})),
            )
                .into_response()),
        }
    }
}

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Serialize)]
struct SkillView {
    id: String,
    version: u32,
    manifest: SkillManifest,
    status: SkillStatus,
    load_error: Option<String>,
    files: SkillFiles,
    invocation_count: u64,
    last_invoked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn skill_view(skill: &Skill) -> SkillView {
    SkillView {
        id: skill.id.clone(),
        version: skill.version,
        manifest: skill.manifest.clone(),
        status: skill.status,
        load_error: skill.load_error.clone(),
        files: skill.files.clone(),
        invocation_count: skill.invocation_count(),
        last_invoked_at: skill.last_invoked_at(),
        created_at: skill.created_at,
        updated_at: skill.updated_at,
    }
}

fn catalog_error(e: CatalogError) -> Response {
    let status = match &e {
        CatalogError::Rejected(_) | CatalogError::Archive(_) => StatusCode::BAD_REQUEST,
        CatalogError::UnknownSkill(_) | CatalogError::UnknownVersion(_, _) => {
            StatusCode::NOT_FOUND
        }
        CatalogError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

fn not_found(skill_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("skill not found: {skill_id}")})),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_skills(_auth: AdminAuth, State(state): State<ServerState>) -> Response {
    let skills: Vec<SkillView> = state.catalog.list().iter().map(|s| skill_view(s)).collect();
    let total = skills.len();
    Json(json!({"skills": skills, "total": total})).into_response()
}

async fn get_skill(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
) -> Response {
    match state.catalog.get(&skill_id) {
        Some(skill) => Json(json!({"skill": skill_view(&skill)})).into_response(),
        None => not_found(&skill_id),
    }
}

async fn get_instructions(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
) -> Response {
    match state.catalog.get(&skill_id) {
        Some(skill) => Json(json!({
            "name": skill.manifest.name,
            "description": skill.manifest.description,
            "instructions": skill.instructions,
        }))
        .into_response(),
        None => not_found(&skill_id),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    50
}

async fn get_logs(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let store = Arc::clone(&state.invocation_store);
    let result =
        tokio::task::spawn_blocking(move || store.query(&skill_id, None, query.limit.min(1000)))
            .await
            .expect("log query task panicked");
    match result {
        Ok(logs) => {
            let count = logs.len();
            Json(json!({"logs": logs, "count": count})).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_versions(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
) -> Response {
    match state.catalog.metadata().get(&skill_id) {
        Ok(Some(meta)) => Json(json!({"versions": meta.all_versions})).into_response(),
        Ok(None) => not_found(&skill_id),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn reload_skill(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
) -> Response {
    match state.catalog.reload(&skill_id).await {
        Ok(_) => {
            state.engine.notify_tools_changed();
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

#[derive(Deserialize)]
struct RollbackBody {
    version: u32,
}

async fn rollback_skill(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Response {
    match state.catalog.rollback(&skill_id, body.version).await {
        Ok(()) => {
            state.engine.notify_tools_changed();
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

async fn delete_skill(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    Path(skill_id): Path<String>,
) -> Response {
    match state.catalog.unload(&skill_id).await {
        Ok(()) => {
            state.engine.notify_tools_changed();
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

async fn upload_skill(
    _auth: AdminAuth,
    State(state): State<ServerState>,
    multipart: Multipart,
) -> Response {
    let bytes = match read_zip_field(multipart).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    match state.catalog.publish(bytes).await {
        Ok(receipt) => {
            info!("admin upload published {} v{}", receipt.id, receipt.version);
            state.engine.notify_tools_changed();
            Json(json!({"id": receipt.id, "version": receipt.version})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

async fn validate_skill(
    _auth: AdminAuth,
    State(_state): State<ServerState>,
    multipart: Multipart,
) -> Response {
    let bytes = match read_zip_field(multipart).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    match crate::catalog::validate_archive(bytes).await {
        Ok(errors) => {
            let valid = errors.is_empty();
            Json(json!({"valid": valid, "errors": errors})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

async fn reload_all(_auth: AdminAuth, State(state): State<ServerState>) -> Response {
    match state.catalog.reload_all().await {
        Ok(reloaded) => {
            state.engine.notify_tools_changed();
            Json(json!({"reloaded": reloaded})).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

/// Pull the uploaded zip out of the multipart body. Accepts the first field
/// named `file` or carrying a filename.
async fn read_zip_field(mut multipart: Multipart) -> Result<Vec<u8>, Response> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let named_file = field.name() == Some("file") || field.file_name().is_some();
        if !named_file {
            continue;
        }
        if let Some(filename) = field.file_name() {
            if !filename.ends_with(".zip") {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "must upload a .zip file"})),
                )
                    .into_response());
            }
        }
        return match field.bytes().await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("failed to read upload: {e}")})),
            )
                .into_response()),
        };
    }
    Err((
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "missing file field"})),
    )
        .into_response())
}
