//! MCP method dispatch.
//!
//! Routes JSON-RPC messages to the catalog-backed tool/prompt/resource
//! surfaces. Tool calls are deterministic and side-effect free in the core:
//! the "execution" of a skill is rendering its instructions for the calling
//! agent. Every call is timed, logged to the invocation log and counted.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::SkillCatalog;
use crate::skill::Skill;
use crate::storage::{
    increment_invocation_with_retry, InvocationEvent, InvocationLog, InvocationStatus,
};

use super::protocol::{
    methods, negotiate_protocol_version, Completion, CompletionParams, CompletionResult,
    ContentBlock, InitializeParams, InitializeResult, McpError, McpRequest, McpResponse,
    PaginatedParams, PromptArgument, PromptDescriptor, PromptMessage, PromptsGetParams,
    PromptsGetResult, PromptsListResult, ResourceContent, ResourceDescriptor,
    ResourcesListResult, ResourcesReadParams, ResourcesReadResult, ServerCapabilities,
    ServerInfo, ToolDescriptor, ToolsCallParams, ToolsCallResult, ToolsListResult,
    LIST_PAGE_SIZE,
};
use super::session::{SessionHandle, SessionRegistry, SessionState};

pub struct McpEngine {
    catalog: Arc<SkillCatalog>,
    sessions: Arc<SessionRegistry>,
    invocation_log: Arc<InvocationLog>,
    server_name: String,
    server_version: String,
    tool_call_timeout: Duration,
    log_retention_days: i64,
}

impl McpEngine {
    pub fn new(
        catalog: Arc<SkillCatalog>,
        sessions: Arc<SessionRegistry>,
        invocation_log: Arc<InvocationLog>,
        server_name: String,
        server_version: String,
        tool_call_timeout: Duration,
        log_retention_days: i64,
    ) -> Self {
        Self {
            catalog,
            sessions,
            invocation_log,
            server_name,
            server_version,
            tool_call_timeout,
            log_retention_days,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handle one JSON-RPC message. Returns `None` for notifications.
    pub async fn handle_message(
        &self,
        raw: Value,
        slot: &SessionHandle,
        cancel: &CancellationToken,
    ) -> Option<McpResponse> {
        let request: McpRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                return Some(McpResponse::error(
                    None,
                    McpError::InvalidRequest(e.to_string()),
                ));
            }
        };
        if request.jsonrpc != super::protocol::JSONRPC_VERSION {
            return Some(McpResponse::error(
                request.id,
                McpError::InvalidRequest("must be JSON-RPC 2.0".to_string()),
            ));
        }

        let is_notification = request.is_notification();
        let params = request.params.unwrap_or(Value::Null);

        if is_notification {
            match request.method.as_str() {
                methods::INITIALIZED | methods::NOTIFICATIONS_INITIALIZED => {
                    let id = slot.state.lock().unwrap().id.clone();
                    self.sessions.activate(&id);
                    debug!("session {} active", id);
                }
                other => debug!("ignoring notification {}", other),
            }
            return None;
        }

        let id = request.id.clone().expect("non-notification has an id");
        let result = match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(params, slot),
            methods::PING => Ok(json!({})),
            methods::LOGGING_SET_LEVEL => self.require_active(slot).map(|_| json!({})),
            methods::TOOLS_LIST => self
                .require_active(slot)
                .and_then(|_| self.handle_tools_list(params)),
            methods::TOOLS_CALL => match self.require_active(slot) {
                Ok(()) => self.handle_tools_call(params, slot, cancel).await,
                Err(e) => Err(e),
            },
            methods::PROMPTS_LIST => self
                .require_active(slot)
                .and_then(|_| self.handle_prompts_list()),
            methods::PROMPTS_GET => self
                .require_active(slot)
                .and_then(|_| self.handle_prompts_get(params)),
            methods::RESOURCES_LIST => self
                .require_active(slot)
                .and_then(|_| self.handle_resources_list()),
            methods::RESOURCES_READ => self
                .require_active(slot)
                .and_then(|_| self.handle_resources_read(params)),
            methods::COMPLETION_COMPLETE => self
                .require_active(slot)
                .and_then(|_| self.handle_completion(params)),
            other => Err(McpError::MethodNotFound(other.to_string())),
        };

        Some(match result {
            Ok(value) => McpResponse::success(id, value),
            Err(error) => McpResponse::error(Some(id), error),
        })
    }

    /// Broadcast `notifications/tools/list_changed` to every live session.
    pub fn notify_tools_changed(&self) {
        self.sessions.broadcast(json!({
            "jsonrpc": super::protocol::JSONRPC_VERSION,
            "method": methods::NOTIFY_TOOLS_LIST_CHANGED,
        }));
    }

    fn require_active(&self, slot: &SessionHandle) -> Result<(), McpError> {
        let state = slot.state.lock().unwrap().state;
        match state {
            SessionState::Active => Ok(()),
            SessionState::Initializing => Err(McpError::InvalidRequest(
                "session not initialized; send the initialized notification first".to_string(),
            )),
            _ => Err(McpError::SessionNotFound),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn handle_initialize(
        &self,
        params: Value,
        slot: &SessionHandle,
    ) -> Result<Value, McpError> {
        let params: InitializeParams = match params {
            Value::Null => InitializeParams::default(),
            other => serde_json::from_value(other)
                .map_err(|e| McpError::InvalidParams(e.to_string()))?,
        };

        let requested = params
            .protocol_version
            .unwrap_or_else(|| super::protocol::SUPPORTED_PROTOCOL_VERSIONS[0].to_string());
        let negotiated = negotiate_protocol_version(&requested)
            .ok_or(McpError::ProtocolMismatch {
                requested: requested.clone(),
            })?;

        let capabilities = ServerCapabilities::current();
        {
            let mut session = slot.state.lock().unwrap();
            session.protocol_version = Some(negotiated.to_string());
            session.client_info = params.client_info.clone();
            session.client_capabilities = params.capabilities;
            session.server_capabilities = serde_json::to_value(&capabilities)
                .map_err(|e| McpError::Internal(e.to_string()))?;
        }

        info!(
            "initialize: client {} negotiated protocol {}",
            params
                .client_info
                .as_ref()
                .and_then(|c| c.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown"),
            negotiated
        );

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities,
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: self.server_version.clone(),
            },
        };
        serde_json::to_value(result).map_err(|e| McpError::Internal(e.to_string()))
    }

    // =========================================================================
    // Tools
    // =========================================================================

    fn handle_tools_list(&self, params: Value) -> Result<Value, McpError> {
        let params: PaginatedParams = match params {
            Value::Null => PaginatedParams::default(),
            other => serde_json::from_value(other)
                .map_err(|e| McpError::InvalidParams(e.to_string()))?,
        };
        let start = parse_cursor(params.cursor.as_deref())?;

        let skills: Vec<_> = self
            .catalog
            .list_active()
            .into_iter()
            .filter(|s| s.manifest.user_invocable)
            .collect();

        let page: Vec<ToolDescriptor> = skills
            .iter()
            .skip(start)
            .take(LIST_PAGE_SIZE)
            .map(|s| skill_to_tool(s))
            .collect();
        let next_cursor = if start + LIST_PAGE_SIZE < skills.len() {
            Some((start + LIST_PAGE_SIZE).to_string())
        } else {
            None
        };

        serde_json::to_value(ToolsListResult {
            tools: page,
            next_cursor,
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }

    async fn handle_tools_call(
        &self,
        params: Value,
        slot: &SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let params: ToolsCallParams =
            serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))?;
        let arguments = params.arguments.unwrap_or(json!({}));
        let session_id = slot.state.lock().unwrap().id.clone();

        let started = Instant::now();
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                self.tool_call_timeout,
                self.dispatch_tool_call(&params.name, &arguments),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(McpError::Timeout(self.tool_call_timeout.as_secs())),
            },
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        // Cancelled calls have no recipient and are not skill failures;
        // nothing is logged or counted for them.
        if matches!(outcome, Err(McpError::Cancelled)) {
            debug!("tools/call {} cancelled by disconnect", params.name);
            return Err(McpError::Cancelled);
        }

        let (status, error_message, dispatched) = match &outcome {
            Ok(_) => (InvocationStatus::Success, None, true),
            Err(e @ (McpError::ToolNotFound(_) | McpError::PermissionDenied(_))) => {
                (InvocationStatus::Error, Some(e.message()), false)
            }
            Err(e) => (InvocationStatus::Error, Some(e.message()), true),
        };

        self.invocation_log.append(InvocationEvent::new(
            params.name.clone(),
            session_id,
            methods::TOOLS_CALL,
            duration_ms,
            status,
            error_message,
            serde_json::to_string(&arguments).ok(),
            self.log_retention_days,
        ));

        // The call itself never blocks on accounting: the counter write is
        // fire-and-forget with bounded retries.
        if dispatched {
            self.catalog.record_invocation(&params.name);
            let store = Arc::clone(self.catalog.metadata());
            tokio::spawn(increment_invocation_with_retry(store, params.name.clone()));
        }

        outcome
    }

    async fn dispatch_tool_call(
        &self,
        name: &str,
        arguments: &Value,
    ) -> Result<Value, McpError> {
        let skill = self
            .catalog
            .get(name)
            .filter(|s| s.is_active())
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        if !skill.manifest.user_invocable {
            return Err(McpError::PermissionDenied(format!(
                "skill {} is not user invocable",
                name
            )));
        }

        let content = render_instructions(&skill, arguments);
        serde_json::to_value(ToolsCallResult::text(content))
            .map_err(|e| McpError::Internal(e.to_string()))
    }

    // =========================================================================
    // Prompts
    // =========================================================================

    fn handle_prompts_list(&self) -> Result<Value, McpError> {
        let prompts: Vec<PromptDescriptor> = self
            .catalog
            .list_active()
            .iter()
            .filter(|s| s.manifest.user_invocable)
            .map(|s| PromptDescriptor {
                name: s.id.clone(),
                description: s.manifest.description.clone(),
                arguments: vec![PromptArgument {
                    name: "arguments".to_string(),
                    description: "Arguments substituted into $ARGUMENTS".to_string(),
                    required: false,
                }],
            })
            .collect();

        serde_json::to_value(PromptsListResult {
            prompts,
            next_cursor: None,
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }

    fn handle_prompts_get(&self, params: Value) -> Result<Value, McpError> {
        let params: PromptsGetParams =
            serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))?;
        let skill = self
            .catalog
            .get(&params.name)
            .filter(|s| s.is_active())
            .ok_or_else(|| McpError::InvalidParams(format!("prompt not found: {}", params.name)))?;

        let content = render_instructions(&skill, &params.arguments.unwrap_or(json!({})));
        serde_json::to_value(PromptsGetResult {
            description: skill.manifest.description.clone(),
            messages: vec![PromptMessage {
                role: "user",
                content: ContentBlock::Text { text: content },
            }],
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }

    // =========================================================================
    // Resources
    // =========================================================================

    fn handle_resources_list(&self) -> Result<Value, McpError> {
        let mut resources = Vec::new();
        for skill in self.catalog.list_active() {
            for file in skill
                .files
                .references
                .iter()
                .chain(skill.files.assets.iter())
            {
                resources.push(ResourceDescriptor {
                    uri: format!("skill://{}/{}", skill.id, file.path),
                    name: file
                        .path
                        .rsplit('/')
                        .next()
                        .unwrap_or(&file.path)
                        .to_string(),
                    description: Some(format!("File shipped with skill {}", skill.id)),
                    mime_type: Some(mime_type_for(&file.path).to_string()),
                });
            }
        }
        serde_json::to_value(ResourcesListResult {
            resources,
            next_cursor: None,
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }

    fn handle_resources_read(&self, params: Value) -> Result<Value, McpError> {
        let params: ResourcesReadParams =
            serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))?;
        let rest = params
            .uri
            .strip_prefix("skill://")
            .ok_or_else(|| McpError::InvalidParams(format!("invalid URI scheme: {}", params.uri)))?;
        let (skill_id, file_path) = rest
            .split_once('/')
            .ok_or_else(|| McpError::InvalidParams(format!("invalid URI: {}", params.uri)))?;

        let skill = self
            .catalog
            .get(skill_id)
            .filter(|s| s.is_active())
            .ok_or_else(|| McpError::InvalidParams(format!("skill not found: {}", skill_id)))?;

        let known = skill
            .files
            .references
            .iter()
            .chain(skill.files.assets.iter())
            .any(|f| f.path == file_path);
        if !known {
            return Err(McpError::InvalidParams(format!(
                "file not found: {}",
                file_path
            )));
        }

        let source = skill.source_path.as_deref().ok_or_else(|| {
            McpError::Internal(format!("skill {} has no local cache", skill_id))
        })?;
        let bytes = std::fs::read(source.join(file_path)).map_err(|e| {
            warn!("resource read failed for {}: {}", params.uri, e);
            McpError::Internal(format!("error reading resource: {}", e))
        })?;

        let mime = mime_type_for(file_path);
        let content = if is_text_mime(mime) {
            match String::from_utf8(bytes) {
                Ok(text) => ResourceContent::Text {
                    uri: params.uri.clone(),
                    mime_type: mime.to_string(),
                    text,
                },
                Err(e) => ResourceContent::Blob {
                    uri: params.uri.clone(),
                    mime_type: "application/octet-stream".to_string(),
                    blob: BASE64.encode(e.into_bytes()),
                },
            }
        } else {
            ResourceContent::Blob {
                uri: params.uri.clone(),
                mime_type: mime.to_string(),
                blob: BASE64.encode(bytes),
            }
        };

        serde_json::to_value(ResourcesReadResult {
            contents: vec![content],
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Best-effort completion: prefix-match skill ids for name-like
    /// arguments, empty otherwise.
    fn handle_completion(&self, params: Value) -> Result<Value, McpError> {
        let params: CompletionParams = match params {
            Value::Null => CompletionParams::default(),
            other => serde_json::from_value(other)
                .map_err(|e| McpError::InvalidParams(e.to_string()))?,
        };

        let values = match params.argument {
            Some(arg) if arg.name == "name" => self
                .catalog
                .list_active()
                .iter()
                .filter(|s| s.manifest.user_invocable && s.id.starts_with(&arg.value))
                .map(|s| s.id.clone())
                .take(LIST_PAGE_SIZE)
                .collect(),
            _ => Vec::new(),
        };

        serde_json::to_value(CompletionResult {
            completion: Completion {
                values,
                has_more: false,
            },
        })
        .map_err(|e| McpError::Internal(e.to_string()))
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, McpError> {
    match cursor {
        None => Ok(0),
        Some(c) => c
            .parse::<usize>()
            .map_err(|_| McpError::InvalidParams(format!("invalid cursor: {}", c))),
    }
}

fn skill_to_tool(skill: &Skill) -> ToolDescriptor {
    ToolDescriptor {
        name: skill.id.clone(),
        description: skill.manifest.description.clone(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "arguments": {
                    "type": "string",
                    "description": "Arguments or context to pass to the skill. \
                        Substituted into $ARGUMENTS in the skill instructions.",
                },
            },
            "required": [],
        }),
    }
}

/// Render a skill's instructions for a call: `$ARGUMENTS` substitution plus
/// a flat key/value table of the remaining arguments.
fn render_instructions(skill: &Skill, arguments: &Value) -> String {
    let mut instructions = skill.instructions.clone();

    let args_map = arguments.as_object();
    if let Some(primary) = args_map
        .and_then(|m| m.get("arguments"))
        .map(flat_value)
    {
        instructions = instructions.replace("$ARGUMENTS", &primary);
    }

    let manifest = &skill.manifest;
    let mut parts = vec![
        format!("# Skill: {}", manifest.name),
        String::new(),
        format!("**Description**: {}", manifest.description),
        String::new(),
    ];
    if let Some(author) = &manifest.metadata.author {
        parts.push(format!("**Author**: {}", author));
    }
    if let Some(version) = &manifest.metadata.version {
        parts.push(format!("**Version**: {}", version));
    }
    if !manifest.allowed_tools.is_empty() {
        parts.push(format!(
            "**Allowed Tools**: {}",
            manifest.allowed_tools.join(", ")
        ));
    }
    parts.extend([String::new(), "---".to_string(), String::new(), instructions]);

    let extra: Vec<(String, String)> = args_map
        .map(|m| {
            m.iter()
                .filter(|(k, _)| *k != "arguments")
                .map(|(k, v)| (k.clone(), flat_value(v)))
                .collect()
        })
        .unwrap_or_default();
    if !extra.is_empty() {
        parts.extend([String::new(), "## Arguments".to_string(), String::new()]);
        for (key, value) in extra {
            parts.push(format!("{}: {}", key, value));
        }
    }

    parts.join("\n")
}

fn flat_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn mime_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("py") => "text/x-python",
        Some("js") => "text/javascript",
        Some("ts") => "text/typescript",
        Some("sh") | Some("bash") => "text/x-shellscript",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("yaml") | Some("yml") => "text/yaml",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json" || mime == "image/svg+xml"
}
