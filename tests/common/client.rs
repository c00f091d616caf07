//! HTTP client for end-to-end tests.
//!
//! Wraps reqwest with helpers for the MCP endpoint and the admin surface.
//! When routes or request formats change, update only this file.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct TestClient {
    pub client: reqwest::Client,
    pub base_url: String,
    /// Captured from the initialize response; sent on subsequent requests.
    pub session_id: Option<String>,
    /// Bearer token for the admin surface, when the server requires one.
    pub admin_token: Option<String>,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url,
            session_id: None,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(token.to_string());
        self
    }

    // ========================================================================
    // MCP endpoint
    // ========================================================================

    /// POST a raw JSON-RPC payload, attaching the captured session header.
    pub async fn post_mcp(&self, payload: &Value) -> Response {
        let mut request = self
            .client
            .post(format!("{}/mcp", self.base_url))
            .json(payload);
        if let Some(id) = &self.session_id {
            request = request.header(SESSION_HEADER, id);
        }
        request.send().await.expect("mcp request failed")
    }

    /// Send `initialize`, capturing the session id from the response header.
    /// Any previously captured session is discarded first, the way a client
    /// recovering from session-not-found would.
    pub async fn initialize(&mut self, protocol_version: &str) -> Response {
        self.session_id = None;
        let response = self
            .post_mcp(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": protocol_version,
                    "capabilities": {},
                    "clientInfo": {"name": "e2e-test", "version": "0.0.1"},
                },
            }))
            .await;

        self.session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        response
    }

    /// Full handshake: initialize on the newest protocol, then the
    /// `initialized` notification.
    pub async fn handshake(&mut self) {
        let response = self.initialize("2025-11-25").await;
        assert_eq!(response.status(), StatusCode::OK, "initialize failed");
        assert!(self.session_id.is_some(), "no session header returned");

        let response = self
            .post_mcp(&json!({"jsonrpc": "2.0", "method": "initialized"}))
            .await;
        assert_eq!(
            response.status(),
            StatusCode::ACCEPTED,
            "initialized notification not accepted"
        );
    }

    /// Call a method and return the parsed JSON-RPC response body.
    pub async fn rpc(&self, id: i64, method: &str, params: Value) -> Value {
        let response = self
            .post_mcp(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await;
        response.json().await.expect("invalid JSON-RPC response")
    }

    pub async fn tools_call(&self, name: &str, arguments: Value) -> Value {
        self.rpc(7, "tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    pub async fn close_session(&self) -> Response {
        let mut request = self.client.delete(format!("{}/mcp", self.base_url));
        if let Some(id) = &self.session_id {
            request = request.header(SESSION_HEADER, id);
        }
        request.send().await.expect("delete request failed")
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    fn admin_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.admin_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn admin_get(&self, path: &str) -> Response {
        self.admin_request(
            self.client
                .get(format!("{}/admin{}", self.base_url, path)),
        )
        .send()
        .await
        .expect("admin GET failed")
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> Response {
        self.admin_request(
            self.client
                .post(format!("{}/admin{}", self.base_url, path))
                .json(&body),
        )
        .send()
        .await
        .expect("admin POST failed")
    }

    pub async fn admin_post_empty(&self, path: &str) -> Response {
        self.admin_request(
            self.client
                .post(format!("{}/admin{}", self.base_url, path)),
        )
        .send()
        .await
        .expect("admin POST failed")
    }

    pub async fn admin_delete(&self, path: &str) -> Response {
        self.admin_request(
            self.client
                .delete(format!("{}/admin{}", self.base_url, path)),
        )
        .send()
        .await
        .expect("admin DELETE failed")
    }

    async fn upload_multipart(&self, path: &str, zip_bytes: Vec<u8>) -> Response {
        let form = Form::new().part(
            "file",
            Part::bytes(zip_bytes)
                .file_name("skill.zip")
                .mime_str("application/zip")
                .unwrap(),
        );
        self.admin_request(
            self.client
                .post(format!("{}/admin{}", self.base_url, path))
                .multipart(form),
        )
        .send()
        .await
        .expect("multipart upload failed")
    }

    /// POST /admin/skills/upload
    pub async fn upload_skill(&self, zip_bytes: Vec<u8>) -> Response {
        self.upload_multipart("/skills/upload", zip_bytes).await
    }

    /// POST /admin/skills/validate
    pub async fn validate_skill(&self, zip_bytes: Vec<u8>) -> Response {
        self.upload_multipart("/skills/validate", zip_bytes).await
    }

    // ========================================================================
    // Health endpoints
    // ========================================================================

    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("GET failed")
    }
}
