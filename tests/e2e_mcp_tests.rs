//! End-to-end tests for the MCP endpoint: session lifecycle, protocol
//! negotiation, tool dispatch and streaming.

mod common;

use std::time::Duration;

use common::{make_skill_zip, make_zip, TestClient, TestServer};
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::json;

async fn upload_echo(server: &TestServer) {
    let client = TestClient::new(server.base_url.clone());
    let response = client
        .upload_skill(make_skill_zip("echo", "echoes input back"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Initialization & Sessions
// =============================================================================

#[tokio::test]
async fn test_initialize_assigns_session_header() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());

    let response = client.initialize("2025-11-25").await;
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = client.session_id.clone().expect("session header missing");
    assert_eq!(session_id.len(), 36, "session id should be a uuid");

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["protocolVersion"], "2025-11-25");
    assert_eq!(body["result"]["serverInfo"]["name"], "skillserve");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], true);
}

#[tokio::test]
async fn test_protocol_fallback_to_oldest_supported() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());

    let response = client.initialize("2025-03-26").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
}

#[tokio::test]
async fn test_protocol_mismatch_creates_no_session() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());

    let response = client.initialize("2024-11-05").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        client.session_id.is_none(),
        "no session header on protocol mismatch"
    );

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32002);
}

#[tokio::test]
async fn test_lowercase_session_header_accepted() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;
    let session_id = client.session_id.clone().unwrap();

    // Send the header in its all-lowercase form.
    let response = client
        .client
        .post(format!("{}/mcp", server.base_url))
        .header("mcp-session-id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn test_request_without_session_rejected() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .post_mcp(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);
}

#[tokio::test]
async fn test_idle_session_requires_reinitialize() {
    // Zero idle minutes: every session is suspended as soon as it goes idle,
    // standing in for the 15 minute production window.
    let server = TestServer::spawn_with_env(&[("SESSION_IDLE_MINUTES", "0")]).await;
    let mut client = TestClient::new(server.base_url.clone());

    let response = client.initialize("2025-11-25").await;
    assert_eq!(response.status(), StatusCode::OK);
    let first_session = client.session_id.clone().unwrap();

    let response = client
        .post_mcp(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);

    // Re-initialize succeeds with a fresh id.
    let response = client.initialize("2025-11-25").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_ne!(client.session_id.clone().unwrap(), first_session);
}

#[tokio::test]
async fn test_delete_session_is_idempotent() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    assert_eq!(client.close_session().await.status(), StatusCode::NO_CONTENT);
    assert_eq!(client.close_session().await.status(), StatusCode::NO_CONTENT);

    // The closed session is gone.
    let response = client
        .post_mcp(&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_methods_require_initialized_notification() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());

    let response = client.initialize("2025-11-25").await;
    assert_eq!(response.status(), StatusCode::OK);

    // tools/list before the initialized notification.
    let body = client.rpc(2, "tools/list", json!({})).await;
    assert_eq!(body["error"]["code"], -32600);
}

// =============================================================================
// Tools
// =============================================================================

#[tokio::test]
async fn test_tools_list_returns_user_invocable_skills() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let hidden = make_zip(&[(
        "SKILL.md",
        "---\nname: internal-helper\ndescription: internal helper skill\nuser-invocable: false\n---\n\nNot for slash commands.\n",
    )]);
    let admin = TestClient::new(server.base_url.clone());
    assert_eq!(admin.upload_skill(hidden).await.status(), StatusCode::OK);

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client.rpc(2, "tools/list", json!({})).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo");
    assert!(body["result"]["nextCursor"].is_null());
}

#[tokio::test]
async fn test_tools_call_renders_instructions_and_counts() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client
        .tools_call("echo", json!({"arguments": "hi there"}))
        .await;
    assert!(body["error"].is_null(), "unexpected error: {body}");
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("# Skill: echo"));
    assert!(text.contains("hi there"));
    assert_eq!(body["result"]["isError"], false);

    // The persistent counter lands asynchronously.
    let metadata = server.state.catalog.metadata().clone();
    let mut count = 0;
    for _ in 0..50 {
        count = metadata.get("echo").unwrap().unwrap().invocation_count;
        if count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(count, 1);

    // One success event reaches the invocation log.
    let store = server.state.invocation_store.clone();
    let mut events = Vec::new();
    for _ in 0..50 {
        events = store.query("echo", None, 10).unwrap();
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status.as_str(), "success");
    assert_eq!(events[0].method, "tools/call");
}

#[tokio::test]
async fn test_tools_call_unknown_tool() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client.tools_call("ghost", json!({})).await;
    assert_eq!(body["error"]["code"], -32003);
}

#[tokio::test]
async fn test_tools_call_permission_denied() {
    let server = TestServer::spawn().await;
    let hidden = make_zip(&[(
        "SKILL.md",
        "---\nname: internal-helper\ndescription: internal helper skill\nuser-invocable: false\n---\n\nNot for slash commands.\n",
    )]);
    let admin = TestClient::new(server.base_url.clone());
    assert_eq!(admin.upload_skill(hidden).await.status(), StatusCode::OK);

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client.tools_call("internal-helper", json!({})).await;
    assert_eq!(body["error"]["code"], -32004);
}

#[tokio::test]
async fn test_batch_responses_preserve_order() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let response = client
        .post_mcp(&json!([
            {"jsonrpc": "2.0", "id": 10, "method": "ping"},
            {"jsonrpc": "2.0", "id": 11, "method": "tools/list"},
            {"jsonrpc": "2.0", "id": 12, "method": "ping"},
        ]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    let responses = body.as_array().unwrap();
    let ids: Vec<i64> = responses
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![10, 11, 12]);
}

// =============================================================================
// Prompts & Resources
// =============================================================================

#[tokio::test]
async fn test_prompts_surface() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client.rpc(2, "prompts/list", json!({})).await;
    let prompts = body["result"]["prompts"].as_array().unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0]["name"], "echo");

    let body = client
        .rpc(
            3,
            "prompts/get",
            json!({"name": "echo", "arguments": {"arguments": "from prompt"}}),
        )
        .await;
    let text = body["result"]["messages"][0]["content"]["text"]
        .as_str()
        .unwrap();
    assert!(text.contains("from prompt"));
    assert_eq!(body["result"]["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_resources_surface() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client.rpc(2, "resources/list", json!({})).await;
    let resources = body["result"]["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["uri"], "skill://echo/references/usage.md");
    assert_eq!(resources[0]["mimeType"], "text/markdown");

    let body = client
        .rpc(
            3,
            "resources/read",
            json!({"uri": "skill://echo/references/usage.md"}),
        )
        .await;
    let contents = &body["result"]["contents"][0];
    assert_eq!(contents["mimeType"], "text/markdown");
    assert!(contents["text"].as_str().unwrap().contains("# Usage"));
}

#[tokio::test]
async fn test_completion_is_best_effort() {
    let server = TestServer::spawn().await;
    upload_echo(&server).await;

    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let body = client
        .rpc(
            2,
            "completion/complete",
            json!({"argument": {"name": "name", "value": "ec"}}),
        )
        .await;
    let values = body["result"]["completion"]["values"].as_array().unwrap();
    assert_eq!(values[0], "echo");

    let body = client.rpc(3, "completion/complete", json!({})).await;
    assert!(body["result"]["completion"]["values"]
        .as_array()
        .unwrap()
        .is_empty());
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_post_with_sse_accept_frames_messages() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let response = client
        .client
        .post(format!("{}/mcp", server.base_url))
        .header(common::client::SESSION_HEADER, client.session_id.clone().unwrap())
        .header("Accept", "text/event-stream")
        .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    assert!(body.contains("event: message"), "missing frame: {body}");
    assert!(body.contains("\"jsonrpc\":\"2.0\""));
    assert!(body.contains("event: done"), "missing sentinel: {body}");
}

#[tokio::test]
async fn test_notification_stream_delivers_broadcasts() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;
    let session_id = client.session_id.clone().unwrap();

    let response = client
        .client
        .get(format!("{}/mcp", server.base_url))
        .header(common::client::SESSION_HEADER, &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.bytes_stream();
    let mut collected = String::new();

    // First frame announces the connection.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.contains("connected") {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for connected event")
            .expect("stream ended early")
            .unwrap();
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(collected.contains(&session_id));

    // A publish broadcasts a tools/list_changed notification.
    upload_echo(&server).await;
    while !collected.contains("notifications/tools/list_changed") {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for list_changed notification")
            .expect("stream ended early")
            .unwrap();
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(collected.contains("event: message"));
}

#[tokio::test]
async fn test_notification_stream_requires_sse_accept() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;

    let response = client
        .client
        .get(format!("{}/mcp", server.base_url))
        .header(common::client::SESSION_HEADER, client.session_id.clone().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_reconnect_delivers_buffered_notifications() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::new(server.base_url.clone());
    client.handshake().await;
    let session_id = client.session_id.clone().unwrap();

    // No stream attached: the broadcast lands in the session's ring buffer.
    upload_echo(&server).await;

    let response = client
        .client
        .get(format!("{}/mcp", server.base_url))
        .header(common::client::SESSION_HEADER, &session_id)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.bytes_stream();
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.contains("notifications/tools/list_changed") {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for buffered notification")
            .expect("stream ended early")
            .unwrap();
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
}
