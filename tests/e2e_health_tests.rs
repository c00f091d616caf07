//! End-to-end tests for health endpoints and cross-instance replication.

mod common;

use std::time::Duration;

use common::{make_skill_zip, TestClient, TestServer};
use reqwest::StatusCode;

#[tokio::test]
async fn test_health_reports_counters() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());
    client
        .upload_skill(make_skill_zip("echo", "echoes input back"))
        .await;

    let response = client.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["skills_loaded"], 1);
    assert_eq!(body["invocation_log"]["dropped_events_total"], 0);
}

#[tokio::test]
async fn test_info_blob() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let response = client.get("/info").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "skillserve");
    assert!(body["version"].as_str().unwrap().contains('-'));
    assert_eq!(body["storage_backend"], "local");

    let versions = body["protocol_versions"].as_array().unwrap();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0], "2025-11-25");
}

#[tokio::test]
async fn test_publish_becomes_visible_on_peer_within_refresh_cycle() {
    let (node_a, node_b) = TestServer::spawn_replicated("1").await;

    let client_a = TestClient::new(node_a.base_url.clone());
    let response = client_a
        .upload_skill(make_skill_zip("echo", "echoes input back"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Node B pulls the active list on its refresh interval.
    let client_b = TestClient::new(node_b.base_url.clone());
    let mut visible = false;
    for _ in 0..100 {
        let response = client_b.admin_get("/skills/echo").await;
        if response.status() == StatusCode::OK {
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["skill"]["version"], 1);
            visible = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(visible, "peer did not pick up the publish within 10s");
}

#[tokio::test]
async fn test_rollback_propagates_to_peer() {
    let (node_a, node_b) = TestServer::spawn_replicated("1").await;

    let client_a = TestClient::new(node_a.base_url.clone());
    client_a
        .upload_skill(make_skill_zip("echo", "first description"))
        .await;
    client_a
        .upload_skill(make_skill_zip("echo", "second description"))
        .await;
    client_a
        .admin_post("/skills/echo/rollback", serde_json::json!({"version": 1}))
        .await;

    let client_b = TestClient::new(node_b.base_url.clone());
    let mut rolled_back = false;
    for _ in 0..100 {
        let response = client_b.admin_get("/skills/echo").await;
        if response.status() == StatusCode::OK {
            let body: serde_json::Value = response.json().await.unwrap();
            if body["skill"]["version"] == 1 {
                assert_eq!(body["skill"]["manifest"]["description"], "first description");
                rolled_back = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(rolled_back, "peer did not pick up the rollback within 10s");
}
