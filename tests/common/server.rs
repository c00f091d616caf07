//! Test server lifecycle management.
//!
//! Each test gets an isolated server with its own temp storage. Dropping the
//! handle shuts the server and its background tasks down.

use std::time::Duration;

use skillserve::config::{AppConfig, CliConfig};
use skillserve::server::{bootstrap, make_app, RequestsLoggingLevel, ServerState};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SERVER_READY_TIMEOUT_MS: u64 = 5000;
const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;

pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// Server internals, for direct assertions against the stores.
    pub state: ServerState,

    _temp_dir: Option<TempDir>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawn a server on a random port with default test settings: empty
    /// catalog allowed and a 1 second catalog refresh.
    pub async fn spawn() -> Self {
        Self::spawn_with_env(&[]).await
    }

    pub async fn spawn_with_env(overrides: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let data_dir = temp_dir.path().to_path_buf();
        let server = Self::spawn_inner(data_dir, overrides, Some(temp_dir)).await;
        server.wait_for_ready().await;
        server
    }

    /// Spawn two instances on the `remote` backend sharing one bucket, for
    /// replication tests. The shared TempDir rides along with the first.
    pub async fn spawn_replicated(refresh_secs: &str) -> (Self, Self) {
        let shared = TempDir::new().expect("failed to create temp dir");
        let bucket = shared.path().join("bucket");
        let bucket_str = bucket.to_string_lossy().to_string();

        let env: Vec<(&str, &str)> = vec![
            ("STORAGE_BACKEND", "remote"),
            ("OBJECT_STORE_BUCKET", &bucket_str),
            ("CATALOG_REFRESH_SECONDS", refresh_secs),
        ];

        let mut a = Self::spawn_inner(shared.path().join("node-a"), &env, None).await;
        let b = Self::spawn_inner(shared.path().join("node-b"), &env, None).await;
        a._temp_dir = Some(shared);

        a.wait_for_ready().await;
        b.wait_for_ready().await;
        (a, b)
    }

    async fn spawn_inner(
        data_dir: std::path::PathBuf,
        overrides: &[(&str, &str)],
        temp_dir: Option<TempDir>,
    ) -> Self {
        let cli = CliConfig {
            port: 0,
            data_dir,
            logging_level: RequestsLoggingLevel::None,
        };

        let overrides: Vec<(String, String)> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let env = move |key: &str| {
            overrides
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .or(match key {
                    // Test-friendly defaults, overridable above.
                    "ALLOW_EMPTY_CATALOG" => Some("true".to_string()),
                    "CATALOG_REFRESH_SECONDS" => Some("1".to_string()),
                    _ => None,
                })
        };

        let config = AppConfig::resolve_from(&cli, &env).expect("failed to resolve config");

        let shutdown = CancellationToken::new();
        let state = bootstrap(config, shutdown.clone())
            .await
            .expect("bootstrap failed");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let app = make_app(state.clone());
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await
                .expect("server failed");
        });

        Self {
            base_url,
            state,
            _temp_dir: temp_dir,
            shutdown,
        }
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("failed to build reqwest client");

        let start = std::time::Instant::now();
        loop {
            if start.elapsed() > Duration::from_millis(SERVER_READY_TIMEOUT_MS) {
                panic!(
                    "server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }
            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
