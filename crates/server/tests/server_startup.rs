use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Create a minimal valid config with every directory under `root`
fn minimal_config(port: u16, root: &TempDir) -> String {
    let dir = |name: &str| root.path().join(name).display().to_string();
    format!(
        r#"
[server]
websocket_url = "ws://user:secret@127.0.0.1:1/ws?token=abc"

[api]
host = "127.0.0.1"
port = {}

[storage]
download_dir = "{}"
api_download_dir = "{}"
session_dir = "{}"
metadata_dir = "{}"
"#,
        port,
        dir("downloads"),
        dir("api_downloads"),
        dir("sessions"),
        dir("metadata"),
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

async fn run_to_exit(config_path: &std::path::Path) -> std::process::Output {
    timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_trellis"))
            .env("TRELLIS_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command")
}

/// Spawn the server and return a handle
async fn spawn_server(config_path: &std::path::Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_trellis"))
        .env("TRELLIS_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server")
}

/// Wait for server to be ready
async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/api/v1/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_health_endpoint() {
    let port = get_available_port();
    let root = TempDir::new().unwrap();
    let temp_file = write_config(&minimal_config(port, &root));

    // Start server
    let mut server = spawn_server(temp_file.path()).await;

    // Wait for server to be ready
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    // Test health endpoint
    let client = Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/health", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["status"], "ok");

    // Cleanup
    server.kill().await.ok();
}

#[tokio::test]
async fn test_config_endpoint_returns_sanitized() {
    let port = get_available_port();
    let root = TempDir::new().unwrap();
    let temp_file = write_config(&minimal_config(port, &root));

    // Start server
    let mut server = spawn_server(temp_file.path()).await;

    // Wait for server to be ready
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    // Test config endpoint
    let client = Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/config", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["api"]["port"], port);
    assert_eq!(json["server"]["websocket_url"], "ws://127.0.0.1:1/ws");
    assert!(!json.to_string().contains("secret"));

    // Cleanup
    server.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    let result = run_to_exit(std::path::Path::new("/nonexistent/config.toml")).await;

    assert!(!result.status.success());
}

#[tokio::test]
async fn test_http_websocket_url_exits_with_error() {
    let temp_file = write_config(
        r#"
[server]
websocket_url = "http://127.0.0.1:5000"
"#,
    );

    let result = run_to_exit(temp_file.path()).await;

    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("websocket_url"));
}

#[tokio::test]
async fn test_zero_timeout_exits_with_error() {
    let temp_file = write_config(
        r#"
[server]
timeout_seconds = 0
"#,
    );

    let result = run_to_exit(temp_file.path()).await;

    assert!(!result.status.success());
}
