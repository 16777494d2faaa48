//! HTTP API integration tests against the mock generation service.

mod common;

use axum::http::StatusCode;
use base64::Engine;
use serde_json::json;

use common::TestFixture;
use trellis_core::testing::{mock_artifact_bytes, SubmitBehavior};
use trellis_core::ArtifactKind;

// ============================================================================
// Health, config, status
// ============================================================================

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/health").await;

    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "status", json!("ok"));
}

#[tokio::test]
async fn test_config_is_sanitized() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/config").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["server"]["websocket_url"], "ws://localhost:5000");
    assert_eq!(response.body["api"]["port"], 8190);
    assert_eq!(response.body["api"]["max_request_body_mb"], 64);
    assert!(response.body["processing"]["parameter_presets"]["fast"].is_object());
    assert!(response.body.get("logging").is_none());
}

#[tokio::test]
async fn test_status_reports_running_orchestrator() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/status").await;

    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "running", json!(true));
    assert_json_path!(response.body, "active_tasks", json!(0));
    assert_json_path!(response.body, "open_sessions", json!(0));
}

// ============================================================================
// Job submission
// ============================================================================

#[tokio::test]
async fn test_submit_job_runs_to_completion() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    assert_status!(response, StatusCode::ACCEPTED);
    assert_json_path!(response.body, "state", json!("pending"));
    let task_id = response.body["id"].as_str().unwrap().to_string();

    let done = fixture.wait_for_terminal(&task_id).await;
    assert_eq!(done.state.state_type(), "complete");

    let response = fixture.get(&format!("/api/v1/tasks/{}", task_id)).await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "state", json!("complete"));
    assert_json_path!(response.body, "remote_id", json!("remote-1"));
    assert_json_path!(response.body, "progress", json!(1.0));
    let artifacts = response.body["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 2);
    let mesh_url = artifacts
        .iter()
        .find(|a| a["kind"] == "mesh")
        .and_then(|a| a["url"].as_str())
        .unwrap()
        .to_string();
    assert_eq!(mesh_url, "/api/v1/artifacts/remote-1/mesh");

    // The remote id resolves to the same task.
    let response = fixture.get("/api/v1/tasks/remote-1").await;
    assert_json_path!(response.body, "id", json!(task_id));

    let response = fixture.get(&mesh_url).await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.content_type.as_deref(), Some("model/gltf-binary"));
    assert_eq!(
        response.bytes,
        mock_artifact_bytes("remote-1", ArtifactKind::Mesh)
    );

    // Placeholder id and file extension work too.
    let response = fixture
        .get(&format!("/api/v1/artifacts/{}/mp4", task_id))
        .await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.content_type.as_deref(), Some("video/mp4"));
}

#[tokio::test]
async fn test_submit_job_applies_preset_then_overrides() {
    let fixture = TestFixture::new().await;
    fixture
        .service
        .set_behavior(SubmitBehavior::Stall {
            stage: "sparse".to_string(),
            progress: 0.1,
        })
        .await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "image_base64": format!("data:image/png;base64,{}", fixture.image_base64()),
                "preset": "fast",
                "params": { "seed": 42 }
            }),
        )
        .await;

    assert_status!(response, StatusCode::ACCEPTED);
    assert_eq!(response.body["params"]["seed"], 42);
    assert_eq!(response.body["params"]["sparse_steps"], 8);
    assert_eq!(response.body["params"]["texture_size"], 512);
}

#[tokio::test]
async fn test_submit_job_invalid_texture_size() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "image_base64": fixture.image_base64(),
                "params": { "texture_size": 999 }
            }),
        )
        .await;

    assert_status!(response, StatusCode::BAD_REQUEST);
    assert!(response.body["error"]
        .as_str()
        .unwrap()
        .contains("texture_size"));

    let sessions = fixture.get("/api/v1/sessions").await;
    assert_json_path!(sessions.body, "total", json!(0));
    assert_eq!(fixture.service.connect_count().await, 0);
}

#[tokio::test]
async fn test_submit_job_unknown_preset() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64(), "preset": "ultra" }),
        )
        .await;

    assert_status!(response, StatusCode::BAD_REQUEST);
    assert!(response.body["error"].as_str().unwrap().contains("ultra"));
}

#[tokio::test]
async fn test_submit_job_rejects_bad_image() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/api/v1/jobs", json!({ "image_base64": "%%%" }))
        .await;
    assert_status!(response, StatusCode::BAD_REQUEST);

    // Valid base64, but not an image.
    let response = fixture
        .post("/api/v1/jobs", json!({ "image_base64": "aGVsbG8gd29ybGQ=" }))
        .await;
    assert_status!(response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_job_accepts_multi_megabyte_image() {
    let fixture = TestFixture::new().await;
    // Decoding reads only the header, so trailing bytes just add weight.
    let mut image = common::fixtures::png_image(16, 16).bytes;
    image.resize(image.len() + 3 * 1024 * 1024, 0);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&image);
    assert!(encoded.len() > 2 * 1024 * 1024);

    let response = fixture
        .post("/api/v1/jobs", json!({ "image_base64": encoded }))
        .await;

    assert_status!(response, StatusCode::ACCEPTED);
    let task_id = response.body["id"].as_str().unwrap().to_string();
    let done = fixture.wait_for_terminal(&task_id).await;
    assert_eq!(done.image.bytes, image.len() as u64);
}

#[tokio::test]
async fn test_submit_job_over_body_limit() {
    let fixture = TestFixture::with_config(|config| config.api.max_request_body_mb = 1).await;
    let mut image = common::fixtures::png_image(16, 16).bytes;
    image.resize(2 * 1024 * 1024, 0);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&image);

    let response = fixture
        .post("/api/v1/jobs", json!({ "image_base64": encoded }))
        .await;

    assert_status!(response, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_submit_job_malformed_json() {
    let fixture = TestFixture::new().await;

    let response = fixture.post_raw("/api/v1/jobs", "{not json").await;

    assert!(response.status.is_client_error());
}

#[tokio::test]
async fn test_identical_jobs_share_a_task() {
    let fixture = TestFixture::new().await;
    fixture
        .service
        .set_behavior(SubmitBehavior::Stall {
            stage: "slat".to_string(),
            progress: 0.2,
        })
        .await;
    let image = fixture.image_base64();

    let first = fixture
        .post("/api/v1/jobs", json!({ "image_base64": image }))
        .await;
    let session_id = first.body["session_id"].as_str().unwrap().to_string();
    let second = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": image, "session_id": session_id }),
        )
        .await;

    assert_status!(second, StatusCode::ACCEPTED);
    assert_eq!(first.body["id"], second.body["id"]);
}

// ============================================================================
// Task operations
// ============================================================================

#[tokio::test]
async fn test_get_unknown_task() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/tasks/nope").await;

    assert_status!(response, StatusCode::NOT_FOUND);
    assert!(response.body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_cancel_task() {
    let fixture = TestFixture::new().await;
    fixture
        .service
        .set_behavior(SubmitBehavior::Stall {
            stage: "sparse".to_string(),
            progress: 0.3,
        })
        .await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    let task_id = response.body["id"].as_str().unwrap().to_string();
    fixture.wait_for_state(&task_id, "sparse_running").await;

    let response = fixture.delete(&format!("/api/v1/tasks/{}", task_id)).await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "state", json!("cancelled"));

    let response = fixture.delete(&format!("/api/v1/tasks/{}", task_id)).await;
    assert_status!(response, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_retry_download_requires_storage_failure() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    let task_id = response.body["id"].as_str().unwrap().to_string();
    fixture.wait_for_terminal(&task_id).await;

    let response = fixture
        .post_empty(&format!("/api/v1/tasks/{}/retry-download", task_id))
        .await;
    assert_status!(response, StatusCode::CONFLICT);

    let response = fixture.post_empty("/api/v1/tasks/nope/retry-download").await;
    assert_status!(response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remote_failure_is_visible() {
    let fixture = TestFixture::new().await;
    fixture
        .service
        .set_behavior(SubmitBehavior::Fail("CUDA out of memory".to_string()))
        .await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    let task_id = response.body["id"].as_str().unwrap().to_string();
    fixture.wait_for_terminal(&task_id).await;

    let response = fixture.get(&format!("/api/v1/tasks/{}", task_id)).await;
    assert_json_path!(response.body, "state", json!("failed"));
    assert_eq!(response.body["error"]["kind"], "remote");
    assert_eq!(response.body["error"]["message"], "CUDA out of memory");

    let response = fixture
        .get(&format!("/api/v1/artifacts/{}/mesh", task_id))
        .await;
    assert_status!(response, StatusCode::NOT_FOUND);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_sessions_list_get_and_close() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    let task_id = response.body["id"].as_str().unwrap().to_string();
    let session_id = response.body["session_id"].as_str().unwrap().to_string();
    fixture.wait_for_terminal(&task_id).await;

    let response = fixture.get("/api/v1/sessions").await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "total", json!(1));
    assert_eq!(response.body["sessions"][0]["id"], session_id.as_str());
    assert_eq!(response.body["sessions"][0]["task_count"], 1);

    let response = fixture
        .get(&format!("/api/v1/sessions/{}", session_id))
        .await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "status", json!("open"));
    assert_eq!(response.body["tasks"][0]["id"], task_id.as_str());

    let response = fixture.get("/api/v1/status").await;
    assert_eq!(response.body["channels"][0]["session_id"], session_id.as_str());

    let response = fixture
        .delete(&format!("/api/v1/sessions/{}", session_id))
        .await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "status", json!("closed"));

    // Closing the session releases its channel.
    let response = fixture.get("/api/v1/status").await;
    assert_json_path!(response.body, "channels", json!([]));
    assert_json_path!(response.body, "open_sessions", json!(0));

    let response = fixture.get("/api/v1/sessions/session_0_missing").await;
    assert_status!(response, StatusCode::NOT_FOUND);
}

// ============================================================================
// Cache and metrics
// ============================================================================

#[tokio::test]
async fn test_cache_stats_and_sweep() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "image_base64": fixture.image_base64() }),
        )
        .await;
    let task_id = response.body["id"].as_str().unwrap().to_string();
    fixture.wait_for_terminal(&task_id).await;

    let response = fixture.get("/api/v1/cache/stats").await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "entries", json!(2));
    assert_json_path!(response.body, "budget_bytes", json!(1024u64 * 1024 * 1024));

    // Fresh artifacts are neither expired nor over budget.
    let response = fixture.post_empty("/api/v1/cache/sweep").await;
    assert_status!(response, StatusCode::OK);
    assert_json_path!(response.body, "expired", json!(0));
    assert_json_path!(response.body, "evicted", json!(0));
}

#[tokio::test]
async fn test_unknown_artifact_kind() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/artifacts/remote-1/texture").await;

    assert_status!(response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new().await;
    fixture.get("/api/v1/health").await;

    let response = fixture.get("/api/v1/metrics").await;

    assert_status!(response, StatusCode::OK);
    let text = response.text();
    assert!(text.contains("trellis_http_requests_total"));
    assert!(text.contains("trellis_orchestrator_running 1"));
    assert!(text.contains("trellis_sessions_open"));
}
