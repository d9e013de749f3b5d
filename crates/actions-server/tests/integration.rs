use std::sync::Arc;
use std::time::Duration;

use actions_core::context::{encode_encrypted, encode_plain};
use actions_core::keyring::{KeyRing, KEY_LEN};
use actions_core::manifest::Manifest;
use actions_core::registry::RunRegistry;
use actions_core::runner::ProcessInvoker;
use actions_server::dispatcher::Dispatcher;
use actions_server::{build_router, AppState};
use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const MANIFEST: &str = r#"
actions:
  - id: echo
    description: Return the stdin document
    command: [sh, -c, cat]
    parameters:
      - name: name
      - name: s
        kind: secret
  - id: open
    command: [sh, -c, 'cat >/dev/null; echo "{\"ok\":true}"']
  - id: fail
    command: [sh, -c, 'echo nope >&2; exit 1']
  - id: slow
    command: [sh, -c, 'sleep 5']
"#;

fn keyring() -> KeyRing {
    KeyRing::new(vec![[7u8; KEY_LEN], [8u8; KEY_LEN]])
}

struct Server {
    _dir: TempDir,
    state: AppState,
}

fn server(api_key: Option<&str>) -> Server {
    let dir = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::from_yaml(MANIFEST, dir.path().to_path_buf()).unwrap());
    let registry = RunRegistry::open(&dir.path().join("runs.redb")).unwrap();
    let dispatcher = Dispatcher::new(
        manifest.clone(),
        Arc::new(ProcessInvoker::new(manifest)),
        Arc::new(registry),
        Arc::new(keyring()),
        4,
        Duration::from_secs(30),
    );
    Server {
        _dir: dir,
        state: AppState::new(dispatcher, api_key.map(String::from)),
    }
}

async fn send(state: &AppState, req: axum::http::Request<axum::body::Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(state, req).await
}

async fn run(
    state: &AppState,
    action: &str,
    body: Value,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri(format!("/api/actions/{action}/run"))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(state, req).await
}

async fn post_empty(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(state, req).await
}

async fn wait_for(state: &AppState, id: &str, wanted: &str) -> Value {
    for _ in 0..300 {
        let (_, run) = get(state, &format!("/api/runs/{id}")).await;
        if run["state"] == wanted {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {id} never reached {wanted}");
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_actions_shows_parameter_kinds() {
    let s = server(None);
    let (status, json) = get(&s.state, "/api/actions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["id"], "echo");
    assert_eq!(json[0]["parameters"][1]["kind"], "secret");
    assert_eq!(json.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn plain_context_secret_is_delivered() {
    let s = server(None);
    let header = encode_plain(&json!({"secrets": {"s": "v"}, "tenant": "acme"}));
    let (status, json) = run(
        &s.state,
        "echo",
        json!({"name": "ada"}),
        &[("x-action-context", &header)],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["run"]["state"], "completed");
    assert_eq!(json["outputs"]["secrets"]["s"], "v");
    assert_eq!(json["outputs"]["inputs"]["name"], "ada");
}

#[tokio::test]
async fn encrypted_context_under_second_key() {
    let s = server(None);
    let header = encode_encrypted(&json!({"secrets": {"s": "sealed"}}), &keyring(), 1).unwrap();
    let (status, json) = run(&s.state, "echo", json!({}), &[("x-action-context", &header)]).await;

    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["run"]["key_index"], 1);
    assert_eq!(json["outputs"]["secrets"]["s"], "sealed");
}

#[tokio::test]
async fn envelope_missing_auth_tag_is_rejected() {
    let s = server(None);
    let header = encode_plain(&json!({
        "cipher": "AAAA",
        "algorithm": "aes256-gcm",
        "iv": "AAAAAAAAAAAAAAAA",
    }));
    let (status, json) = run(&s.state, "echo", json!({}), &[("x-action-context", &header)]).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "MalformedPayload");
    assert_eq!(json["run"]["state"], "failed");
}

#[tokio::test]
async fn garbage_header_is_malformed_encoding() {
    let s = server(None);
    let (status, json) = run(&s.state, "echo", json!({}), &[("x-action-context", "%%%")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "MalformedEncoding");
}

#[tokio::test]
async fn missing_secret_is_400() {
    let s = server(None);
    let (status, json) = run(&s.state, "echo", json!({}), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "MissingSecret");
}

#[tokio::test]
async fn action_error_is_500_with_stderr() {
    let s = server(None);
    let (status, json) = run(&s.state, "fail", json!({}), &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["kind"], "ActionError");
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn timeout_header_is_504() {
    let s = server(None);
    let (status, json) = run(&s.state, "slow", json!({}), &[("x-action-timeout", "0.2")]).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json["kind"], "Timeout");
}

#[tokio::test]
async fn unknown_action_is_404() {
    let s = server(None);
    let (status, json) = run(&s.state, "missing", json!({}), &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn non_object_body_is_400() {
    let s = server(None);
    let (status, _) = run(&s.state, "open", json!([1, 2]), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn async_run_is_accepted_then_completes() {
    let s = server(None);
    let (status, json) = run(&s.state, "open", json!({}), &[("x-action-async", "true")]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["state"], "queued");

    let id = json["id"].as_str().unwrap().to_string();
    let finished = wait_for(&s.state, &id, "completed").await;
    assert!(finished["ended_at"].is_string());

    let (status, outputs) = get(&s.state, &format!("/api/runs/{id}/outputs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outputs, json!({"ok": true}));
}

#[tokio::test]
async fn cancel_running_then_cancel_again_conflicts() {
    let s = server(None);
    let (_, json) = run(&s.state, "slow", json!({}), &[("x-action-async", "true")]).await;
    let id = json["id"].as_str().unwrap().to_string();
    wait_for(&s.state, &id, "running").await;

    // The signal is delivered; the run ends once the runner kills the child.
    let (status, signalled) = post_empty(&s.state, &format!("/api/runs/{id}/cancel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(signalled["state"], "running");
    let cancelled = wait_for(&s.state, &id, "cancelled").await;
    assert_eq!(cancelled["error"]["kind"], "Cancelled");

    let (status, _) = post_empty(&s.state, &format!("/api/runs/{id}/cancel")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn outputs_of_failed_run_are_404() {
    let s = server(None);
    let (_, json) = run(&s.state, "fail", json!({}), &[]).await;
    let id = json["run"]["id"].as_str().unwrap();
    let (status, _) = get(&s.state, &format!("/api/runs/{id}/outputs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_runs_filters_by_state() {
    let s = server(None);
    run(&s.state, "open", json!({}), &[]).await;
    run(&s.state, "fail", json!({}), &[]).await;
    run(&s.state, "open", json!({}), &[]).await;

    let (status, all) = get(&s.state, "/api/runs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (_, failed) = get(&s.state, "/api/runs?state=failed").await;
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["action_id"], "fail");

    let (_, page) = get(&s.state, "/api/runs?action_id=open&limit=1").await;
    assert_eq!(page.as_array().unwrap().len(), 1);

    let (status, _) = get(&s.state, "/api/runs?state=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn run_lookup_errors() {
    let s = server(None);
    let (status, _) = get(&s.state, "/api/runs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&s.state, &format!("/api/runs/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_key_is_required_when_configured() {
    let s = server(Some("k3y"));
    let (status, json) = get(&s.state, "/api/actions").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "unauthorized");

    let req = axum::http::Request::builder()
        .uri("/api/actions")
        .header("authorization", "Bearer wrong")
        .body(axum::body::Body::empty())
        .unwrap();
    assert_eq!(send(&s.state, req).await.0, StatusCode::UNAUTHORIZED);

    let req = axum::http::Request::builder()
        .uri("/api/actions")
        .header("authorization", "Bearer k3y")
        .body(axum::body::Body::empty())
        .unwrap();
    assert_eq!(send(&s.state, req).await.0, StatusCode::OK);
}
