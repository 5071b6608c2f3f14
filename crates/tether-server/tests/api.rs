// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Black-box tests over the HTTP surface: auth boundaries, the hook
//! rendezvous round-trip, queueing under CLI control, and the
//! continuation-map endpoints. The Agent is a shell-script fixture.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use tether_config::Config;
use tether_core::{Notifier, PermissionEngine, RendezvousQueue, SessionRegistry};
use tether_exec::TaskExecutor;
use tether_server::{router, AppState};
use tether_store::Store;

const SECRET: &str = "test-secret";

async fn test_state(agent_bin: &str, upload_dir: &std::path::Path) -> AppState {
    let upload_dir = upload_dir.display().to_string();
    let agent = agent_bin.to_string();
    let config = Config::from_lookup(move |name| match name {
        "BRIDGE_SECRET" => Some(SECRET.to_string()),
        "AUTH_USERNAME" => Some("admin".to_string()),
        "AUTH_PASSWORD" => Some("password123".to_string()),
        "JWT_SECRET" => Some("jwt-test-secret".to_string()),
        "AGENT_BIN" => Some(agent.clone()),
        "UPLOAD_DIR" => Some(upload_dir.clone()),
        _ => None,
    })
    .unwrap();

    let store = Store::open_in_memory().await.unwrap();
    let notifier = Notifier::new();
    let rendezvous = Arc::new(RendezvousQueue::new());
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        rendezvous.clone(),
        notifier.clone(),
    ));
    let engine = Arc::new(PermissionEngine::new(
        store.clone(),
        registry.clone(),
        rendezvous.clone(),
        notifier.clone(),
    ));
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        notifier.clone(),
        config.agent_bin.clone(),
    ));

    AppState {
        config: Arc::new(config),
        store,
        registry,
        rendezvous,
        engine,
        executor,
        notifier,
        bot: None,
    }
}

async fn request(
    app: &Router,
    method: Method,
    path: &str,
    secret: bool,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if secret {
        builder = builder.header("X-Bridge-Secret", SECRET);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn encode_path(p: &str) -> String {
    p.replace('/', "%2F")
}

#[cfg(unix)]
fn fixture_agent(dir: &std::path::Path, script: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-agent");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn health_is_public_and_sessions_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    let (status, body) = request(&app, Method::GET, "/health", false, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = request(&app, Method::GET, "/sessions", false, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(&app, Method::GET, "/sessions", true, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn hook_routes_reject_bearer_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    // A valid UI login does not open the hook surface.
    let (status, body) = request(
        &app,
        Method::POST,
        "/auth/login",
        false,
        Some(json!({"username": "admin", "password": "password123"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method(Method::POST)
        .uri("/hooks/sessions/register")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(
            json!({"session_id": "s1", "project_dir": "/p"}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_verify_refresh_flow() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    let (status, _) = request(
        &app,
        Method::POST,
        "/auth/login",
        false,
        Some(json!({"username": "admin", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = request(
        &app,
        Method::POST,
        "/auth/login",
        false,
        Some(json!({"username": "admin", "password": "password123"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method(Method::GET)
        .uri("/auth/verify")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["valid"], true);
    assert_eq!(body["username"], "admin");
}

#[tokio::test]
async fn notify_wait_resolve_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "sess-0001", "project_dir": "/proj/app"})),
    )
    .await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/hooks/sessions/sess-0001/notify",
        true,
        Some(json!({
            "session_name": "app",
            "message": "Run `rm -rf build`?",
            "type": "permission",
            "tool_name": "Execute",
            "tool_input": {"command": "rm -rf build"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let request_id = body["request_id"].as_str().unwrap().to_string();

    // The hook blocks on /wait while the operator decides.
    let wait_app = app.clone();
    let rid = request_id.clone();
    let wait = tokio::spawn(async move {
        request(
            &wait_app,
            Method::POST,
            "/hooks/sessions/sess-0001/wait",
            true,
            Some(json!({"request_id": rid, "timeout": 5})),
        )
        .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/sessions/sess-0001/permissions/{request_id}/resolve"),
        true,
        Some(json!({"decision": "approved"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = wait.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_response"], true);
    assert_eq!(body["response"], "approve");

    // Audit row names the web surface.
    let (_, body) = request(
        &app,
        Method::GET,
        "/sessions/sess-0001/permissions",
        true,
        None,
    )
    .await;
    let permissions = body["permissions"].as_array().unwrap();
    assert_eq!(permissions[0]["decision"], "approved");
    assert_eq!(permissions[0]["decided_by"], "web");
}

#[tokio::test]
async fn wait_with_zero_timeout_returns_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "sess-0002", "project_dir": "/p"})),
    )
    .await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/hooks/sessions/sess-0002/wait",
        true,
        Some(json!({"request_id": "r-none", "timeout": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timeout"], true);
    assert_eq!(body["has_response"], false);
}

#[tokio::test]
async fn early_response_is_parked_for_the_hook() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "sess-0003", "project_dir": "/p"})),
    )
    .await;

    // The answer lands before anyone waits.
    request(
        &app,
        Method::POST,
        "/hooks/sessions/sess-0003/respond",
        true,
        Some(json!({"request_id": "r1", "response": "go ahead"})),
    )
    .await;

    let (_, body) = request(
        &app,
        Method::GET,
        "/hooks/sessions/sess-0003/response/r1",
        true,
        None,
    )
    .await;
    assert_eq!(body["has_response"], true);
    assert_eq!(body["response"], "go ahead");

    // Consumed: a second poll comes back empty.
    let (_, body) = request(
        &app,
        Method::GET,
        "/hooks/sessions/sess-0003/response/r1",
        true,
        None,
    )
    .await;
    assert_eq!(body["has_response"], false);
}

#[cfg(unix)]
#[tokio::test]
async fn task_queues_while_cli_holds_then_runs_after_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let agent = fixture_agent(
        dir.path(),
        r#"printf '{"result": "queued work done", "session_id": "agent-sess-7", "duration_ms": 3, "num_turns": 1}'"#,
    );
    let app = router(test_state(&agent, dir.path()).await);
    let project = dir.path().display().to_string();

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "cli-sess-77", "project_dir": project})),
    )
    .await;

    // CLI holds control: the prompt queues instead of executing.
    let (status, body) = request(
        &app,
        Method::POST,
        "/tasks/execute",
        true,
        Some(json!({
            "prompt": "fix the tests",
            "project_dir": project,
            "session_id": "cli-sess-77",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let (_, body) = request(&app, Method::GET, "/sessions/cli-sess-77/queue", true, None).await;
    assert_eq!(body["count"], 1);

    // Stop point, then explicit handoff.
    request(
        &app,
        Method::POST,
        "/hooks/sessions/cli-sess-77/notify",
        true,
        Some(json!({"session_name": "app", "message": "done", "type": "stop"})),
    )
    .await;
    let (status, _) = request(
        &app,
        Method::POST,
        "/sessions/cli-sess-77/handoff",
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // send-next pops FIFO and runs the fixture Agent to completion.
    let (status, body) = request(
        &app,
        Method::POST,
        "/sessions/cli-sess-77/queue/send-next",
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["success"], true);

    let (_, body) = request(&app, Method::GET, "/sessions/cli-sess-77/queue", true, None).await;
    assert_eq!(body["count"], 0);

    // The Agent-assigned session id is remembered for the project.
    let (_, body) = request(
        &app,
        Method::GET,
        &format!("/tasks/{}/session", encode_path(&project)),
        true,
        None,
    )
    .await;
    assert_eq!(body["session_id"], "agent-sess-7");

    // Clearing the mapping starts fresh.
    let (_, body) = request(
        &app,
        Method::DELETE,
        &format!("/tasks/{}/session", encode_path(&project)),
        true,
        None,
    )
    .await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn allowlist_crud_and_check() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    let (status, body) = request(
        &app,
        Method::POST,
        "/allowlist",
        true,
        Some(json!({
            "tool_name": "Execute",
            "pattern": "npm *",
            "rule_type": "allow",
            "scope": "global",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rule_id = body["rule"]["id"].as_i64().unwrap();

    let (_, body) = request(&app, Method::GET, "/allowlist", true, None).await;
    assert_eq!(body["rules"].as_array().unwrap().len(), 1);

    let check = |input: &'static str| {
        let app = app.clone();
        async move {
            let encoded: String = input
                .bytes()
                .map(|b| format!("%{b:02X}"))
                .collect();
            let (_, body) = request(
                &app,
                Method::GET,
                &format!("/hooks/allowlist/check?tool_name=Execute&tool_input={encoded}"),
                true,
                None,
            )
            .await;
            body
        }
    };

    let body = check(r#"{"command":"npm test"}"#).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["decision"], "allow");

    let body = check(r#"{"command":"npmx test"}"#).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["decision"], "ask");

    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/allowlist/{rule_id}"),
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/allowlist/{rule_id}"),
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn directory_browser_is_disabled_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);
    let (status, _) = request(&app, Method::GET, "/filesystem/browse?path=/tmp", true, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn image_upload_and_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "sess-img-1", "project_dir": "/p"})),
    )
    .await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/upload-image",
        true,
        Some(json!({
            "session_id": "sess-img-1",
            "data": "data:image/png;base64,aGVsbG8td29ybGQ=",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let public_id = body["public_id"].as_str().unwrap().to_string();
    assert!(body["url"].as_str().unwrap().starts_with("/uploads/"));
    assert!(dir.path().join(&public_id).exists());

    let (status, _) = request(
        &app,
        Method::POST,
        "/delete-image",
        true,
        Some(json!({"public_id": public_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!dir.path().join(&public_id).exists());
}

#[tokio::test]
async fn illegal_handoff_is_rejected_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state("agent", dir.path()).await);

    request(
        &app,
        Method::POST,
        "/hooks/sessions/register",
        true,
        Some(json!({"session_id": "sess-ctrl-1", "project_dir": "/p"})),
    )
    .await;

    // Release before any handoff: refused.
    let (status, _) = request(
        &app,
        Method::POST,
        "/sessions/sess-ctrl-1/release",
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = request(&app, Method::GET, "/sessions/sess-ctrl-1", true, None).await;
    assert_eq!(body["control_state"], "cli_active");
}
