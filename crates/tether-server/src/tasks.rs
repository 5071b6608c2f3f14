// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Task execution routes. `POST /tasks/execute` returns immediately with a
//! pending task id; the result arrives on the socket as `task_completed`.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use tether_core::{ControlState, MessageSource, SessionStatus, TaskStatus};
use tether_exec::TaskRequest;
use tether_store::TaskFilter;

use crate::error::{ApiError, ApiResult};
use crate::sessions::task_request_for_session;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub project_dir: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub autonomy_level: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    /// Uploaded image URLs referenced as `@1`, `@2` in the prompt.
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub source: Option<MessageSource>,
}

pub async fn execute(
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> ApiResult<Json<Value>> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt must not be empty"));
    }
    let task_id = body.task_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let source = body.source.unwrap_or(MessageSource::Api);

    // An explicit session decides the routing: queue while the CLI drives,
    // refuse unless remote holds it, continue the Agent session otherwise.
    if let Some(ref selector) = body.session_id {
        if let Some(session) = state.registry.get(selector).await? {
            if state.registry.should_queue_message(&session.id).await? {
                state
                    .registry
                    .queue_message(&session.id, body.prompt, source.as_str().to_string())
                    .await?;
                info!(session_id = %session.id, "prompt queued (CLI holds control)");
                return Ok(Json(json!({
                    "task_id": task_id,
                    "session_id": session.id,
                    "status": "queued",
                })));
            }
            if session.control_state != ControlState::RemoteActive {
                return Err(ApiError::conflict(format!(
                    "Session is {}; hand off control first",
                    session.control_state
                )));
            }

            let mut request =
                task_request_for_session(&state, &session, body.prompt, source).await?;
            request.task_id = Some(task_id.clone());
            request.streaming = body.streaming;
            if body.model.is_some() {
                request.model = body.model;
            }
            if body.reasoning_effort.is_some() {
                request.reasoning_effort = body.reasoning_effort;
            }
            if body.autonomy_level.is_some() {
                request.autonomy_level = body.autonomy_level;
            }
            append_images(&mut request, body.images);
            let task_id = state.executor.spawn(request);
            return Ok(Json(json!({
                "task_id": task_id,
                "session_id": session.id,
                "status": TaskStatus::Pending,
            })));
        }
    }

    // No (known) session: a fresh headless run. The continuation map may
    // still resume the project's previous conversation — unless a live CLI
    // session owns that directory.
    if let Some(session) = state.registry.get_by_project_dir(&body.project_dir).await? {
        if matches!(session.status, SessionStatus::Running | SessionStatus::Waiting)
            && matches!(
                session.control_state,
                ControlState::CliActive | ControlState::CliWaiting
            )
        {
            return Err(ApiError::conflict(
                "A CLI session is active in this project directory",
            ));
        }
    }

    let mut request = TaskRequest {
        task_id: Some(task_id.clone()),
        session_id: None,
        model: body.model,
        reasoning_effort: body.reasoning_effort,
        autonomy_level: body.autonomy_level.or_else(|| Some("high".to_string())),
        source: source.as_str().to_string(),
        streaming: body.streaming,
        ..TaskRequest::new(body.prompt, body.project_dir)
    };
    append_images(&mut request, body.images);

    let task_id = state.executor.spawn(request);
    Ok(Json(json!({
        "task_id": task_id,
        "session_id": null,
        "status": TaskStatus::Pending,
    })))
}

fn append_images(request: &mut TaskRequest, images: Option<Vec<String>>) {
    if let Some(images) = images {
        for (i, url) in images.iter().enumerate() {
            request.prompt.push_str(&format!("\n\nImage @{}: {url}", i + 1));
        }
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.executor.cancel_task(&task_id) {
        return Err(ApiError::not_found("Task not found or not running"));
    }
    Ok(Json(json!({ "success": true, "message": "Task cancelled" })))
}

// ── Continuation map ──────────────────────────────────────────────────────────

pub async fn get_project_session(
    State(state): State<AppState>,
    Path(project_dir): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({
        "session_id": state.executor.get_session_id(&project_dir),
    })))
}

pub async fn clear_project_session(
    State(state): State<AppState>,
    Path(project_dir): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({
        "success": state.executor.clear_session(&project_dir),
    })))
}

// ── History ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub session_id: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub success_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = state
        .store
        .task_history(TaskFilter {
            session_id: query.session_id,
            source: query.source,
            success_only: query.success_only,
            limit: query.limit,
        })
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    #[serde(default = "default_failed_limit")]
    pub limit: i64,
}

fn default_failed_limit() -> i64 {
    20
}

pub async fn failed(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = state.store.failed_tasks(query.limit).await?;
    Ok(Json(json!({ "tasks": tasks })))
}
