// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! UI-facing session routes: listing, rename/delete, control-state
//! handoff/release, message queue, chat history, per-session settings,
//! permission history and the troubleshooting timeline.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use tether_core::{
    BridgeEvent, DecidedBy, MessageSource, RuleScope, Session, SessionView,
};
use tether_exec::TaskRequest;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

async fn require_session(state: &AppState, session_id: &str) -> ApiResult<Session> {
    state
        .registry
        .get(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionView>>> {
    Ok(Json(state.registry.session_views().await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(require_session(&state, &session_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<Json<Value>> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Name must not be empty"));
    }
    let session = require_session(&state, &session_id).await?;
    let session = state
        .registry
        .rename(&session.id, name)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

/// Delete a session and everything hanging off it: continuation mapping,
/// uploaded image assets, queued work, waits and parks.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;

    state.executor.clear_session(&session.project_dir);

    let images = state.store.images_for_session(&session.id).await?;
    if !state.registry.remove(&session.id).await? {
        return Err(ApiError::not_found("Session not found"));
    }
    for image in images {
        let path = state.config.upload_dir.join(&image.public_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(public_id = %image.public_id, "failed to remove image asset: {e}");
        }
    }
    Ok(Json(json!({ "success": true })))
}

// ── Control state ─────────────────────────────────────────────────────────────

pub async fn handoff(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    match state.registry.handoff_to_remote(&session.id).await? {
        Some(session) => Ok(Json(json!({ "success": true, "session": session }))),
        None => Err(ApiError::bad_request(format!(
            "Cannot hand off: session is {}",
            session.control_state
        ))),
    }
}

pub async fn release(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    match state.registry.release_to_cli(&session.id).await? {
        Some(session) => Ok(Json(json!({ "success": true, "session": session }))),
        None => Err(ApiError::bad_request(
            "Cannot release: session is not under remote control",
        )),
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

pub async fn get_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let messages = state.registry.get_queued_messages(&session.id).await?;
    Ok(Json(json!({
        "session_id": session.id,
        "count": messages.len(),
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub content: String,
    #[serde(default)]
    pub source: Option<MessageSource>,
}

pub async fn add_to_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<EnqueueRequest>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let source = body.source.unwrap_or(MessageSource::Web);
    let message = state
        .registry
        .queue_message(&session.id, body.content, source.as_str().to_string())
        .await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

pub async fn clear_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let cleared = state.registry.clear_queue(&session.id).await?;
    Ok(Json(json!({ "success": true, "cleared_count": cleared })))
}

pub async fn cancel_queued_message(
    State(state): State<AppState>,
    Path((session_id, message_id)): Path<(String, i64)>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    if !state
        .registry
        .cancel_queued_message(&session.id, message_id)
        .await?
    {
        return Err(ApiError::not_found(
            "Message not found or already processed",
        ));
    }
    Ok(Json(json!({ "success": true })))
}

/// Pop and execute the single oldest queued message. Refused unless remote
/// holds the session.
pub async fn send_next_queued(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    if !state.registry.can_execute_remote_task(&session.id).await? {
        return Err(ApiError::bad_request(format!(
            "Session not under remote control (state: {})",
            session.control_state
        )));
    }

    let Some(message) = state.registry.get_next_queued_message(&session.id).await? else {
        return Ok(Json(json!({ "success": false, "message": "No messages in queue" })));
    };
    state
        .registry
        .mark_message_sent(&session.id, message.id)
        .await?;

    let request = task_request_for_session(&state, &session, message.content.clone(), MessageSource::Queue).await?;
    let outcome = state.executor.run(request).await;

    Ok(Json(json!({
        "success": true,
        "message": message,
        "result": {
            "task_id": outcome.task_id,
            "success": outcome.success,
            "result": outcome.result.chars().take(500).collect::<String>(),
        },
    })))
}

/// Drain the queue in FIFO order while remote control lasts. Returns
/// immediately; progress arrives as `task_*` / `queue_updated` events.
pub async fn process_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    if !state.registry.can_execute_remote_task(&session.id).await? {
        return Err(ApiError::bad_request(format!(
            "Session not under remote control (state: {})",
            session.control_state
        )));
    }

    let state2 = state.clone();
    let sid = session.id.clone();
    tokio::spawn(async move {
        loop {
            match state2.registry.can_execute_remote_task(&sid).await {
                Ok(true) => {}
                _ => break,
            }
            let message = match state2.registry.get_next_queued_message(&sid).await {
                Ok(Some(message)) => message,
                _ => break,
            };
            if state2
                .registry
                .mark_message_sent(&sid, message.id)
                .await
                .is_err()
            {
                break;
            }
            let session = match state2.registry.get(&sid).await {
                Ok(Some(session)) => session,
                _ => break,
            };
            match task_request_for_session(&state2, &session, message.content, MessageSource::Queue)
                .await
            {
                Ok(request) => {
                    let outcome = state2.executor.run(request).await;
                    if !outcome.success {
                        // A failing task stops the drain; the rest of the
                        // queue likely depends on it.
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(Json(json!({ "success": true })))
}

/// Build a task request honouring the session's stored settings.
pub async fn task_request_for_session(
    state: &AppState,
    session: &Session,
    prompt: String,
    source: MessageSource,
) -> ApiResult<TaskRequest> {
    let settings = state.store.get_settings(&session.id).await?;
    Ok(TaskRequest {
        task_id: None,
        prompt,
        project_dir: session.project_dir.clone(),
        // The registry id *is* the Agent session id; only resume sessions
        // the Agent still considers live.
        session_id: (session.status == tether_core::SessionStatus::Running
            || session.status == tether_core::SessionStatus::Waiting)
            .then(|| session.id.clone()),
        model: settings.as_ref().and_then(|s| s.model.clone()),
        reasoning_effort: settings.as_ref().and_then(|s| s.reasoning_effort.clone()),
        autonomy_level: settings
            .as_ref()
            .and_then(|s| s.autonomy_level.clone())
            .or_else(|| Some("high".to_string())),
        source: source.as_str().to_string(),
        streaming: false,
    })
}

// ── Chat ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default = "default_chat_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_chat_limit() -> i64 {
    100
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let messages = state
        .store
        .chat_history(&session.id, query.limit, query.offset)
        .await?;
    Ok(Json(json!({ "session_id": session.id, "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct AddChatRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: String,
    #[serde(default)]
    pub source: Option<MessageSource>,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub images: Option<Vec<String>>,
}

/// Append a chat message. A `user` message from a remote surface is also a
/// work submission: it queues while the CLI drives and runs as a task when
/// remote holds the session.
pub async fn add_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<AddChatRequest>,
) -> ApiResult<Json<Value>> {
    if body.msg_type != "user" && body.msg_type != "assistant" {
        return Err(ApiError::bad_request("type must be 'user' or 'assistant'"));
    }
    let session = require_session(&state, &session_id).await?;
    let source = body.source.unwrap_or(MessageSource::Web);

    let message = state
        .store
        .add_chat_message(
            &session.id,
            body.msg_type.clone(),
            body.content.clone(),
            body.status,
            body.duration_ms,
            body.num_turns,
            source.as_str().to_string(),
            body.images.clone(),
        )
        .await?;
    state.notifier.emit(BridgeEvent::ChatUpdated {
        session_id: session.id.clone(),
    });

    let mut routed = "stored";
    if body.msg_type == "user" && source != MessageSource::Cli {
        if state.registry.should_queue_message(&session.id).await? {
            state
                .registry
                .queue_message(&session.id, body.content, source.as_str().to_string())
                .await?;
            routed = "queued";
        } else if state.registry.can_execute_remote_task(&session.id).await? {
            let mut request =
                task_request_for_session(&state, &session, body.content, source).await?;
            if let Some(images) = body.images {
                for (i, url) in images.iter().enumerate() {
                    request.prompt.push_str(&format!("\n\nImage @{}: {url}", i + 1));
                }
            }
            state.executor.spawn(request);
            routed = "executing";
        }
    }
    if body.msg_type == "assistant" && source == MessageSource::Cli {
        // The CLI's answer landed; stop the spinner.
        state.notifier.emit(BridgeEvent::CliThinkingDone {
            session_id: session.id.clone(),
        });
    }

    Ok(Json(json!({ "success": true, "message": message, "routed": routed })))
}

pub async fn clear_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let deleted = state.store.clear_chat(&session.id).await?;
    state.notifier.emit(BridgeEvent::ChatUpdated {
        session_id: session.id,
    });
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

// ── Per-session settings ──────────────────────────────────────────────────────

pub async fn get_settings(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    match state.store.get_settings(&session.id).await? {
        Some(settings) => Ok(Json(serde_json::to_value(settings).unwrap_or_default())),
        None => Ok(Json(json!({
            "session_id": session.id,
            "model": null,
            "reasoning_effort": "medium",
            "autonomy_level": "high",
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PutSettingsRequest {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub autonomy_level: Option<String>,
}

pub async fn put_settings(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PutSettingsRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(level) = body.autonomy_level.as_deref() {
        if !matches!(level, "low" | "medium" | "high") {
            return Err(ApiError::bad_request(
                "autonomy_level must be low, medium or high",
            ));
        }
    }
    let session = require_session(&state, &session_id).await?;
    let settings = state
        .store
        .upsert_settings(
            &session.id,
            body.model,
            body.reasoning_effort,
            body.autonomy_level,
        )
        .await?;
    Ok(Json(json!({ "success": true, "settings": settings })))
}

// ── Permission history & resolution ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

pub async fn get_permissions(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let permissions = state
        .store
        .permission_history(Some(session.id.clone()), query.limit)
        .await?;
    Ok(Json(json!({ "session_id": session.id, "permissions": permissions })))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub decision: String,
    #[serde(default)]
    pub scope: Option<RuleScope>,
}

pub async fn resolve_permission(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
    Json(body): Json<ResolveRequest>,
) -> ApiResult<Json<Value>> {
    let approved = match body.decision.as_str() {
        "approved" => true,
        "denied" => false,
        _ => {
            return Err(ApiError::bad_request(
                "Decision must be 'approved' or 'denied'",
            ))
        }
    };
    let session = require_session(&state, &session_id).await?;
    let permission = state
        .engine
        .resolve(&session.id, &request_id, approved, body.scope, DecidedBy::Web)
        .await?
        .ok_or_else(|| ApiError::not_found("Permission request not found"))?;
    Ok(Json(json!({ "success": true, "permission": permission })))
}

// ── Events & timeline ─────────────────────────────────────────────────────────

pub async fn get_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let events = state.store.list_events(&session.id, query.limit).await?;
    Ok(Json(json!({ "session_id": session.id, "events": events })))
}

pub async fn get_timeline(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let session = require_session(&state, &session_id).await?;
    let timeline = state.store.timeline(&session.id, query.limit).await?;
    Ok(Json(json!({ "session_id": session.id, "timeline": timeline })))
}
