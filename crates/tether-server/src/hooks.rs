// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The `/hooks/*` surface — consumed by the Agent's lifecycle scripts.
//!
//! These endpoints are the Agent half of the rendezvous: `notify` creates
//! the pending request and fans it out to the surfaces; `wait` suspends the
//! hook's HTTP request on the rendezvous queue; `respond` is the rare hook
//! that answers on another session's behalf. Everything here authenticates
//! with the shared secret only.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use tether_core::{
    BridgeEvent, Button, Decision, MessageSource, NotificationType, PendingRequest, SessionStatus,
    WaitResult,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub session_id: String,
    pub project_dir: String,
    pub session_name: Option<String>,
    pub transcript_path: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .register(
            &body.session_id,
            &body.project_dir,
            body.session_name,
            body.transcript_path,
        )
        .await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub status: Option<SessionStatus>,
    pub pending_request: Option<PendingRequest>,
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateSessionRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    if let Some(req) = body.pending_request {
        state.registry.set_pending_request(&session.id, Some(req)).await?;
    }
    let session = match body.status {
        Some(status) => {
            if status != SessionStatus::Running {
                // The CLI is no longer chewing on a prompt.
                state.notifier.emit(BridgeEvent::CliThinkingDone {
                    session_id: session.id.clone(),
                });
            }
            state
                .registry
                .update_status(&session.id, status)
                .await?
                .ok_or_else(|| ApiError::not_found("Session not found"))?
        }
        None => session,
    };
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub session_name: String,
    pub message: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: NotificationType,
    #[serde(default)]
    pub buttons: Vec<Button>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
}

fn default_kind() -> NotificationType {
    NotificationType::Info
}

/// A hook has something to say. Creates the pending request (when action is
/// needed), pushes to the bot and the socket, and returns the `request_id`
/// the hook will block on.
pub async fn notify(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<NotifyRequest>,
) -> ApiResult<Json<Value>> {
    // Auto-register: the notify may race the session-start hook.
    let session = match state.registry.get(&session_id).await? {
        Some(session) => session,
        None => {
            state
                .registry
                .register(&session_id, "", Some(body.session_name.clone()), None)
                .await?
        }
    };

    let request_id = Uuid::new_v4().to_string();
    let needs_action = body.kind == NotificationType::Permission || !body.buttons.is_empty();

    let mut pending = PendingRequest {
        id: request_id.clone(),
        kind: body.kind,
        message: body.message.clone(),
        tool_name: body.tool_name.clone(),
        tool_input: body.tool_input.clone(),
        buttons: body.buttons.clone(),
        created_at: chrono::Utc::now(),
        external_message_id: None,
    };

    if needs_action {
        state
            .registry
            .set_pending_request(&session.id, Some(pending.clone()))
            .await?;
    } else {
        // A plain notification supersedes any stale actionable prompt.
        state.registry.set_pending_request(&session.id, None).await?;
    }

    // The Stop hook firing is what moves cli_active → cli_waiting.
    if body.kind == NotificationType::Stop {
        state.registry.set_cli_waiting(&session.id).await?;
        state.notifier.emit(BridgeEvent::CliThinkingDone {
            session_id: session.id.clone(),
        });
    }

    if let Some(bot) = &state.bot {
        if let Some(message_id) = bot
            .send_notification(
                &session.id,
                &body.session_name,
                &body.message,
                body.kind,
                body.buttons.clone(),
            )
            .await
        {
            pending.external_message_id = Some(message_id);
            if needs_action {
                state
                    .registry
                    .set_pending_external_id(&session.id, message_id)
                    .await?;
            }
        }
    }

    state
        .store
        .add_notification(
            &session.id,
            body.kind.as_str().to_string(),
            body.session_name.clone(),
            body.message.clone(),
        )
        .await?;

    state.notifier.emit(BridgeEvent::Notification {
        session_id: session.id.clone(),
        session_name: body.session_name,
        message: body.message,
        kind: body.kind,
        request_id: needs_action.then(|| request_id.clone()),
    });

    Ok(Json(json!({ "success": true, "request_id": request_id })))
}

#[derive(Debug, Deserialize)]
pub struct WaitRequest {
    pub request_id: String,
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

fn default_wait_timeout() -> u64 {
    300
}

/// The canonical blocking point: suspends this HTTP request until a human
/// answers, the timeout elapses, or the wait is cancelled.
pub async fn wait(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<WaitRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    state
        .registry
        .update_status(&session.id, SessionStatus::Waiting)
        .await?;

    let outcome = state
        .rendezvous
        .wait_for_response(&session.id, &body.request_id, Duration::from_secs(body.timeout))
        .await;

    match outcome {
        WaitResult::Response(response) => {
            state.registry.set_pending_request(&session.id, None).await?;
            Ok(Json(json!({
                "response": response,
                "timeout": false,
                "has_response": true,
            })))
        }
        WaitResult::Timeout => {
            // The hook fails closed; the audit trail records why.
            info!(session_id = %session.id, request_id = %body.request_id, "wait timed out");
            let _ = state.engine.record_timeout(&body.request_id).await;
            state.registry.set_pending_request(&session.id, None).await?;
            Ok(Json(json!({ "timeout": true, "has_response": false })))
        }
        WaitResult::Cancelled => Ok(Json(json!({
            "timeout": false,
            "has_response": false,
            "cancelled": true,
        }))),
    }
}

/// Non-blocking variant: only ever consumes a parked response.
pub async fn get_response(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match state.rendezvous.take_parked(&session_id, &request_id) {
        Some(response) => Ok(Json(json!({ "response": response, "has_response": true }))),
        None => Ok(Json(json!({ "has_response": false }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub request_id: Option<String>,
    pub response: String,
}

pub async fn respond(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<RespondRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    state
        .rendezvous
        .deliver_response(&session.id, body.request_id.as_deref(), body.response);
    state
        .registry
        .update_status(&session.id, SessionStatus::Running)
        .await?;

    state.notifier.emit(BridgeEvent::ResponseDelivered {
        session_id: session.id,
        request_id: body.request_id,
    });
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct CliThinkingRequest {
    pub prompt: String,
}

/// The operator typed a prompt into the CLI: persist it for the chat view
/// and light the spinner on the web UI.
pub async fn cli_thinking(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<CliThinkingRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    state
        .store
        .add_chat_message(
            &session.id,
            "user".to_string(),
            body.prompt.clone(),
            None,
            None,
            None,
            MessageSource::Cli.as_str().to_string(),
            None,
        )
        .await?;
    state
        .registry
        .update_status(&session.id, SessionStatus::Running)
        .await?;

    state.notifier.emit(BridgeEvent::CliThinking {
        session_id: session.id.clone(),
        prompt: body.prompt,
    });
    state.notifier.emit(BridgeEvent::ChatUpdated {
        session_id: session.id,
    });
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct AllowlistCheckQuery {
    pub tool_name: String,
    /// URL-encoded JSON blob of the tool input.
    pub tool_input: Option<String>,
    pub session_id: Option<String>,
}

/// Pre-flight rule check for the PreToolUse hook. `allow` and `deny` skip
/// the human entirely; `ask` sends the hook into the notify/wait flow.
pub async fn allowlist_check(
    State(state): State<AppState>,
    Query(query): Query<AllowlistCheckQuery>,
) -> ApiResult<Json<Value>> {
    let tool_input: Value = query
        .tool_input
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null);
    let session_id = query.session_id.unwrap_or_default();

    let decision = state
        .engine
        .check(&session_id, &query.tool_name, &tool_input)
        .await?;

    Ok(Json(json!({
        "allowed": decision == Decision::Allow,
        "decision": decision,
    })))
}
