// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Realtime socket — JSON frames over WebSocket.
//!
//! On connect the server immediately pushes a `sessions_update` with the
//! current list, then bridges the broadcast event stream to the socket.
//! Client frames are small commands (`respond`, `approve`, `deny`,
//! `subscribe`); their fields are camelCase because the browser sends them.
//!
//! Authentication happens before the upgrade: a `?token=` query parameter
//! (browsers cannot set headers on WebSocket connects), a bearer header, or
//! the shared secret. Subscription frames are accepted for protocol
//! compatibility; events are fanned out to every client and filtered
//! client-side, exactly like the session list.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tether_core::{BridgeEvent, DecidedBy, RuleScope, SessionStatus};

use crate::auth::{authenticate, verify_token};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token_ok = query
        .token
        .as_deref()
        .is_some_and(|t| verify_token(t, &state.config.jwt_secret).is_some());
    if !token_ok && authenticate(&headers, &state).is_none() {
        warn!("socket upgrade refused: no valid credentials");
        return ApiError::unauthorized("Not authenticated").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Client → server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Subscribe { session_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { session_id: String },
    #[serde(rename_all = "camelCase")]
    Respond {
        session_id: String,
        request_id: Option<String>,
        response: String,
    },
    #[serde(rename_all = "camelCase")]
    Approve {
        session_id: String,
        request_id: Option<String>,
        scope: Option<RuleScope>,
    },
    #[serde(rename_all = "camelCase")]
    Deny {
        session_id: String,
        request_id: Option<String>,
        scope: Option<RuleScope>,
    },
    GetSessions,
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("socket client connected");
    let mut events = state.notifier.subscribe();

    // Catch the client up before anything else happens.
    if let Ok(sessions) = state.registry.session_views().await {
        send_event(&mut socket, &BridgeEvent::SessionsUpdate { sessions }).await;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => handle_client_event(event, &state).await,
                            Err(e) => debug!("ignoring malformed client frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("socket recv error: {e}");
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(event) => send_event(&mut socket, &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events are fine — push a fresh list so the
                        // client reconverges on the database state.
                        warn!("socket client lagged by {n} events");
                        if let Ok(sessions) = state.registry.session_views().await {
                            send_event(&mut socket, &BridgeEvent::SessionsUpdate { sessions }).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("socket client disconnected");
}

async fn handle_client_event(event: ClientEvent, state: &AppState) {
    match event {
        ClientEvent::Subscribe { session_id } | ClientEvent::Unsubscribe { session_id } => {
            // Events are broadcast to all clients; nothing to track here.
            debug!(session_id, "subscription frame acknowledged");
        }
        ClientEvent::GetSessions => {
            state.registry.emit_sessions_update().await;
        }
        ClientEvent::Respond {
            session_id,
            request_id,
            response,
        } => {
            let Ok(Some(session)) = state.registry.get(&session_id).await else {
                warn!(session_id, "respond for unknown session");
                return;
            };
            let request_id = request_id.or_else(|| {
                session.pending_request.as_ref().map(|p| p.id.clone())
            });
            state
                .rendezvous
                .deliver_response(&session.id, request_id.as_deref(), response);
            let _ = state.registry.set_pending_request(&session.id, None).await;
            let _ = state
                .registry
                .update_status(&session.id, SessionStatus::Running)
                .await;
            state.notifier.emit(BridgeEvent::ResponseDelivered {
                session_id: session.id,
                request_id,
            });
        }
        ClientEvent::Approve {
            session_id,
            request_id,
            scope,
        } => {
            resolve(state, &session_id, request_id, true, scope).await;
        }
        ClientEvent::Deny {
            session_id,
            request_id,
            scope,
        } => {
            resolve(state, &session_id, request_id, false, scope).await;
        }
    }
}

async fn resolve(
    state: &AppState,
    session_id: &str,
    request_id: Option<String>,
    approved: bool,
    scope: Option<RuleScope>,
) {
    let Ok(Some(session)) = state.registry.get(session_id).await else {
        warn!(session_id, "permission action for unknown session");
        return;
    };
    let request_id = match request_id.or_else(|| session.pending_request.map(|p| p.id)) {
        Some(id) => id,
        None => {
            warn!(session_id, "permission action with no pending request");
            return;
        }
    };
    if let Err(e) = state
        .engine
        .resolve(&session.id, &request_id, approved, scope, DecidedBy::Web)
        .await
    {
        warn!(session_id, "permission resolution failed: {e}");
    }
}

async fn send_event(socket: &mut WebSocket, event: &BridgeEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_with_camel_case_fields() {
        let frame = r#"{"type": "respond", "sessionId": "s1", "requestId": "r1", "response": "go"}"#;
        match serde_json::from_str::<ClientEvent>(frame).unwrap() {
            ClientEvent::Respond {
                session_id,
                request_id,
                response,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(response, "go");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn approve_scope_is_optional() {
        let frame = r#"{"type": "approve", "sessionId": "s1"}"#;
        match serde_json::from_str::<ClientEvent>(frame).unwrap() {
            ClientEvent::Approve {
                request_id, scope, ..
            } => {
                assert!(request_id.is_none());
                assert!(scope.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let frame = r#"{"type": "approve", "sessionId": "s1", "scope": "global"}"#;
        match serde_json::from_str::<ClientEvent>(frame).unwrap() {
            ClientEvent::Approve { scope, .. } => assert_eq!(scope, Some(RuleScope::Global)),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
