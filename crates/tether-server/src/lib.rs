// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP and realtime-socket surfaces.
//!
//! Two route groups share one listener:
//!
//! - `/hooks/*` — consumed by the Agent's lifecycle scripts. Shared-secret
//!   auth, always.
//! - everything else — the UI surface. Bearer token or shared secret, with
//!   a literal public-prefix bypass (`/health`, `/auth/login`, `/ws`,
//!   `/uploads`, `/`).
//!
//! Handlers translate core results into status codes; they hold no state of
//! their own beyond [`state::AppState`].

pub mod allowlist;
pub mod auth;
pub mod error;
pub mod hooks;
pub mod sessions;
pub mod settings;
pub mod state;
pub mod tasks;
pub mod uploads;
pub mod ws;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::{delete, get, patch, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tracing::info;

pub use state::AppState;

/// Request bodies are small JSON except image uploads; 16 MiB covers both.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

async fn health(State(state): State<AppState>) -> Json<Value> {
    let active = state
        .registry
        .get_active()
        .await
        .map(|s| s.len())
        .unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "active_sessions": active,
        "bot_connected": state.bot.as_ref().is_some_and(|b| b.is_connected()),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn root() -> Json<Value> {
    Json(json!({ "name": "tether", "version": env!("CARGO_PKG_VERSION") }))
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let hook_routes = Router::new()
        .route("/sessions/register", post(hooks::register))
        .route("/sessions/:id", patch(hooks::update_session))
        .route("/sessions/:id/notify", post(hooks::notify))
        .route("/sessions/:id/wait", post(hooks::wait))
        .route("/sessions/:id/response/:request_id", get(hooks::get_response))
        .route("/sessions/:id/respond", post(hooks::respond))
        .route("/sessions/:id/cli-thinking", post(hooks::cli_thinking))
        .route("/allowlist/check", get(hooks::allowlist_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_secret,
        ));

    let ui_routes = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/login", post(auth::login))
        .route("/auth/verify", get(auth::verify))
        .route("/auth/refresh", post(auth::refresh))
        .route("/sessions", get(sessions::list_sessions))
        .route(
            "/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/sessions/:id/rename", patch(sessions::rename_session))
        .route(
            "/sessions/:id/queue",
            get(sessions::get_queue)
                .post(sessions::add_to_queue)
                .delete(sessions::clear_queue),
        )
        .route("/sessions/:id/queue/send-next", post(sessions::send_next_queued))
        .route("/sessions/:id/queue/process", post(sessions::process_queue))
        .route(
            "/sessions/:id/queue/:message_id",
            delete(sessions::cancel_queued_message),
        )
        .route("/sessions/:id/handoff", post(sessions::handoff))
        .route("/sessions/:id/release", post(sessions::release))
        .route(
            "/sessions/:id/chat",
            get(sessions::get_chat)
                .post(sessions::add_chat)
                .delete(sessions::clear_chat),
        )
        .route(
            "/sessions/:id/settings",
            get(sessions::get_settings).put(sessions::put_settings),
        )
        .route("/sessions/:id/permissions", get(sessions::get_permissions))
        .route(
            "/sessions/:id/permissions/:request_id/resolve",
            post(sessions::resolve_permission),
        )
        .route("/sessions/:id/events", get(sessions::get_events))
        .route("/sessions/:id/timeline", get(sessions::get_timeline))
        .route("/tasks", get(tasks::history))
        .route("/tasks/execute", post(tasks::execute))
        .route("/tasks/failed", get(tasks::failed))
        .route("/tasks/:key/cancel", post(tasks::cancel))
        .route(
            "/tasks/:key/session",
            get(tasks::get_project_session).delete(tasks::clear_project_session),
        )
        .route(
            "/allowlist",
            get(allowlist::list_rules).post(allowlist::add_rule),
        )
        .route("/allowlist/:rule_id", delete(allowlist::delete_rule))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::put_settings),
        )
        .route("/upload-image", post(uploads::upload_image))
        .route("/delete-image", post(uploads::delete_image))
        .route("/filesystem/browse", get(uploads::browse))
        .route("/ws", get(ws::ws_handler))
        .nest_service("/uploads", ServeDir::new(&state.config.upload_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let cors = match state.config.web_ui_url.as_deref() {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => CorsLayer::permissive(),
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .nest("/hooks", hook_routes)
        .merge(ui_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.bind_addr();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "bridge listening");
    axum::serve(listener, app).await?;
    Ok(())
}
