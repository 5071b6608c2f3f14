// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bridge-level settings for the UI.
//!
//! The environment is the configuration source of truth, so edits here only
//! update the process environment and flip the restart-required flag — the
//! running subsystems keep their boot-time values. Secrets are write-only:
//! never echoed back.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Env fields the UI may change. Everything else is read-only here.
const WRITABLE_VARS: &[&str] = &[
    "DEFAULT_TIMEOUT",
    "PERMISSION_TIMEOUT",
    "NOTIFY_TIMEOUT",
    "WEB_UI_URL",
    "ENABLE_DIRECTORY_BROWSER",
    "PROJECT_DIRS",
    "LOG_LEVEL",
    "AGENT_BIN",
];

pub async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let c = &state.config;
    Ok(Json(json!({
        "host": c.host,
        "port": c.port,
        "default_timeout": c.default_timeout,
        "permission_timeout": c.permission_timeout,
        "notify_timeout": c.notify_timeout,
        "web_ui_url": c.web_ui_url,
        "enable_directory_browser": c.enable_directory_browser,
        "project_dirs": c.project_dirs,
        "log_level": c.log_level,
        "agent_bin": c.agent_bin,
        "telegram_configured": c.telegram_bot_token.is_some(),
        "restart_required": tether_config::is_dirty(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct PutSettingsRequest {
    pub updates: Map<String, Value>,
}

pub async fn put_settings(
    State(_state): State<AppState>,
    Json(body): Json<PutSettingsRequest>,
) -> ApiResult<Json<Value>> {
    let mut applied = Vec::new();
    for (key, value) in &body.updates {
        let key = key.to_uppercase();
        if !WRITABLE_VARS.contains(&key.as_str()) {
            return Err(ApiError::bad_request(format!("{key} is not writable")));
        }
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(ApiError::bad_request(format!("{key} has an invalid value"))),
        };
        std::env::set_var(&key, value);
        applied.push(key);
    }
    if !applied.is_empty() {
        tether_config::mark_dirty();
    }
    Ok(Json(json!({
        "success": true,
        "applied": applied,
        "restart_required": tether_config::is_dirty(),
    })))
}
