// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Permission-rule management for the UI.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tether_core::{RuleScope, RuleType};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let rules = state.store.list_rules().await?;
    Ok(Json(json!({ "rules": rules })))
}

#[derive(Debug, Deserialize)]
pub struct AddRuleRequest {
    pub tool_name: String,
    pub pattern: String,
    pub rule_type: RuleType,
    pub scope: RuleScope,
    pub session_id: Option<String>,
}

pub async fn add_rule(
    State(state): State<AppState>,
    Json(body): Json<AddRuleRequest>,
) -> ApiResult<Json<Value>> {
    if body.tool_name.trim().is_empty() || body.pattern.trim().is_empty() {
        return Err(ApiError::bad_request("tool_name and pattern are required"));
    }
    let session_id = match body.scope {
        RuleScope::Session => {
            let selector = body
                .session_id
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("session scope requires session_id"))?;
            let session = state
                .registry
                .get(selector)
                .await?
                .ok_or_else(|| ApiError::not_found("Session not found"))?;
            Some(session.id)
        }
        RuleScope::Global => None,
    };

    let rule = state
        .store
        .add_rule(
            body.tool_name,
            body.pattern,
            body.rule_type.as_str().to_string(),
            body.scope.as_str().to_string(),
            session_id,
        )
        .await?;
    Ok(Json(json!({ "success": true, "rule": rule })))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_rule(rule_id).await? {
        return Err(ApiError::not_found("Rule not found"));
    }
    Ok(Json(json!({ "success": true })))
}
