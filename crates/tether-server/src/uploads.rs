// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Image uploads and the directory browser.
//!
//! Uploads land on local disk under `UPLOAD_DIR`, are served back at
//! `/uploads/<public_id>`, and leave a `session_images` row so session
//! deletion can clean the asset files up.
//!
//! The directory browser exists so the web UI can pick a project directory
//! for task execution. It lists directories only, is disabled by default
//! (`ENABLE_DIRECTORY_BROWSER`), and — when `PROJECT_DIRS` is set — refuses
//! anything outside those roots.

use std::path::{Component, Path, PathBuf};

use axum::extract::{Query, State};
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub session_id: String,
    /// Base64 payload, with or without a `data:image/...;base64,` prefix.
    pub data: String,
    pub filename: Option<String>,
}

pub async fn upload_image(
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .registry
        .get(&body.session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    let (payload, ext_from_mime) = match body.data.split_once(";base64,") {
        Some((header, payload)) => {
            let ext = header
                .strip_prefix("data:image/")
                .map(|mime| match mime {
                    "jpeg" => "jpg",
                    other => other,
                })
                .map(str::to_string);
            (payload, ext)
        }
        None => (body.data.as_str(), None),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|_| ApiError::bad_request("data is not valid base64"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("empty image payload"));
    }

    let ext = ext_from_mime
        .or_else(|| {
            body.filename
                .as_deref()
                .and_then(|f| Path::new(f).extension())
                .map(|e| e.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "png".to_string());
    let public_id = format!("{}.{}", Uuid::new_v4(), ext);

    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(|e| ApiError::internal(format!("cannot create upload dir: {e}")))?;
    let path = state.config.upload_dir.join(&public_id);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::internal(format!("cannot write image: {e}")))?;

    let url = format!("/uploads/{public_id}");
    let image = state.store.add_image(&session.id, public_id, url).await?;
    Ok(Json(json!({
        "success": true,
        "public_id": image.public_id,
        "url": image.url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteImageRequest {
    pub public_id: String,
}

pub async fn delete_image(
    State(state): State<AppState>,
    Json(body): Json<DeleteImageRequest>,
) -> ApiResult<Json<Value>> {
    let Some(image) = state.store.delete_image(&body.public_id).await? else {
        return Err(ApiError::not_found("Image not found"));
    };
    let path = state.config.upload_dir.join(&image.public_id);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(public_id = %image.public_id, "failed to remove image asset: {e}");
    }
    Ok(Json(json!({ "success": true })))
}

// ── Directory browser ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    pub path: Option<String>,
}

pub async fn browse(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> ApiResult<Json<Value>> {
    if !state.config.enable_directory_browser {
        return Err(ApiError::forbidden("Directory browser is disabled"));
    }

    let roots = &state.config.project_dirs;
    let path = match query.path.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => PathBuf::from(p),
        None => {
            // No path: offer the configured roots.
            let entries: Vec<Value> = roots
                .iter()
                .map(|r| json!({ "name": r.display().to_string(), "path": r.display().to_string() }))
                .collect();
            return Ok(Json(json!({ "path": "", "directories": entries })));
        }
    };

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ApiError::bad_request("Path must not contain '..'"));
    }
    if !roots.is_empty() && !roots.iter().any(|root| path.starts_with(root)) {
        return Err(ApiError::forbidden("Path is outside the allowed roots"));
    }

    let mut read_dir = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| ApiError::bad_request(format!("cannot read {}: {e}", path.display())))?;
    let mut directories = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        directories.push(json!({
            "name": name,
            "path": entry.path().display().to_string(),
        }));
    }
    directories.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Ok(Json(json!({
        "path": path.display().to_string(),
        "directories": directories,
    })))
}
