// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-session execution settings (model, reasoning effort, autonomy level),
//! one-to-one with sessions.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct SessionSettingsRow {
    pub session_id: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub autonomy_level: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSettingsRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get("session_id")?,
            model: row.get("model")?,
            reasoning_effort: row.get("reasoning_effort")?,
            autonomy_level: row.get("autonomy_level")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const COLS: &str = "session_id, model, reasoning_effort, autonomy_level, updated_at";

impl Store {
    pub async fn get_settings(&self, session_id: &str) -> Result<Option<SessionSettingsRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM session_settings WHERE session_id = ?1"),
                params![session_id],
                SessionSettingsRow::from_row,
            )
            .optional()
        })
        .await
    }

    /// Partial upsert: `None` fields keep their stored value.
    pub async fn upsert_settings(
        &self,
        session_id: &str,
        model: Option<String>,
        reasoning_effort: Option<String>,
        autonomy_level: Option<String>,
    ) -> Result<SessionSettingsRow> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO session_settings (session_id, model, reasoning_effort, autonomy_level, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE SET
                     model            = COALESCE(excluded.model, model),
                     reasoning_effort = COALESCE(excluded.reasoning_effort, reasoning_effort),
                     autonomy_level   = COALESCE(excluded.autonomy_level, autonomy_level),
                     updated_at       = excluded.updated_at",
                params![session_id, model, reasoning_effort, autonomy_level, Utc::now()],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM session_settings WHERE session_id = ?1"),
                params![session_id],
                SessionSettingsRow::from_row,
            )
        })
        .await
    }
}
