// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Chat history — the persisted conversation the web UI renders.
//! Append-only; paginated newest-first.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRow {
    pub id: i64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: String,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub source: String,
    pub images: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let images: Option<String> = row.get("images")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            msg_type: row.get("type")?,
            content: row.get("content")?,
            status: row.get("status")?,
            duration_ms: row.get("duration_ms")?,
            num_turns: row.get("num_turns")?,
            source: row.get("source")?,
            images: images.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at")?,
        })
    }
}

const COLS: &str = "id, session_id, type, content, status, duration_ms, num_turns, source, images, created_at";

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn add_chat_message(
        &self,
        session_id: &str,
        msg_type: String,
        content: String,
        status: Option<String>,
        duration_ms: Option<i64>,
        num_turns: Option<i64>,
        source: String,
        images: Option<Vec<String>>,
    ) -> Result<ChatMessageRow> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO chat_messages
                 (session_id, type, content, status, duration_ms, num_turns, source, images, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session_id,
                    msg_type,
                    content,
                    status,
                    duration_ms,
                    num_turns,
                    source,
                    images.map(|v| serde_json::to_string(&v).unwrap_or_default()),
                    Utc::now()
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {COLS} FROM chat_messages WHERE id = ?1"),
                params![id],
                ChatMessageRow::from_row,
            )
        })
        .await
    }

    /// Newest-first page of chat history.
    pub async fn chat_history(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessageRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM chat_messages
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![session_id, limit, offset], ChatMessageRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn clear_chat(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "DELETE FROM chat_messages WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(n)
        })
        .await
    }
}
