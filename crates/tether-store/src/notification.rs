// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persisted notification badges. Surfaces that were offline catch up from
//! here on reconnect; delivery itself is best-effort.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRow {
    pub id: i64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            kind: row.get("type")?,
            title: row.get("title")?,
            message: row.get("message")?,
            read: row.get("read")?,
            created_at: row.get("created_at")?,
        })
    }
}

const COLS: &str = "id, session_id, type, title, message, read, created_at";

impl Store {
    pub async fn add_notification(
        &self,
        session_id: &str,
        kind: String,
        title: String,
        message: String,
    ) -> Result<NotificationRow> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO notifications (session_id, type, title, message, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![session_id, kind, title, message, Utc::now()],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {COLS} FROM notifications WHERE id = ?1"),
                params![id],
                NotificationRow::from_row,
            )
        })
        .await
    }

    pub async fn list_notifications(&self, unread_only: bool, limit: i64) -> Result<Vec<NotificationRow>> {
        self.run(move |conn| {
            let sql = if unread_only {
                format!(
                    "SELECT {COLS} FROM notifications WHERE read = 0
                     ORDER BY created_at DESC, id DESC LIMIT ?1"
                )
            } else {
                format!("SELECT {COLS} FROM notifications ORDER BY created_at DESC, id DESC LIMIT ?1")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], NotificationRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn mark_notifications_read(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE notifications SET read = 1 WHERE session_id = ?1 AND read = 0",
                params![session_id],
            )?;
            Ok(n)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unread_filter_and_mark_read() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
            .add_notification("s1", "permission".into(), "p".into(), "allow?".into())
            .await
            .unwrap();
        store
            .add_notification("s1", "info".into(), "i".into(), "done".into())
            .await
            .unwrap();

        assert_eq!(store.list_notifications(true, 10).await.unwrap().len(), 2);
        assert_eq!(store.mark_notifications_read("s1").await.unwrap(), 2);
        assert_eq!(store.list_notifications(true, 10).await.unwrap().len(), 0);
        assert_eq!(store.list_notifications(false, 10).await.unwrap().len(), 2);
    }
}
