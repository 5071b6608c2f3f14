// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Queued messages — tasks buffered while the CLI holds a session.
//! FIFO within a session; rows transition pending → sent | cancelled.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessageRow {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub source: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl QueuedMessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            content: row.get("content")?,
            source: row.get("source")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            sent_at: row.get("sent_at")?,
        })
    }
}

const COLS: &str = "id, session_id, content, source, status, created_at, sent_at";

impl Store {
    pub async fn enqueue_message(
        &self,
        session_id: &str,
        content: String,
        source: String,
    ) -> Result<QueuedMessageRow> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO queued_messages (session_id, content, source, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![session_id, content, source, Utc::now()],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {COLS} FROM queued_messages WHERE id = ?1"),
                params![id],
                QueuedMessageRow::from_row,
            )
        })
        .await
    }

    pub async fn pending_messages(&self, session_id: &str) -> Result<Vec<QueuedMessageRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM queued_messages
                 WHERE session_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![session_id], QueuedMessageRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn next_pending_message(&self, session_id: &str) -> Result<Option<QueuedMessageRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLS} FROM queued_messages
                     WHERE session_id = ?1 AND status = 'pending'
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![session_id],
                QueuedMessageRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn mark_message_sent(&self, message_id: i64) -> Result<bool> {
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE queued_messages SET status = 'sent', sent_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![message_id, Utc::now()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn cancel_queued_message(&self, message_id: i64) -> Result<bool> {
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE queued_messages SET status = 'cancelled'
                 WHERE id = ?1 AND status = 'pending'",
                params![message_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn clear_pending_messages(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE queued_messages SET status = 'cancelled'
                 WHERE session_id = ?1 AND status = 'pending'",
                params![session_id],
            )?;
            Ok(n)
        })
        .await
    }

    pub async fn count_pending_messages(&self, session_id: &str) -> Result<i64> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queued_messages WHERE session_id = ?1 AND status = 'pending'",
                params![session_id],
                |row| row.get(0),
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn queue_is_fifo_within_a_session() {
        let store = store_with_session().await;
        store.enqueue_message("s1", "first".into(), "web".into()).await.unwrap();
        store.enqueue_message("s1", "second".into(), "telegram".into()).await.unwrap();

        let next = store.next_pending_message("s1").await.unwrap().unwrap();
        assert_eq!(next.content, "first");

        assert!(store.mark_message_sent(next.id).await.unwrap());
        let next = store.next_pending_message("s1").await.unwrap().unwrap();
        assert_eq!(next.content, "second");
        assert_eq!(store.count_pending_messages("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_sent_twice_is_a_no_op() {
        let store = store_with_session().await;
        let m = store.enqueue_message("s1", "x".into(), "web".into()).await.unwrap();
        assert!(store.mark_message_sent(m.id).await.unwrap());
        assert!(!store.mark_message_sent(m.id).await.unwrap());
    }

    #[tokio::test]
    async fn clear_cancels_only_pending() {
        let store = store_with_session().await;
        let m1 = store.enqueue_message("s1", "a".into(), "web".into()).await.unwrap();
        store.enqueue_message("s1", "b".into(), "web".into()).await.unwrap();
        store.mark_message_sent(m1.id).await.unwrap();

        assert_eq!(store.clear_pending_messages("s1").await.unwrap(), 1);
        assert_eq!(store.count_pending_messages("s1").await.unwrap(), 0);
    }
}
