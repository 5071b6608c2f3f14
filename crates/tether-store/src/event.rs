// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session event log — the troubleshooting trail behind
//! `GET /sessions/{id}/events` and the unified timeline.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct SessionEventRow {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub event_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SessionEventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let data: Option<String> = row.get("event_data")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            event_type: row.get("event_type")?,
            event_data: data.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at")?,
        })
    }
}

/// One entry of the merged events ∪ permissions ∪ tasks timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub async fn add_event(
        &self,
        session_id: &str,
        event_type: &str,
        event_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let event_type = event_type.to_string();
        let data = event_data.map(|v| v.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO session_events (session_id, event_type, event_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, event_type, data, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_events(&self, session_id: &str, limit: i64) -> Result<Vec<SessionEventRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, event_type, event_data, created_at
                 FROM session_events WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit], SessionEventRow::from_row)?;
            rows.collect()
        })
        .await
    }

    /// Unified newest-first timeline: events, permission decisions and task
    /// runs for one session.
    pub async fn timeline(&self, session_id: &str, limit: i64) -> Result<Vec<TimelineEntry>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT 'event' AS kind, event_type AS action, event_data AS data, created_at
                   FROM session_events WHERE session_id = ?1
                 UNION ALL
                 SELECT 'permission' AS kind, tool_name AS action,
                        json_object('decision', decision, 'decided_by', decided_by) AS data, created_at
                   FROM permission_requests WHERE session_id = ?1
                 UNION ALL
                 SELECT 'task' AS kind, substr(prompt, 1, 50) AS action,
                        json_object('success', success, 'duration_ms', duration_ms) AS data, created_at
                   FROM tasks WHERE session_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit], |row| {
                let data: Option<String> = row.get("data")?;
                Ok(TimelineEntry {
                    kind: row.get("kind")?,
                    action: row.get("action")?,
                    data: data.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: row.get("created_at")?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_come_back_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store.add_event("s1", "one", None).await.unwrap();
        store
            .add_event("s1", "two", Some(serde_json::json!({"k": 1})))
            .await
            .unwrap();
        let events = store.list_events("s1", 10).await.unwrap();
        // session_created + the two above
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "two");
        assert_eq!(events[0].event_data.as_ref().unwrap()["k"], 1);
    }

    #[tokio::test]
    async fn timeline_merges_sources() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
            .create_task("t1".into(), Some("s1".into()), "do things".into(), "/p".into(), None, "api".into())
            .await
            .unwrap();
        let timeline = store.timeline("s1", 10).await.unwrap();
        assert!(timeline.iter().any(|e| e.kind == "event"));
        assert!(timeline.iter().any(|e| e.kind == "task"));
    }
}
