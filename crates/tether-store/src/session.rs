// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session rows. Enum-valued columns (`status`, `control_state`) are stored
//! as their lowercase wire strings; the registry layer owns the conversion
//! (and the coercion of unknown legacy values).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub project_dir: String,
    pub status: String,
    pub control_state: String,
    pub transcript_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            project_dir: row.get("project_dir")?,
            status: row.get("status")?,
            control_state: row.get("control_state")?,
            transcript_path: row.get("transcript_path")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const COLS: &str = "id, name, project_dir, status, control_state, transcript_path, created_at, updated_at";

/// Display-name numbering: the first session for a directory keeps the base
/// name; later ones get `#2`, `#3`, … where the number is one past the
/// highest suffix already present.
pub fn numbered_name(base: &str, existing: &[String]) -> String {
    if !existing.iter().any(|n| n == base) {
        return base.to_string();
    }
    let mut max_num: u32 = 1;
    let prefix = format!("{base} #");
    for name in existing {
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Ok(n) = rest.trim().parse::<u32>() {
                max_num = max_num.max(n);
            }
        }
    }
    format!("{base} #{}", max_num + 1)
}

impl Store {
    /// Insert a new session, generating a unique display name for its
    /// project directory inside the same transaction.
    pub async fn create_session(
        &self,
        id: String,
        base_name: String,
        project_dir: String,
        control_state: String,
        transcript_path: Option<String>,
    ) -> Result<SessionRow> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let existing: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT name FROM sessions WHERE project_dir = ?1")?;
                let names = stmt
                    .query_map(params![project_dir], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                names
            };
            let name = numbered_name(&base_name, &existing);
            let now = Utc::now();
            tx.execute(
                "INSERT INTO sessions (id, name, project_dir, status, control_state, transcript_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6, ?6)",
                params![id, name, project_dir, control_state, transcript_path, now],
            )?;
            tx.execute(
                "INSERT INTO session_events (session_id, event_type, event_data, created_at)
                 VALUES (?1, 'session_created', ?2, ?3)",
                params![
                    id,
                    format!(r#"{{"name":{},"project_dir":{}}}"#,
                        serde_json::Value::from(name.clone()),
                        serde_json::Value::from(project_dir.clone())),
                    now
                ],
            )?;
            let row = tx.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )?;
            tx.commit()?;
            Ok(row)
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    /// Prefix lookup for truncated button-callback ids (min 8 chars,
    /// enforced by the caller). Newest match wins.
    pub async fn get_session_by_prefix(&self, prefix: &str) -> Result<Option<SessionRow>> {
        let like = format!("{}%", prefix.replace('%', "").replace('_', ""));
        self.run(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLS} FROM sessions WHERE id LIKE ?1 ORDER BY updated_at DESC LIMIT 1"
                ),
                params![like],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn get_session_by_project_dir(&self, project_dir: &str) -> Result<Option<SessionRow>> {
        let project_dir = project_dir.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLS} FROM sessions WHERE project_dir = ?1 ORDER BY updated_at DESC LIMIT 1"
                ),
                params![project_dir],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    /// All sessions in registration order (index lookup is 1-based into this).
    pub async fn list_sessions(&self, include_stopped: bool) -> Result<Vec<SessionRow>> {
        self.run(move |conn| {
            let sql = if include_stopped {
                format!("SELECT {COLS} FROM sessions ORDER BY created_at ASC, id ASC")
            } else {
                format!(
                    "SELECT {COLS} FROM sessions WHERE status != 'stopped' ORDER BY created_at ASC, id ASC"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], SessionRow::from_row)?;
            rows.collect()
        })
        .await
    }

    /// Re-registration refresh: keeps the stored name, bumps activity,
    /// resets status to running.
    pub async fn refresh_session(
        &self,
        id: &str,
        project_dir: String,
        transcript_path: Option<String>,
    ) -> Result<Option<SessionRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            conn.execute(
                "UPDATE sessions
                 SET project_dir = ?2, status = 'running',
                     transcript_path = COALESCE(?3, transcript_path), updated_at = ?4
                 WHERE id = ?1",
                params![id, project_dir, transcript_path, now],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn update_session_status(&self, id: &str, status: String) -> Result<Option<SessionRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status, now],
            )?;
            if n == 0 {
                return Ok(None);
            }
            conn.execute(
                "INSERT INTO session_events (session_id, event_type, event_data, created_at)
                 VALUES (?1, 'status_changed', ?2, ?3)",
                params![id, format!(r#"{{"status":"{status}"}}"#), now],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn update_control_state(&self, id: &str, state: String) -> Result<Option<SessionRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE sessions SET control_state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, state, now],
            )?;
            if n == 0 {
                return Ok(None);
            }
            conn.execute(
                "INSERT INTO session_events (session_id, event_type, event_data, created_at)
                 VALUES (?1, 'control_state_changed', ?2, ?3)",
                params![id, format!(r#"{{"control_state":"{state}"}}"#), now],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn rename_session(&self, id: &str, name: String) -> Result<Option<SessionRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE sessions SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, now],
            )?;
            if n == 0 {
                return Ok(None);
            }
            conn.query_row(
                &format!("SELECT {COLS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn touch_session(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a session. Events, queue, permissions, chat, settings, images
    /// cascade; task rows keep their data with `session_id` nulled.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_name_first_use_keeps_base() {
        assert_eq!(numbered_name("foo", &[]), "foo");
        assert_eq!(numbered_name("foo", &["bar".into()]), "foo");
    }

    #[test]
    fn numbered_name_counts_up_from_max_suffix() {
        assert_eq!(numbered_name("foo", &["foo".into()]), "foo #2");
        assert_eq!(
            numbered_name("foo", &["foo".into(), "foo #2".into()]),
            "foo #3"
        );
        // Gaps don't get reused; one past the max wins.
        assert_eq!(
            numbered_name("foo", &["foo".into(), "foo #7".into()]),
            "foo #8"
        );
    }

    #[test]
    fn numbered_name_ignores_non_numeric_suffixes() {
        assert_eq!(
            numbered_name("foo", &["foo".into(), "foo #bar".into()]),
            "foo #2"
        );
    }

    #[tokio::test]
    async fn name_collision_yields_numbered_names_in_registration_order() {
        let store = Store::open_in_memory().await.unwrap();
        for (i, expect) in [("s1", "x"), ("s2", "x #2"), ("s3", "x #3")] {
            let row = store
                .create_session(i.into(), "x".into(), "/a".into(), "cli_active".into(), None)
                .await
                .unwrap();
            assert_eq!(row.name, expect);
        }
        // Same base name under a different directory starts over.
        let row = store
            .create_session("s4".into(), "x".into(), "/b".into(), "cli_active".into(), None)
            .await
            .unwrap();
        assert_eq!(row.name, "x");
    }

    #[tokio::test]
    async fn prefix_lookup_finds_session() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session(
                "abcdef1234567890".into(),
                "p".into(),
                "/p".into(),
                "cli_active".into(),
                None,
            )
            .await
            .unwrap();
        let found = store.get_session_by_prefix("abcdef12").await.unwrap();
        assert_eq!(found.unwrap().id, "abcdef1234567890");
        assert!(store.get_session_by_prefix("zzzzzzzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_events() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        assert!(store.delete_session("s1").await.unwrap());
        assert!(store.list_events("s1", 10).await.unwrap().is_empty());
        assert!(!store.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn refresh_preserves_name() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "proj".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        let row = store
            .refresh_session("s1", "/p".into(), Some("/tmp/t.md".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.name, "proj");
        assert_eq!(row.transcript_path.as_deref(), Some("/tmp/t.md"));
    }
}
