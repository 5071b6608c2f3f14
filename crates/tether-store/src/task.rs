// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Task rows — one per headless Agent invocation. Terminal rows never
//! mutate again; session deletion nulls `session_id` but keeps the row
//! (historical retention).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub project_dir: String,
    pub model: Option<String>,
    pub result: Option<String>,
    pub success: Option<bool>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub error: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            prompt: row.get("prompt")?,
            project_dir: row.get("project_dir")?,
            model: row.get("model")?,
            result: row.get("result")?,
            success: row.get("success")?,
            duration_ms: row.get("duration_ms")?,
            num_turns: row.get("num_turns")?,
            error: row.get("error")?,
            source: row.get("source")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Filters for `GET /tasks`.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub session_id: Option<String>,
    pub source: Option<String>,
    pub success_only: bool,
    pub limit: i64,
}

const COLS: &str = "id, session_id, prompt, project_dir, model, result, success, duration_ms, num_turns, error, source, created_at, completed_at";

impl Store {
    pub async fn create_task(
        &self,
        id: String,
        session_id: Option<String>,
        prompt: String,
        project_dir: String,
        model: Option<String>,
        source: String,
    ) -> Result<TaskRow> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, session_id, prompt, project_dir, model, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, session_id, prompt, project_dir, model, source, Utc::now()],
            )?;
            conn.query_row(
                &format!("SELECT {COLS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::from_row,
            )
        })
        .await
    }

    /// Record a task outcome. When the task produced a session the bridge
    /// had never seen, the session row and the user/assistant chat pair are
    /// written in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_task(
        &self,
        id: String,
        success: bool,
        result: Option<String>,
        duration_ms: i64,
        num_turns: i64,
        error: Option<String>,
        session_id: Option<String>,
        create_session: Option<NewTaskSession>,
    ) -> Result<Option<TaskRow>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let n = tx.execute(
                "UPDATE tasks
                 SET success = ?2, result = ?3, duration_ms = ?4, num_turns = ?5, error = ?6,
                     completed_at = ?7, session_id = COALESCE(?8, session_id)
                 WHERE id = ?1",
                params![id, success, result, duration_ms, num_turns, error, now, session_id],
            )?;
            if n == 0 {
                return Ok(None);
            }

            if let Some(new) = create_session {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                    params![new.session_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    tx.execute(
                        "INSERT INTO sessions (id, name, project_dir, status, control_state, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 'running', 'remote_active', ?4, ?4)",
                        params![new.session_id, new.name, new.project_dir, now],
                    )?;
                    tx.execute(
                        "INSERT INTO chat_messages (session_id, type, content, source, created_at)
                         VALUES (?1, 'user', ?2, ?3, ?4)",
                        params![new.session_id, new.prompt, new.source, now],
                    )?;
                    tx.execute(
                        "INSERT INTO chat_messages (session_id, type, content, status, duration_ms, num_turns, source, created_at)
                         VALUES (?1, 'assistant', ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            new.session_id,
                            new.result,
                            if success { "success" } else { "error" },
                            duration_ms,
                            num_turns,
                            new.source,
                            now
                        ],
                    )?;
                }
            }

            let row = tx.query_row(
                &format!("SELECT {COLS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::from_row,
            )?;
            tx.commit()?;
            Ok(Some(row))
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {COLS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn task_history(&self, filter: TaskFilter) -> Result<Vec<TaskRow>> {
        self.run(move |conn| {
            let mut conditions = Vec::new();
            if filter.session_id.is_some() {
                conditions.push("session_id = :session_id");
            }
            if filter.source.is_some() {
                conditions.push("source = :source");
            }
            if filter.success_only {
                conditions.push("success = 1");
            }
            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" AND "))
            };
            let sql = format!(
                "SELECT {COLS} FROM tasks {where_clause} ORDER BY created_at DESC LIMIT :limit"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut binds: Vec<(&str, &dyn rusqlite::ToSql)> = vec![(":limit", &filter.limit)];
            if let Some(ref sid) = filter.session_id {
                binds.push((":session_id", sid));
            }
            if let Some(ref src) = filter.source {
                binds.push((":source", src));
            }
            let rows = stmt.query_map(binds.as_slice(), TaskRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn failed_tasks(&self, limit: i64) -> Result<Vec<TaskRow>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM tasks
                 WHERE success = 0 AND completed_at IS NOT NULL
                 ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], TaskRow::from_row)?;
            rows.collect()
        })
        .await
    }
}

/// Session + chat rows to create alongside a task completion (tasks that
/// started a brand-new Agent conversation).
#[derive(Debug, Clone)]
pub struct NewTaskSession {
    pub session_id: String,
    pub name: String,
    pub project_dir: String,
    pub prompt: String,
    pub result: String,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_with_new_session_writes_chat_pair() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_task("t1".into(), None, "build it".into(), "/proj/foo".into(), None, "api".into())
            .await
            .unwrap();

        let row = store
            .complete_task(
                "t1".into(),
                true,
                Some("done".into()),
                1234,
                3,
                None,
                Some("abc123".into()),
                Some(NewTaskSession {
                    session_id: "abc123".into(),
                    name: "foo".into(),
                    project_dir: "/proj/foo".into(),
                    prompt: "build it".into(),
                    result: "done".into(),
                    source: "web".into(),
                }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.success, Some(true));
        assert_eq!(row.session_id.as_deref(), Some("abc123"));

        let session = store.get_session("abc123").await.unwrap().unwrap();
        assert_eq!(session.control_state, "remote_active");

        let chat = store.chat_history("abc123", 10, 0).await.unwrap();
        assert_eq!(chat.len(), 2);
    }

    #[tokio::test]
    async fn complete_unknown_task_returns_none() {
        let store = Store::open_in_memory().await.unwrap();
        let out = store
            .complete_task("missing".into(), false, None, 0, 0, Some("boom".into()), None, None)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn deleting_session_keeps_task_row() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
            .create_task("t1".into(), Some("s1".into()), "x".into(), "/p".into(), None, "api".into())
            .await
            .unwrap();
        store.delete_session("s1").await.unwrap();

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert!(task.session_id.is_none(), "session_id must be nulled, row kept");
    }

    #[tokio::test]
    async fn failed_filter_excludes_running_and_successful() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_task("ok".into(), None, "a".into(), "/p".into(), None, "api".into())
            .await
            .unwrap();
        store
            .create_task("bad".into(), None, "b".into(), "/p".into(), None, "api".into())
            .await
            .unwrap();
        store
            .create_task("running".into(), None, "c".into(), "/p".into(), None, "api".into())
            .await
            .unwrap();
        store
            .complete_task("ok".into(), true, Some("r".into()), 1, 1, None, None, None)
            .await
            .unwrap();
        store
            .complete_task("bad".into(), false, None, 1, 1, Some("err".into()), None, None)
            .await
            .unwrap();

        let failed = store.failed_tasks(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "bad");
    }
}
