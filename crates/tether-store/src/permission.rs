// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Permission audit rows and reusable allow/deny rules.
//!
//! `permission_requests.id` is the same string the rendezvous queue uses as
//! its wait key, so an audit row can always be traced to its hook exchange.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequestRow {
    pub id: String,
    pub session_id: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub message: Option<String>,
    pub decision: String,
    pub decided_by: Option<String>,
    /// Message id on the bot surface so the prompt can be edited in place.
    pub external_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl PermissionRequestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let input: Option<String> = row.get("tool_input")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            tool_name: row.get("tool_name")?,
            tool_input: input.and_then(|s| serde_json::from_str(&s).ok()),
            message: row.get("message")?,
            decision: row.get("decision")?,
            decided_by: row.get("decided_by")?,
            external_message_id: row.get("external_message_id")?,
            created_at: row.get("created_at")?,
            decided_at: row.get("decided_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRuleRow {
    pub id: i64,
    pub tool_name: String,
    pub pattern: String,
    pub rule_type: String,
    pub scope: String,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PermissionRuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            tool_name: row.get("tool_name")?,
            pattern: row.get("pattern")?,
            rule_type: row.get("rule_type")?,
            scope: row.get("scope")?,
            session_id: row.get("session_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

const REQ_COLS: &str = "id, session_id, tool_name, tool_input, message, decision, decided_by, external_message_id, created_at, decided_at";
const RULE_COLS: &str = "id, tool_name, pattern, rule_type, scope, session_id, created_at";

impl Store {
    pub async fn create_permission_request(
        &self,
        id: String,
        session_id: String,
        tool_name: Option<String>,
        tool_input: Option<serde_json::Value>,
        message: Option<String>,
        external_message_id: Option<i64>,
    ) -> Result<PermissionRequestRow> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO permission_requests
                 (id, session_id, tool_name, tool_input, message, decision, decided_by, external_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, ?6, ?7)",
                params![
                    id,
                    session_id,
                    tool_name,
                    tool_input.map(|v| v.to_string()),
                    message,
                    external_message_id,
                    Utc::now()
                ],
            )?;
            conn.query_row(
                &format!("SELECT {REQ_COLS} FROM permission_requests WHERE id = ?1"),
                params![id],
                PermissionRequestRow::from_row,
            )
        })
        .await
    }

    pub async fn get_permission_request(&self, id: &str) -> Result<Option<PermissionRequestRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {REQ_COLS} FROM permission_requests WHERE id = ?1"),
                params![id],
                PermissionRequestRow::from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn pending_permission_for(
        &self,
        session_id: &str,
    ) -> Result<Option<PermissionRequestRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {REQ_COLS} FROM permission_requests
                     WHERE session_id = ?1 AND decision = 'pending'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![session_id],
                PermissionRequestRow::from_row,
            )
            .optional()
        })
        .await
    }

    /// Record a decision and log a `permission_resolved` session event.
    pub async fn resolve_permission(
        &self,
        id: &str,
        decision: String,
        decided_by: String,
    ) -> Result<Option<PermissionRequestRow>> {
        let id = id.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE permission_requests
                 SET decision = ?2, decided_by = ?3, decided_at = ?4
                 WHERE id = ?1",
                params![id, decision, decided_by, now],
            )?;
            if n == 0 {
                return Ok(None);
            }
            let row = conn.query_row(
                &format!("SELECT {REQ_COLS} FROM permission_requests WHERE id = ?1"),
                params![id],
                PermissionRequestRow::from_row,
            )?;
            conn.execute(
                "INSERT INTO session_events (session_id, event_type, event_data, created_at)
                 VALUES (?1, 'permission_resolved', ?2, ?3)",
                params![
                    row.session_id,
                    serde_json::json!({
                        "request_id": row.id,
                        "decision": decision,
                        "decided_by": decided_by,
                        "tool_name": row.tool_name,
                    })
                    .to_string(),
                    now
                ],
            )?;
            Ok(Some(row))
        })
        .await
    }

    pub async fn set_permission_external_id(&self, id: &str, message_id: i64) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE permission_requests SET external_message_id = ?2 WHERE id = ?1",
                params![id, message_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn permission_history(
        &self,
        session_id: Option<String>,
        limit: i64,
    ) -> Result<Vec<PermissionRequestRow>> {
        self.run(move |conn| match session_id {
            Some(sid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQ_COLS} FROM permission_requests
                     WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![sid, limit], PermissionRequestRow::from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQ_COLS} FROM permission_requests
                     ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], PermissionRequestRow::from_row)?;
                rows.collect()
            }
        })
        .await
    }

    // ── Rules ─────────────────────────────────────────────────────────────────

    /// Insert a rule, replacing any existing rule with the same
    /// `(tool_name, pattern, scope, session_id)` so the newest wins.
    pub async fn add_rule(
        &self,
        tool_name: String,
        pattern: String,
        rule_type: String,
        scope: String,
        session_id: Option<String>,
    ) -> Result<PermissionRuleRow> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM permission_rules
                 WHERE tool_name = ?1 AND pattern = ?2 AND scope = ?3
                   AND session_id IS ?4",
                params![tool_name, pattern, scope, session_id],
            )?;
            tx.execute(
                "INSERT INTO permission_rules (tool_name, pattern, rule_type, scope, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![tool_name, pattern, rule_type, scope, session_id, Utc::now()],
            )?;
            let id = tx.last_insert_rowid();
            let row = tx.query_row(
                &format!("SELECT {RULE_COLS} FROM permission_rules WHERE id = ?1"),
                params![id],
                PermissionRuleRow::from_row,
            )?;
            tx.commit()?;
            Ok(row)
        })
        .await
    }

    /// Rules that can apply to a session: its session-scoped rules plus all
    /// global rules, newest first (recency is the same-specificity tie-break).
    pub async fn rules_for_session(&self, session_id: &str) -> Result<Vec<PermissionRuleRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLS} FROM permission_rules
                 WHERE scope = 'global' OR session_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![session_id], PermissionRuleRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn list_rules(&self) -> Result<Vec<PermissionRuleRow>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLS} FROM permission_rules ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], PermissionRuleRow::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_rule(&self, id: i64) -> Result<bool> {
        self.run(move |conn| {
            let n = conn.execute("DELETE FROM permission_rules WHERE id = ?1", params![id])?;
            Ok(n > 0)
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
    async fn resolve_records_decision_and_event() {
        let store = store_with_session().await;
        store
            .create_permission_request(
                "r1".into(),
                "s1".into(),
                Some("Execute".into()),
                Some(serde_json::json!({"command": "rm -rf build"})),
                Some("allow?".into()),
                None,
            )
            .await
            .unwrap();

        let row = store
            .resolve_permission("r1", "approved".into(), "bot".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.decision, "approved");
        assert_eq!(row.decided_by.as_deref(), Some("bot"));
        assert!(row.decided_at.is_some());

        let events = store.list_events("s1", 10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "permission_resolved"));
    }

    #[tokio::test]
    async fn resolve_unknown_request_returns_none() {
        let store = store_with_session().await;
        assert!(store
            .resolve_permission("nope", "denied".into(), "web".into())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_rule_is_replaced_not_duplicated() {
        let store = store_with_session().await;
        store
            .add_rule("Execute".into(), "npm *".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        store
            .add_rule("Execute".into(), "npm *".into(), "deny".into(), "global".into(), None)
            .await
            .unwrap();
        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_type, "deny");
    }

    #[tokio::test]
    async fn rules_for_session_excludes_other_sessions() {
        let store = store_with_session().await;
        store
            .create_session("s2".into(), "q".into(), "/q".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
            .add_rule("Execute".into(), "rm *".into(), "deny".into(), "session".into(), Some("s1".into()))
            .await
            .unwrap();
        store
            .add_rule("Execute".into(), "*".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();

        let s2_rules = store.rules_for_session("s2").await.unwrap();
        assert_eq!(s2_rules.len(), 1);
        assert_eq!(s2_rules[0].scope, "global");

        let s1_rules = store.rules_for_session("s1").await.unwrap();
        assert_eq!(s1_rules.len(), 2);
    }

    #[tokio::test]
    async fn session_scoped_rules_die_with_session() {
        let store = store_with_session().await;
        store
            .add_rule("Execute".into(), "rm *".into(), "deny".into(), "session".into(), Some("s1".into()))
            .await
            .unwrap();
        store.delete_session("s1").await.unwrap();
        assert!(store.list_rules().await.unwrap().is_empty());
    }
}
