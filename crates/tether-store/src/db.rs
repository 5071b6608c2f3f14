// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Schema and migrations.

use rusqlite::Connection;
use tracing::info;

/// Migration steps, applied in order. `user_version` records how many have
/// run; each step must also be safe to re-run.
const MIGRATIONS: &[&str] = &[
    // 1 — base schema
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id              TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        project_dir     TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'running',
        control_state   TEXT NOT NULL DEFAULT 'cli_active',
        transcript_path TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS session_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        event_data TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS queued_messages (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        content    TEXT NOT NULL,
        source     TEXT NOT NULL,
        status     TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        sent_at    TEXT,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS permission_requests (
        id                  TEXT PRIMARY KEY,
        session_id          TEXT NOT NULL,
        tool_name           TEXT,
        tool_input          TEXT,
        message             TEXT,
        decision            TEXT NOT NULL DEFAULT 'pending',
        decided_by          TEXT,
        external_message_id INTEGER,
        created_at          TEXT NOT NULL,
        decided_at          TEXT,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS permission_rules (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        tool_name  TEXT NOT NULL,
        pattern    TEXT NOT NULL,
        rule_type  TEXT NOT NULL,
        scope      TEXT NOT NULL,
        session_id TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id           TEXT PRIMARY KEY,
        session_id   TEXT,
        prompt       TEXT NOT NULL,
        project_dir  TEXT NOT NULL,
        model        TEXT,
        result       TEXT,
        success      INTEGER,
        duration_ms  INTEGER,
        num_turns    INTEGER,
        error        TEXT,
        source       TEXT NOT NULL,
        created_at   TEXT NOT NULL,
        completed_at TEXT,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE SET NULL
    );

    CREATE TABLE IF NOT EXISTS chat_messages (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id  TEXT NOT NULL,
        type        TEXT NOT NULL,
        content     TEXT NOT NULL,
        status      TEXT,
        duration_ms INTEGER,
        num_turns   INTEGER,
        source      TEXT NOT NULL DEFAULT 'web',
        created_at  TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS session_settings (
        session_id       TEXT PRIMARY KEY,
        model            TEXT,
        reasoning_effort TEXT,
        updated_at       TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS notifications (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        type       TEXT NOT NULL,
        title      TEXT NOT NULL,
        message    TEXT NOT NULL,
        read       INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS session_images (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        public_id  TEXT NOT NULL UNIQUE,
        url        TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_session_events_session   ON session_events(session_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_queued_messages_session  ON queued_messages(session_id, status);
    CREATE INDEX IF NOT EXISTS idx_permissions_session      ON permission_requests(session_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_rules_lookup             ON permission_rules(tool_name, scope);
    CREATE INDEX IF NOT EXISTS idx_tasks_session            ON tasks(session_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_chat_session             ON chat_messages(session_id, created_at);
    "#,
    // 2 — autonomy level joined the per-session settings
    r#"
    ALTER TABLE session_settings ADD COLUMN autonomy_level TEXT;
    "#,
    // 3 — image attachments on chat messages (JSON array of URLs)
    r#"
    ALTER TABLE chat_messages ADD COLUMN images TEXT;
    "#,
];

/// Apply any migrations newer than the database's `user_version`.
pub(crate) fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let step = (idx + 1) as i64;
        if step <= version {
            continue;
        }
        let tx = conn.transaction()?;
        match tx.execute_batch(sql) {
            Ok(()) => {}
            // ALTER TABLE ADD COLUMN has no IF NOT EXISTS; a re-run after a
            // partially recorded step surfaces as "duplicate column name".
            Err(e) if e.to_string().contains("duplicate column name") => {}
            Err(e) => return Err(e),
        }
        tx.pragma_update(None, "user_version", step)?;
        tx.commit()?;
        info!(step, "applied database migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_to_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        // Force a replay of every step.
        conn.pragma_update(None, "user_version", 0).unwrap();
        apply_migrations(&mut conn).unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn settings_table_has_autonomy_column() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (id, name, project_dir, created_at, updated_at)
             VALUES ('s1', 'x', '/p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO session_settings (session_id, autonomy_level, updated_at)
             VALUES ('s1', 'high', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }
}
