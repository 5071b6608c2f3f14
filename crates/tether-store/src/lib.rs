// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Embedded SQLite persistence for the bridge.
//!
//! One database file holds everything the surfaces need to catch up after a
//! disconnect: sessions, session events, queued messages, permission
//! requests and rules, tasks, chat history, settings, notifications and
//! uploaded-image bookkeeping. The database is the source of truth; the
//! in-memory caches elsewhere are conveniences.
//!
//! # Concurrency
//!
//! A single [`rusqlite::Connection`] behind an `Arc<Mutex<_>>`; every call is
//! routed through [`tokio::task::spawn_blocking`] so SQLite's blocking I/O
//! never stalls the runtime. The mutex serialises writers; readers queue
//! behind it, which is fine at bridge scale (human latency dominates).
//!
//! # Migrations
//!
//! Gated on `PRAGMA user_version` and applied on open, before the HTTP
//! listener binds. Each step is additionally written to be idempotent
//! (`IF NOT EXISTS`) so a half-applied step can be retried safely.

mod chat;
mod db;
mod event;
mod image;
mod notification;
mod permission;
mod queue;
mod session;
mod settings;
mod task;

pub use chat::ChatMessageRow;
pub use event::{SessionEventRow, TimelineEntry};
pub use image::SessionImageRow;
pub use notification::NotificationRow;
pub use permission::{PermissionRequestRow, PermissionRuleRow};
pub use queue::QueuedMessageRow;
pub use session::{numbered_name, SessionRow};
pub use settings::SessionSettingsRow;
pub use task::{NewTaskSession, TaskFilter, TaskRow};

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database task failed: {0}")]
    Join(String),

    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the bridge database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let mut conn = Connection::open(&path)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            db::apply_migrations(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests. Same schema, no file.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let mut conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            db::apply_migrations(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection inside `spawn_blocking`.
    pub(crate) async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }
}
