// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Uploaded-image bookkeeping. Rows exist so the asset files can be removed
//! when their session is deleted.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{Result, Store};

#[derive(Debug, Clone, Serialize)]
pub struct SessionImageRow {
    pub id: i64,
    pub session_id: String,
    pub public_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl SessionImageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            public_id: row.get("public_id")?,
            url: row.get("url")?,
            created_at: row.get("created_at")?,
        })
    }
}

const COLS: &str = "id, session_id, public_id, url, created_at";

impl Store {
    pub async fn add_image(
        &self,
        session_id: &str,
        public_id: String,
        url: String,
    ) -> Result<SessionImageRow> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO session_images (session_id, public_id, url, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, public_id, url, Utc::now()],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {COLS} FROM session_images WHERE id = ?1"),
                params![id],
                SessionImageRow::from_row,
            )
        })
        .await
    }

    pub async fn images_for_session(&self, session_id: &str) -> Result<Vec<SessionImageRow>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLS} FROM session_images WHERE session_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![session_id], SessionImageRow::from_row)?;
            rows.collect()
        })
        .await
    }

    /// Remove the row; returns it so the caller can delete the asset file.
    pub async fn delete_image(&self, public_id: &str) -> Result<Option<SessionImageRow>> {
        let public_id = public_id.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {COLS} FROM session_images WHERE public_id = ?1"),
                    params![public_id],
                    SessionImageRow::from_row,
                )
                .optional()?;
            if row.is_some() {
                conn.execute(
                    "DELETE FROM session_images WHERE public_id = ?1",
                    params![public_id],
                )?;
            }
            Ok(row)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_returns_row_once() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session("s1".into(), "p".into(), "/p".into(), "cli_active".into(), None)
            .await
            .unwrap();
        store
            .add_image("s1", "img-1".into(), "/uploads/img-1.png".into())
            .await
            .unwrap();

        let row = store.delete_image("img-1").await.unwrap();
        assert!(row.is_some());
        assert!(store.delete_image("img-1").await.unwrap().is_none());
    }
}
