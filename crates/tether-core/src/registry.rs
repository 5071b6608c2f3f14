// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session registry — the canonical session table plus the in-memory
//! pending-request cache.
//!
//! Sessions live in SQLite so they survive bridge restarts; the pending
//! request of each session is cached in memory for the active permission
//! flow and mirrored to the audit table when it is permission-typed.
//!
//! # Concurrency
//!
//! The pending cache sits behind a plain mutex held only for map updates —
//! never across I/O. Database mutations rely on the store's single-writer
//! connection; the display-name uniqueness check is re-done inside the
//! insert transaction.
//!
//! Every mutation emits one event through the [`Notifier`], plus the
//! `sessions_update` re-broadcast surfaces key their lists off.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tether_store::{QueuedMessageRow, Result, SessionRow, Store};

use crate::events::{BridgeEvent, Notifier, SessionView};
use crate::models::{ControlState, NotificationType, PendingRequest, Session, SessionStatus};
use crate::rendezvous::RendezvousQueue;

pub struct SessionRegistry {
    store: Store,
    rendezvous: Arc<RendezvousQueue>,
    notifier: Notifier,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl SessionRegistry {
    pub fn new(store: Store, rendezvous: Arc<RendezvousQueue>, notifier: Notifier) -> Self {
        Self {
            store,
            rendezvous,
            notifier,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ── Registration & lookup ─────────────────────────────────────────────────

    /// Register or refresh a session. Idempotent: an existing session keeps
    /// its display name and just gets its activity bumped; a new one gets a
    /// unique numbered name for its project directory. A `released` session
    /// re-registering means the CLI resumed.
    pub async fn register(
        &self,
        session_id: &str,
        project_dir: &str,
        name: Option<String>,
        transcript_path: Option<String>,
    ) -> Result<Session> {
        if let Some(existing) = self.store.get_session(session_id).await? {
            // A notify-triggered auto-registration carries no project dir;
            // never let it wipe the real one.
            let dir = if project_dir.trim().is_empty() {
                existing.project_dir.clone()
            } else {
                project_dir.to_string()
            };
            let row = self
                .store
                .refresh_session(session_id, dir, transcript_path)
                .await?
                .unwrap_or(existing);

            if ControlState::from_db(&row.control_state) == ControlState::Released {
                // The CLI came back; released → cli_active is in the table.
                if let Some(session) = self
                    .update_control_state(session_id, ControlState::CliActive)
                    .await?
                {
                    return Ok(session);
                }
            }

            let session = self.attach_pending(row).await?;
            info!(session_id, name = %session.name, "session refreshed");
            self.emit_sessions_update().await;
            return Ok(session);
        }

        let base_name = name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                Path::new(project_dir)
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let row = self
            .store
            .create_session(
                session_id.to_string(),
                base_name,
                project_dir.to_string(),
                ControlState::CliActive.as_str().to_string(),
                transcript_path,
            )
            .await?;

        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);

        info!(session_id, name = %row.name, "session registered");
        let session = self.attach_pending(row).await?;
        self.emit_sessions_update().await;
        Ok(session)
    }

    /// Lookup by exact id, falling back to id prefix for truncated button
    /// callbacks (minimum 8 characters).
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(row) = self.store.get_session(session_id).await? {
            return Ok(Some(self.attach_pending(row).await?));
        }
        if session_id.len() >= 8 {
            if let Some(row) = self.store.get_session_by_prefix(session_id).await? {
                return Ok(Some(self.attach_pending(row).await?));
            }
        }
        Ok(None)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Session>> {
        for row in self.store.list_sessions(true).await? {
            if row.name.eq_ignore_ascii_case(name) {
                return Ok(Some(self.attach_pending(row).await?));
            }
        }
        Ok(None)
    }

    /// 1-based index into registration order.
    pub async fn get_by_index(&self, index: usize) -> Result<Option<Session>> {
        if index == 0 {
            return Ok(None);
        }
        let rows = self.store.list_sessions(true).await?;
        match rows.into_iter().nth(index - 1) {
            Some(row) => Ok(Some(self.attach_pending(row).await?)),
            None => Ok(None),
        }
    }

    /// Resolve a user-supplied selector: exact/prefix id, then
    /// case-insensitive name, then 1-based index.
    pub async fn resolve(&self, selector: &str) -> Result<Option<Session>> {
        if let Some(s) = self.get(selector).await? {
            return Ok(Some(s));
        }
        if let Some(s) = self.get_by_name(selector).await? {
            return Ok(Some(s));
        }
        if let Ok(index) = selector.parse::<usize>() {
            return self.get_by_index(index).await;
        }
        Ok(None)
    }

    pub async fn get_by_project_dir(&self, project_dir: &str) -> Result<Option<Session>> {
        match self.store.get_session_by_project_dir(project_dir).await? {
            Some(row) => Ok(Some(self.attach_pending(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Session>> {
        let rows = self.store.list_sessions(true).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.attach_pending(row).await?);
        }
        Ok(sessions)
    }

    pub async fn get_active(&self) -> Result<Vec<Session>> {
        let rows = self.store.list_sessions(false).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.attach_pending(row).await?);
        }
        Ok(sessions)
    }

    // ── Status & control state ────────────────────────────────────────────────

    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Option<Session>> {
        let row = self
            .store
            .update_session_status(session_id, status.as_str().to_string())
            .await?;
        match row {
            Some(row) => {
                let session = self.attach_pending(row).await?;
                self.emit_sessions_update().await;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Apply a control-state transition. Illegal transitions — anything
    /// outside the table — change nothing and emit nothing.
    pub async fn update_control_state(
        &self,
        session_id: &str,
        to: ControlState,
    ) -> Result<Option<Session>> {
        let Some(row) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        let from = ControlState::from_db(&row.control_state);
        if !ControlState::can_transition(from, to) {
            warn!(session_id, %from, %to, "refusing control-state transition");
            return Ok(None);
        }

        let Some(row) = self
            .store
            .update_control_state(session_id, to.as_str().to_string())
            .await?
        else {
            return Ok(None);
        };

        info!(session_id, %from, %to, "control state changed");
        self.notifier.emit(BridgeEvent::SessionStateChanged {
            session_id: session_id.to_string(),
            control_state: to,
        });
        let session = self.attach_pending(row).await?;
        self.emit_sessions_update().await;
        Ok(Some(session))
    }

    /// CLI → remote. Permitted from `cli_active`, `cli_waiting` and
    /// `released` (re-taking control after a release).
    pub async fn handoff_to_remote(&self, session_id: &str) -> Result<Option<Session>> {
        self.update_control_state(session_id, ControlState::RemoteActive)
            .await
    }

    /// Remote → released. Only the remote holder can release.
    pub async fn release_to_cli(&self, session_id: &str) -> Result<Option<Session>> {
        self.update_control_state(session_id, ControlState::Released)
            .await
    }

    /// The Stop hook fired: the CLI is at a stop point.
    pub async fn set_cli_waiting(&self, session_id: &str) -> Result<Option<Session>> {
        self.update_control_state(session_id, ControlState::CliWaiting)
            .await
    }

    pub async fn set_cli_active(&self, session_id: &str) -> Result<Option<Session>> {
        self.update_control_state(session_id, ControlState::CliActive)
            .await
    }

    /// Remote task execution is permitted iff remote holds the session.
    pub async fn can_execute_remote_task(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .get(session_id)
            .await?
            .is_some_and(|s| s.control_state == ControlState::RemoteActive))
    }

    /// Incoming work must queue while the CLI drives.
    pub async fn should_queue_message(&self, session_id: &str) -> Result<bool> {
        Ok(self.get(session_id).await?.is_some_and(|s| {
            matches!(
                s.control_state,
                ControlState::CliActive | ControlState::CliWaiting
            )
        }))
    }

    // ── Pending requests ──────────────────────────────────────────────────────

    /// Set or clear the pending request. Setting a new one while another is
    /// active supersedes it — the old waiter gets a cancellation. Clearing
    /// when none is set is a no-op. Permission-typed requests are mirrored
    /// into the audit table; clearing leaves the audit record.
    pub async fn set_pending_request(
        &self,
        session_id: &str,
        request: Option<PendingRequest>,
    ) -> Result<Option<Session>> {
        match request {
            Some(req) => {
                let superseded = {
                    let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                    let old = pending.insert(session_id.to_string(), req.clone());
                    old.filter(|o| o.id != req.id)
                };
                if let Some(old) = superseded {
                    info!(session_id, old = %old.id, new = %req.id, "pending request superseded");
                    self.rendezvous.cancel_request(session_id, &old.id);
                }

                if req.kind == NotificationType::Permission || req.tool_name.is_some() {
                    self.store
                        .create_permission_request(
                            req.id.clone(),
                            session_id.to_string(),
                            req.tool_name.clone(),
                            req.tool_input.clone(),
                            Some(req.message.clone()),
                            req.external_message_id,
                        )
                        .await?;
                }
            }
            None => {
                let removed = self
                    .pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(session_id);
                if removed.is_none() {
                    return self.get(session_id).await;
                }
            }
        }
        let session = self.get(session_id).await?;
        self.emit_sessions_update().await;
        Ok(session)
    }

    /// Record the bot-surface message id on the cached pending request.
    pub async fn set_pending_external_id(&self, session_id: &str, message_id: i64) -> Result<()> {
        let request_id = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            match pending.get_mut(session_id) {
                Some(req) => {
                    req.external_message_id = Some(message_id);
                    Some(req.id.clone())
                }
                None => None,
            }
        };
        if let Some(id) = request_id {
            self.store.set_permission_external_id(&id, message_id).await?;
        }
        Ok(())
    }

    pub fn pending_request(&self, session_id: &str) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned()
    }

    // ── Removal ───────────────────────────────────────────────────────────────

    /// Delete a session: cascade the database rows, cancel its waits and
    /// drop its parked responses.
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        self.rendezvous.purge_session(session_id);

        let deleted = self.store.delete_session(session_id).await?;
        if deleted {
            info!(session_id, "session removed");
            self.emit_sessions_update().await;
        }
        Ok(deleted)
    }

    pub async fn rename(&self, session_id: &str, name: String) -> Result<Option<Session>> {
        match self.store.rename_session(session_id, name).await? {
            Some(row) => {
                let session = self.attach_pending(row).await?;
                self.emit_sessions_update().await;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    // ── Message queue ─────────────────────────────────────────────────────────

    pub async fn queue_message(
        &self,
        session_id: &str,
        content: String,
        source: String,
    ) -> Result<QueuedMessageRow> {
        let row = self.store.enqueue_message(session_id, content, source).await?;
        info!(session_id, source = %row.source, "message queued");
        self.emit_queue_updated(session_id).await;
        Ok(row)
    }

    pub async fn get_queued_messages(&self, session_id: &str) -> Result<Vec<QueuedMessageRow>> {
        self.store.pending_messages(session_id).await
    }

    pub async fn get_next_queued_message(
        &self,
        session_id: &str,
    ) -> Result<Option<QueuedMessageRow>> {
        self.store.next_pending_message(session_id).await
    }

    pub async fn mark_message_sent(&self, session_id: &str, message_id: i64) -> Result<bool> {
        let changed = self.store.mark_message_sent(message_id).await?;
        if changed {
            self.emit_queue_updated(session_id).await;
        }
        Ok(changed)
    }

    pub async fn cancel_queued_message(&self, session_id: &str, message_id: i64) -> Result<bool> {
        let changed = self.store.cancel_queued_message(message_id).await?;
        if changed {
            self.emit_queue_updated(session_id).await;
        }
        Ok(changed)
    }

    pub async fn clear_queue(&self, session_id: &str) -> Result<usize> {
        let count = self.store.clear_pending_messages(session_id).await?;
        if count > 0 {
            info!(session_id, count, "queue cleared");
        }
        self.emit_queue_updated(session_id).await;
        Ok(count)
    }

    pub async fn get_queue_count(&self, session_id: &str) -> Result<i64> {
        self.store.count_pending_messages(session_id).await
    }

    // ── Views & events ────────────────────────────────────────────────────────

    /// The full session list with queue counts — the `sessions_update`
    /// payload.
    pub async fn session_views(&self) -> Result<Vec<SessionView>> {
        let rows = self.store.list_sessions(true).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let queue_count = self.store.count_pending_messages(&row.id).await?;
            let session = self.attach_pending(row).await?;
            views.push(SessionView {
                session,
                queue_count,
            });
        }
        Ok(views)
    }

    pub async fn emit_sessions_update(&self) {
        match self.session_views().await {
            Ok(sessions) => self.notifier.emit(BridgeEvent::SessionsUpdate { sessions }),
            Err(e) => warn!("failed to build sessions_update: {e}"),
        }
    }

    async fn emit_queue_updated(&self, session_id: &str) {
        match self.store.pending_messages(session_id).await {
            Ok(queue) => {
                self.notifier.emit(BridgeEvent::QueueUpdated {
                    session_id: session_id.to_string(),
                    queue,
                });
                // Queue counts ride on the session list too.
                self.emit_sessions_update().await;
            }
            Err(e) => warn!(session_id, "failed to build queue_updated: {e}"),
        }
    }

    /// Row → domain session, pulling the pending request from the cache or,
    /// after a restart, from the audit table.
    async fn attach_pending(&self, row: SessionRow) -> Result<Session> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&row.id)
            .cloned();

        if pending.is_none() {
            if let Some(perm) = self.store.pending_permission_for(&row.id).await? {
                pending = Some(PendingRequest {
                    id: perm.id,
                    kind: NotificationType::Permission,
                    message: perm.message.unwrap_or_default(),
                    tool_name: perm.tool_name,
                    tool_input: perm.tool_input,
                    buttons: Vec::new(),
                    created_at: perm.created_at,
                    external_message_id: perm.external_message_id,
                });
            }
        }

        Ok(Session {
            id: row.id,
            name: row.name,
            project_dir: row.project_dir,
            status: SessionStatus::from_db(&row.status),
            control_state: ControlState::from_db(&row.control_state),
            transcript_path: row.transcript_path,
            started_at: row.created_at,
            last_activity: row.updated_at,
            pending_request: pending,
        })
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
