// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Event fan-out.
//!
//! Every mutation in the registry, permission engine and task executor emits
//! one [`BridgeEvent`]; the realtime socket and the bot adapter each hold a
//! `broadcast::Receiver`. The variant names below *are* the wire
//! identifiers (`{"type": "sessions_update", ...}`).
//!
//! Delivery is best-effort: a lagging subscriber drops events and catches
//! up from the database on reconnect. Sending with no subscribers is fine —
//! nothing is connected yet.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tether_store::QueuedMessageRow;

use crate::models::{ControlState, NotificationType, Session};

/// A session plus the derived fields surfaces want alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub queue_count: i64,
}

/// Events pushed to all connected surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Full session list (with queue counts). Re-broadcast after any
    /// session mutation; idempotent at the UI.
    SessionsUpdate { sessions: Vec<SessionView> },

    /// A notify call from a hook — what the bot renders as a message with
    /// buttons and the UI renders as a banner.
    Notification {
        session_id: String,
        session_name: String,
        message: String,
        kind: NotificationType,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Chat history for a session changed; the UI refetches its page.
    ChatUpdated { session_id: String },

    /// The CLI started processing a prompt (spinner on).
    CliThinking { session_id: String, prompt: String },

    /// The CLI finished (spinner off).
    CliThinkingDone { session_id: String },

    SessionStateChanged {
        session_id: String,
        control_state: ControlState,
    },

    QueueUpdated {
        session_id: String,
        queue: Vec<QueuedMessageRow>,
    },

    TaskStarted {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        project_dir: String,
        prompt: String,
    },

    /// One parsed activity line from the running Agent child.
    TaskActivity {
        task_id: String,
        activity: serde_json::Value,
    },

    TaskCompleted {
        task_id: String,
        success: bool,
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        duration_ms: i64,
        num_turns: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    TaskCancelled { task_id: String },

    PermissionResolved {
        session_id: String,
        request_id: String,
        decision: String,
    },

    ResponseDelivered {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

/// Cheap-to-clone publish handle.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Notifier {
    /// Events are small; 1024 absorbs any realistic burst between socket
    /// reads.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Publish. Failures (no subscribers) are ignored; fan-out never
    /// propagates errors into the operation that triggered it.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
