// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cheap-to-clone handle other components use to reach the bot task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use tether_core::{Button, NotificationType};

/// Commands consumed by the bot's outbound loop.
pub enum BotCommand {
    /// Send a notification to the operator chats. Replies with the message
    /// id of the sent prompt so it can later be edited in place.
    SendNotification {
        session_id: String,
        session_name: String,
        message: String,
        kind: NotificationType,
        buttons: Vec<Button>,
        reply: oneshot::Sender<Option<i64>>,
    },
    /// Rewrite a previously sent prompt (e.g. after resolution).
    EditMessage { message_id: i64, text: String },
}

#[derive(Clone)]
pub struct BotHandle {
    pub(crate) tx: mpsc::Sender<BotCommand>,
    pub(crate) connected: Arc<AtomicBool>,
}

impl BotHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send a notification and wait for the Telegram message id (if the
    /// send succeeded on any chat). Never blocks the caller on Telegram
    /// errors — those come back as `None`.
    pub async fn send_notification(
        &self,
        session_id: &str,
        session_name: &str,
        message: &str,
        kind: NotificationType,
        buttons: Vec<Button>,
    ) -> Option<i64> {
        let (reply, rx) = oneshot::channel();
        let cmd = BotCommand::SendNotification {
            session_id: session_id.to_string(),
            session_name: session_name.to_string(),
            message: message.to_string(),
            kind,
            buttons,
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            warn!("bot task is gone; dropping notification");
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn edit_message(&self, message_id: i64, text: String) {
        let _ = self
            .tx
            .send(BotCommand::EditMessage { message_id, text })
            .await;
    }
}
