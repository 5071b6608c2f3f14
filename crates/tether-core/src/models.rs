// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Domain model. Every enum here crosses a wire (HTTP JSON, socket frames,
//! Telegram callbacks) or a database column as its lowercase string form,
//! so all of them carry serde derives with `snake_case`/lowercase renames
//! and matching `Display`/`from_db` conversions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `Display` via `as_str` — shared by the wire enums below.
macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

/// Last observed Agent state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Waiting,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
        }
    }

    /// Column → enum; anything unrecognised reads as `running`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "waiting" => Self::Waiting,
            "stopped" => Self::Stopped,
            _ => Self::Running,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may drive a session. At most one of CLI and Remote holds it at any
/// time; `Released` means nobody does until the CLI resumes or a surface
/// takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    CliActive,
    CliWaiting,
    RemoteActive,
    Released,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CliActive => "cli_active",
            Self::CliWaiting => "cli_waiting",
            Self::RemoteActive => "remote_active",
            Self::Released => "released",
        }
    }

    /// Column → enum. Unknown legacy values (the old `exec_mode` and
    /// friends) are coerced to `remote_active`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "cli_active" => Self::CliActive,
            "cli_waiting" => Self::CliWaiting,
            "released" => Self::Released,
            _ => Self::RemoteActive,
        }
    }

    /// The complete transition table. Anything not listed here — including
    /// same-state writes — is refused.
    pub fn can_transition(from: ControlState, to: ControlState) -> bool {
        use ControlState::*;
        matches!(
            (from, to),
            (CliActive, CliWaiting)
                | (CliWaiting, RemoteActive)
                | (CliActive, RemoteActive)
                | (Released, RemoteActive)
                | (RemoteActive, Released)
                | (Released, CliActive)
        )
    }
}

impl std::fmt::Display for ControlState {
    fmt_as_str!();
}

// ── Notifications & pending requests ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Warning,
    Error,
    Success,
    Permission,
    Stop,
    Start,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
            Self::Permission => "permission",
            Self::Stop => "stop",
            Self::Start => "start",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fmt_as_str!();
}

/// Inline button offered on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub callback: String,
}

/// One outstanding question from the Agent. Its `id` is also the rendezvous
/// wait key. At most one per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub buttons: Vec<Button>,
    pub created_at: DateTime<Utc>,
    /// Message id on the bot surface, so the prompt can be edited in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<i64>,
}

impl PendingRequest {
    pub fn new(kind: NotificationType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            tool_name: None,
            tool_input: None,
            buttons: Vec::new(),
            created_at: Utc::now(),
            external_message_id: None,
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// One Agent conversation as surfaces see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub project_dir: String,
    pub status: SessionStatus,
    pub control_state: ControlState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_request: Option<PendingRequest>,
}

impl Session {
    pub fn is_remote_controlled(&self) -> bool {
        self.control_state == ControlState::RemoteActive
    }
}

// ── Permissions ───────────────────────────────────────────────────────────────

/// Outcome of consulting the rule table for one tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

impl std::fmt::Display for Decision {
    fmt_as_str!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleType {
    fmt_as_str!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Session,
}

impl RuleScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for RuleScope {
    fmt_as_str!();
}

/// Who answered a permission ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecidedBy {
    Web,
    Bot,
    Hook,
    Auto,
}

impl DecidedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Bot => "bot",
            Self::Hook => "hook",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for DecidedBy {
    fmt_as_str!();
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fmt_as_str!();
}

/// Where a message or task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Cli,
    Web,
    Api,
    Queue,
    Telegram,
}

impl MessageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Web => "web",
            Self::Api => "api",
            Self::Queue => "queue",
            Self::Telegram => "telegram",
        }
    }
}

impl std::fmt::Display for MessageSource {
    fmt_as_str!();
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_state_serializes_as_snake_case() {
        let s = serde_json::to_string(&ControlState::CliWaiting).unwrap();
        assert_eq!(s, "\"cli_waiting\"");
        let back: ControlState = serde_json::from_str("\"remote_active\"").unwrap();
        assert_eq!(back, ControlState::RemoteActive);
    }

    #[test]
    fn transition_table_matches_the_design() {
        use ControlState::*;
        let allowed = [
            (CliActive, CliWaiting),
            (CliWaiting, RemoteActive),
            (CliActive, RemoteActive),
            (Released, RemoteActive),
            (RemoteActive, Released),
            (Released, CliActive),
        ];
        for from in [CliActive, CliWaiting, RemoteActive, Released] {
            for to in [CliActive, CliWaiting, RemoteActive, Released] {
                let expect = allowed.contains(&(from, to));
                assert_eq!(
                    ControlState::can_transition(from, to),
                    expect,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn same_state_is_not_a_transition() {
        for s in [
            ControlState::CliActive,
            ControlState::CliWaiting,
            ControlState::RemoteActive,
            ControlState::Released,
        ] {
            assert!(!ControlState::can_transition(s, s));
        }
    }

    #[test]
    fn legacy_control_state_coerces_to_remote_active() {
        assert_eq!(ControlState::from_db("exec_mode"), ControlState::RemoteActive);
        assert_eq!(ControlState::from_db("cli_active"), ControlState::CliActive);
    }

    #[test]
    fn pending_request_wire_shape_uses_type_key() {
        let req = PendingRequest::new(NotificationType::Permission, "allow?");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "permission");
        assert!(json.get("tool_name").is_none());
    }

    #[test]
    fn task_terminal_states() {
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
