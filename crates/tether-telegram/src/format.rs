// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Message formatting for the bot surface.

use tether_core::{ControlState, NotificationType, Session, SessionStatus};

pub fn status_emoji(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "🟡",
        SessionStatus::Waiting => "🟢",
        SessionStatus::Stopped => "🔴",
    }
}

pub fn kind_emoji(kind: NotificationType) -> &'static str {
    match kind {
        NotificationType::Info => "ℹ️",
        NotificationType::Warning => "⚠️",
        NotificationType::Error => "❌",
        NotificationType::Success => "✅",
        NotificationType::Permission => "🔐",
        NotificationType::Stop => "🏁",
        NotificationType::Start => "🚀",
    }
}

pub fn control_label(state: ControlState) -> &'static str {
    match state {
        ControlState::CliActive => "CLI active",
        ControlState::CliWaiting => "CLI waiting",
        ControlState::RemoteActive => "remote control",
        ControlState::Released => "released",
    }
}

pub fn format_notification(session_name: &str, message: &str, kind: NotificationType) -> String {
    format!("{} *{}*\n\n{}", kind_emoji(kind), session_name, message)
}

pub fn format_session_list(sessions: &[(usize, Session, i64)]) -> String {
    if sessions.is_empty() {
        return "📋 *No active sessions*".to_string();
    }
    let mut lines = vec!["📋 *Sessions*".to_string(), String::new()];
    for (index, session, queue_count) in sessions {
        let mut line = format!(
            "{}. {} `{}` — {}",
            index,
            status_emoji(session.status),
            session.name,
            control_label(session.control_state),
        );
        if *queue_count > 0 {
            line.push_str(&format!(" ({queue_count} queued)"));
        }
        if session.pending_request.is_some() {
            line.push_str(" ⏳");
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn format_session_status(session: &Session, queue_count: i64) -> String {
    let mut text = format!(
        "{} *{}*\nid: `{}`\ndir: `{}`\nstatus: {}\ncontrol: {}\nqueued: {}",
        status_emoji(session.status),
        session.name,
        session.id,
        session.project_dir,
        session.status,
        control_label(session.control_state),
        queue_count,
    );
    if let Some(pending) = &session.pending_request {
        text.push_str(&format!("\n⏳ pending: {}", pending.message));
    }
    text
}

pub fn format_task_result(success: bool, result: &str, error: Option<&str>, duration_ms: i64) -> String {
    if success {
        let shown: String = result.chars().take(3500).collect();
        format!("✅ *Task completed* ({} s)\n\n{}", duration_ms / 1000, shown)
    } else {
        format!(
            "❌ *Task failed*\n\n{}",
            error.unwrap_or("unknown error")
        )
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_task_block_carries_the_error() {
        let text = format_task_result(false, "", Some("agent exploded"), 0);
        assert!(text.contains("Task failed"));
        assert!(text.contains("agent exploded"));
    }

    #[test]
    fn empty_session_list_has_a_placeholder() {
        assert!(format_session_list(&[]).contains("No active sessions"));
    }
}
