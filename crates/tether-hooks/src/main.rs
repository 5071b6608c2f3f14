// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `tether-hook` — the small binary the Agent invokes at lifecycle points.
//!
//! Reads the Agent's JSON payload from stdin, talks to the bridge over
//! HTTP, and prints the verdict JSON to stdout (stdout belongs to the
//! Agent; all logging goes to stderr).
//!
//! Failure policy, by effect:
//! - bridge unreachable or payload unparseable → **allow** (never strand
//!   the operator because the bridge is down)
//! - permission wait timed out → **deny** with a reason
//! - stop wait timed out or cancelled → allow the Agent to stop
//! - `AGENT_EXEC_MODE=1` → exit immediately (the bridge spawned this Agent
//!   itself; re-entering the rendezvous would deadlock)

mod client;
mod payload;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tracing::warn;

use client::{BridgeClient, WaitReply};
use payload::{describe_tool, session_name, HookPayload};
use tether_config::HookConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HookKind {
    SessionStart,
    UserPrompt,
    PreTool,
    PostTool,
    Notify,
    Stop,
    SubagentStop,
    SessionEnd,
}

/// Lifecycle hook client for the tether bridge.
#[derive(Parser)]
#[command(name = "tether-hook")]
struct Cli {
    /// Which lifecycle point invoked this hook.
    #[arg(value_enum)]
    kind: HookKind,
}

#[tokio::main]
async fn main() {
    // stdout carries the verdict; keep logs on stderr and quiet by default.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = HookConfig::from_env();

    // The bridge's own headless runs must not re-enter the rendezvous.
    if config.exec_mode {
        if cli.kind == HookKind::PreTool {
            print_permission(true, None);
        }
        return;
    }

    let payload = read_payload();
    let client = BridgeClient::new(&config);

    match cli.kind {
        HookKind::PreTool => pre_tool(&client, &config, payload).await,
        HookKind::Stop => stop(&client, &config, payload).await,
        HookKind::SessionStart => session_start(&client, &config, payload).await,
        HookKind::SessionEnd => session_end(&client, &config, payload).await,
        HookKind::UserPrompt => user_prompt(&client, &config, payload).await,
        HookKind::Notify => notify(&client, &config, payload).await,
        HookKind::PostTool => post_tool(&client, &config, payload).await,
        HookKind::SubagentStop => { /* subagents stop unconditionally */ }
    }
}

/// Parse stdin; a broken payload is `None` and the callers fail open.
fn read_payload() -> Option<HookPayload> {
    let mut input = String::new();
    use std::io::Read;
    if std::io::stdin().read_to_string(&mut input).is_err() {
        return None;
    }
    match serde_json::from_str::<Value>(&input) {
        Ok(value) => Some(HookPayload::new(value)),
        Err(e) => {
            warn!("unparseable hook payload: {e}");
            None
        }
    }
}

fn print_permission(allow: bool, reason: Option<&str>) {
    let mut inner = json!({
        "permissionDecision": if allow { "allow" } else { "deny" },
    });
    if let Some(reason) = reason {
        inner["permissionDecisionReason"] = json!(reason);
    }
    println!("{}", json!({ "hookSpecificOutput": inner }));
}

// ── PreToolUse ────────────────────────────────────────────────────────────────

async fn pre_tool(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else {
        print_permission(true, None);
        return;
    };
    if !client.is_available().await {
        warn!("bridge unreachable; allowing tool");
        print_permission(true, None);
        return;
    }

    let session_id = payload.session_id(config);
    let project_dir = payload.project_dir(config);
    let name = session_name(&project_dir);
    let tool_name = payload.tool_name();
    let tool_input = payload.tool_input();

    client.register_session(&session_id, &project_dir, &name).await;

    // Standing rules first — no human round-trip for a known answer.
    match client
        .allowlist_check(&session_id, &tool_name, &tool_input)
        .await
        .as_deref()
    {
        Some("allow") => {
            print_permission(true, None);
            return;
        }
        Some("deny") => {
            print_permission(false, Some("Denied by allowlist rule"));
            return;
        }
        _ => {}
    }

    client.update_status(&session_id, "waiting").await;

    let message = describe_tool(&tool_name, &tool_input);
    let request_id = client
        .notify(
            &session_id,
            &name,
            &message,
            "permission",
            json!([
                { "text": "✅ Approve", "callback": "approve" },
                { "text": "❌ Deny", "callback": "deny" },
                { "text": "✅ Approve All", "callback": "approve_all" },
            ]),
            Some(&tool_name),
            Some(&tool_input),
            config.notify_timeout,
        )
        .await;

    let Some(request_id) = request_id else {
        warn!("notify failed; allowing tool");
        print_permission(true, None);
        return;
    };

    let reply = client
        .wait_for_response(&session_id, &request_id, config.permission_timeout)
        .await;
    client.update_status(&session_id, "running").await;

    match reply {
        WaitReply::Response(response) => {
            let lowered = response.trim().to_lowercase();
            let approved = matches!(
                lowered.as_str(),
                "approve" | "approve_all" | "yes" | "y" | "ok" | "allow"
            );
            if approved {
                print_permission(true, None);
            } else {
                print_permission(false, Some(&format!("Denied by operator: {response}")));
            }
        }
        WaitReply::Timeout => {
            print_permission(false, Some("Permission request timed out"));
        }
        // Cancellation is the bridge shutting the wait down, not a refusal.
        WaitReply::Cancelled | WaitReply::Unreachable => {
            print_permission(true, None);
        }
    }
}

// ── Stop ──────────────────────────────────────────────────────────────────────

async fn stop(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else {
        return; // allow the stop
    };
    if payload.stop_hook_active() {
        return; // already inside a stop-hook loop
    }
    if !client.is_available().await {
        return;
    }

    let session_id = payload.session_id(config);
    let project_dir = payload.project_dir(config);
    let name = session_name(&project_dir);

    client.register_session(&session_id, &project_dir, &name).await;

    if let Some(summary) = payload.summary() {
        client.add_chat_message(&session_id, "assistant", &summary).await;
    }
    client.update_status(&session_id, "waiting").await;

    let message = match payload.summary() {
        Some(summary) => {
            let preview: String = summary.chars().take(500).collect();
            format!("Session finished:\n{preview}\n\nReply to continue, or ignore to let it stop.")
        }
        None => "Session finished. Reply to continue, or ignore to let it stop.".to_string(),
    };

    let request_id = client
        .notify(
            &session_id, &name, &message, "stop",
            json!([]),
            None,
            None,
            config.notify_timeout,
        )
        .await;

    let Some(request_id) = request_id else {
        return;
    };

    match client
        .wait_for_response(&session_id, &request_id, config.default_timeout)
        .await
    {
        WaitReply::Response(instruction) => {
            client.update_status(&session_id, "running").await;
            // Block the stop and hand the instruction back as context.
            println!(
                "{}",
                json!({ "decision": "block", "reason": instruction })
            );
        }
        // Timeout, cancellation, outage: the Agent may stop.
        WaitReply::Timeout | WaitReply::Cancelled | WaitReply::Unreachable => {}
    }
}

// ── The small ones ────────────────────────────────────────────────────────────

async fn session_start(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else { return };
    let session_id = payload.session_id(config);
    let project_dir = payload.project_dir(config);
    client
        .register_session(&session_id, &project_dir, &session_name(&project_dir))
        .await;
}

async fn session_end(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else { return };
    let session_id = payload.session_id(config);
    client.update_status(&session_id, "stopped").await;
}

async fn user_prompt(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else { return };
    let Some(prompt) = payload.prompt() else { return };
    let session_id = payload.session_id(config);
    client.cli_thinking(&session_id, &prompt).await;
}

async fn notify(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else { return };
    let Some(message) = payload.message() else { return };
    let session_id = payload.session_id(config);
    let project_dir = payload.project_dir(config);
    let name = session_name(&project_dir);
    client.register_session(&session_id, &project_dir, &name).await;
    client
        .notify(
            &session_id, &name, &message, "info",
            json!([]),
            None,
            None,
            config.notify_timeout,
        )
        .await;
}

async fn post_tool(client: &BridgeClient, config: &HookConfig, payload: Option<HookPayload>) {
    let Some(payload) = payload else { return };
    // Activity heartbeat: keeps last_activity fresh while tools run.
    let session_id = payload.session_id(config);
    client.update_status(&session_id, "running").await;
}
