// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The bot itself: teloxide dispatcher for inbound updates, an outbound
//! loop for [`BotCommand`]s, and a bridge-event loop that mirrors task
//! results and remote permission decisions into the operator chats.
//!
//! # Authorization
//!
//! A static allowlist of chat ids. Updates from any other chat are ignored
//! silently — this bot controls a development machine.
//!
//! # Callback data
//!
//! Inline buttons carry `<action>:<session_id[..12]>` (Telegram caps
//! callback data at 64 bytes, so session ids are truncated; the registry
//! resolves prefixes of 8+ characters). Actions: `approve`, `deny`,
//! `approve_all` (approve + global allow rule), and `resp:<sid>:<data>`
//! for free-form notify buttons.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, ParseMode,
};
use teloxide::utils::command::BotCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::{
    BridgeEvent, Button, DecidedBy, MessageSource, Notifier, NotificationType, PermissionEngine,
    RendezvousQueue, RuleScope, Session, SessionRegistry, SessionStatus,
};
use tether_exec::{TaskExecutor, TaskRequest};
use tether_store::Store;

use crate::format;
use crate::handle::{BotCommand, BotHandle};

pub struct BotConfig {
    pub token: String,
    pub allowed_chat_ids: Vec<i64>,
    pub default_project_dir: Option<String>,
}

#[derive(Default, Clone)]
struct ChatPrefs {
    active_session: Option<String>,
    project_dir: Option<String>,
    model: Option<String>,
}

struct BotCtx {
    registry: Arc<SessionRegistry>,
    engine: Arc<PermissionEngine>,
    executor: Arc<TaskExecutor>,
    rendezvous: Arc<RendezvousQueue>,
    store: Store,
    allowed: Vec<i64>,
    prefs: Mutex<HashMap<i64, ChatPrefs>>,
    /// message_id → chat, for event-driven in-place edits.
    sent: Mutex<HashMap<i64, ChatId>>,
}

impl BotCtx {
    fn authorized(&self, chat: ChatId) -> bool {
        self.allowed.contains(&chat.0)
    }

    fn prefs(&self, chat: ChatId) -> ChatPrefs {
        self.prefs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&chat.0)
            .cloned()
            .unwrap_or_default()
    }

    fn update_prefs(&self, chat: ChatId, f: impl FnOnce(&mut ChatPrefs)) {
        let mut prefs = self.prefs.lock().unwrap_or_else(|p| p.into_inner());
        f(prefs.entry(chat.0).or_default());
    }

    /// Selector argument → session; empty selector falls back to the chat's
    /// active session, then to the only session if there is exactly one.
    async fn select_session(&self, chat: ChatId, selector: &str) -> Option<Session> {
        let selector = selector.trim();
        if !selector.is_empty() {
            return self.registry.resolve(selector).await.ok().flatten();
        }
        if let Some(active) = self.prefs(chat).active_session {
            if let Ok(Some(session)) = self.registry.get(&active).await {
                return Some(session);
            }
        }
        let all = self.registry.get_active().await.ok()?;
        if all.len() == 1 {
            return all.into_iter().next();
        }
        None
    }
}

/// Start the bot. Returns the handle the HTTP notify path uses; the
/// dispatcher, outbound loop and event mirror run as background tasks.
pub fn spawn(
    config: BotConfig,
    registry: Arc<SessionRegistry>,
    engine: Arc<PermissionEngine>,
    executor: Arc<TaskExecutor>,
    rendezvous: Arc<RendezvousQueue>,
    store: Store,
    notifier: Notifier,
) -> BotHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = BotHandle {
        tx,
        connected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    };

    let bot = Bot::new(config.token.clone());
    let ctx = Arc::new(BotCtx {
        registry,
        engine,
        executor,
        rendezvous,
        store,
        allowed: config.allowed_chat_ids.clone(),
        prefs: Mutex::new(HashMap::new()),
        sent: Mutex::new(HashMap::new()),
    });

    if let Some(dir) = config.default_project_dir {
        for chat in &config.allowed_chat_ids {
            ctx.update_prefs(ChatId(*chat), |p| p.project_dir = Some(dir.clone()));
        }
    }

    tokio::spawn(run_outbound(
        bot.clone(),
        rx,
        ctx.clone(),
        config.allowed_chat_ids.clone(),
    ));
    tokio::spawn(run_event_mirror(bot.clone(), notifier, ctx.clone()));

    handle.connected.store(true, Ordering::Relaxed);
    let connected = handle.connected.clone();
    tokio::spawn(async move {
        info!("telegram bot starting long-poll");
        let handler = dptree::entry()
            .branch(
                Update::filter_message()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(Update::filter_message().endpoint(handle_text))
            .branch(Update::filter_callback_query().endpoint(handle_callback));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![ctx])
            .default_handler(|_| async {})
            .build()
            .dispatch()
            .await;
        connected.store(false, Ordering::Relaxed);
        warn!("telegram dispatcher stopped");
    });

    handle
}

// ── Outbound: notifications from the HTTP notify path ─────────────────────────

async fn run_outbound(
    bot: Bot,
    mut rx: mpsc::Receiver<BotCommand>,
    ctx: Arc<BotCtx>,
    chats: Vec<i64>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            BotCommand::SendNotification {
                session_id,
                session_name,
                message,
                kind,
                buttons,
                reply,
            } => {
                let text = format::format_notification(&session_name, &message, kind);
                let markup = keyboard_for(&session_id, kind, &buttons);
                let mut first_id = None;
                for chat in &chats {
                    let chat = ChatId(*chat);
                    let mut req = bot
                        .send_message(chat, text.clone())
                        .parse_mode(ParseMode::Markdown);
                    if let Some(markup) = markup.clone() {
                        req = req.reply_markup(markup);
                    }
                    match req.await {
                        Ok(sent) => {
                            let id = sent.id.0 as i64;
                            ctx.sent
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .insert(id, chat);
                            first_id.get_or_insert(id);
                        }
                        Err(e) => warn!(%chat, "failed to send notification: {e}"),
                    }
                }
                let _ = reply.send(first_id);
            }
            BotCommand::EditMessage { message_id, text } => {
                let chat = ctx
                    .sent
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(&message_id)
                    .copied();
                if let Some(chat) = chat {
                    let id = teloxide::types::MessageId(message_id as i32);
                    if let Err(e) = bot.edit_message_text(chat, id, text.clone()).await {
                        debug!("failed to edit message {message_id}: {e}");
                    }
                }
            }
        }
    }
}

fn keyboard_for(
    session_id: &str,
    kind: NotificationType,
    buttons: &[Button],
) -> Option<InlineKeyboardMarkup> {
    let sid: String = session_id.chars().take(12).collect();
    if kind == NotificationType::Permission {
        let row1 = vec![
            InlineKeyboardButton::callback("✅ Approve", format!("approve:{sid}")),
            InlineKeyboardButton::callback("❌ Deny", format!("deny:{sid}")),
        ];
        let row2 = vec![InlineKeyboardButton::callback(
            "✅ Approve All",
            format!("approve_all:{sid}"),
        )];
        return Some(InlineKeyboardMarkup::new(vec![row1, row2]));
    }
    if buttons.is_empty() {
        return None;
    }
    let row = buttons
        .iter()
        .map(|b| {
            InlineKeyboardButton::callback(b.text.clone(), format!("resp:{sid}:{}", b.callback))
        })
        .collect::<Vec<_>>();
    Some(InlineKeyboardMarkup::new(vec![row]))
}

// ── Event mirror: task results & remote decisions ─────────────────────────────

async fn run_event_mirror(bot: Bot, notifier: Notifier, ctx: Arc<BotCtx>) {
    let mut rx = notifier.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(ev) => ev,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("bot event mirror lagged {n} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            BridgeEvent::TaskCompleted {
                success,
                result,
                error,
                duration_ms,
                ..
            } => {
                let text = format::format_task_result(success, &result, error.as_deref(), duration_ms);
                for chat in &ctx.allowed {
                    let _ = bot
                        .send_message(ChatId(*chat), text.clone())
                        .parse_mode(ParseMode::Markdown)
                        .await;
                }
            }
            BridgeEvent::PermissionResolved {
                request_id,
                decision,
                ..
            } => {
                // Decisions taken on another surface: rewrite the prompt so
                // stale approve/deny buttons disappear.
                let Ok(Some(req)) = ctx.store.get_permission_request(&request_id).await else {
                    continue;
                };
                if req.decided_by.as_deref() == Some("bot") {
                    continue; // the callback handler already edited it
                }
                if let Some(message_id) = req.external_message_id {
                    let chat = ctx
                        .sent
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .get(&message_id)
                        .copied();
                    if let Some(chat) = chat {
                        let verdict = if decision.starts_with("approved") { "✅" } else { "❌" };
                        let text = format!(
                            "{} {} ({})",
                            verdict,
                            req.message.as_deref().unwrap_or("permission request"),
                            decision,
                        );
                        let id = teloxide::types::MessageId(message_id as i32);
                        let _ = bot.edit_message_text(chat, id, text).await;
                    }
                }
            }
            _ => {}
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Bridge commands:")]
enum Command {
    #[command(description = "start the bot")]
    Start,
    #[command(description = "show available commands")]
    Help,
    #[command(description = "list sessions")]
    Sessions,
    #[command(description = "show session status")]
    Status(String),
    #[command(description = "set the active session")]
    Switch(String),
    #[command(description = "take remote control of a session")]
    Handoff(String),
    #[command(description = "release control back to the CLI")]
    Release(String),
    #[command(description = "show queued messages")]
    Queue(String),
    #[command(description = "let the session stop")]
    Done(String),
    #[command(description = "set project directory for fresh tasks")]
    Setproject(String),
    #[command(description = "set model for task execution")]
    Setmodel(String),
    #[command(description = "forget the continuation session for the project")]
    Clearsession,
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<BotCtx>,
) -> ResponseResult<()> {
    let chat = msg.chat.id;
    if !ctx.authorized(chat) {
        debug!(%chat, "ignoring command from unauthorized chat");
        return Ok(());
    }

    let reply = |text: String| {
        let bot = bot.clone();
        async move {
            bot.send_message(chat, text)
                .parse_mode(ParseMode::Markdown)
                .await?;
            ResponseResult::Ok(())
        }
    };

    match cmd {
        Command::Start => {
            reply(
                "🤖 *tether* — remote control for your coding agent.\n\n\
                 I notify you when a session needs attention; reply to drive it.\n\
                 /help shows all commands."
                    .to_string(),
            )
            .await?;
        }
        Command::Help => {
            reply(Command::descriptions().to_string()).await?;
        }
        Command::Sessions => {
            let sessions = ctx.registry.get_all().await.unwrap_or_default();
            let mut rows = Vec::new();
            for (i, session) in sessions.into_iter().enumerate() {
                let count = ctx
                    .registry
                    .get_queue_count(&session.id)
                    .await
                    .unwrap_or(0);
                rows.push((i + 1, session, count));
            }
            reply(format::format_session_list(&rows)).await?;
        }
        Command::Status(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => {
                let count = ctx
                    .registry
                    .get_queue_count(&session.id)
                    .await
                    .unwrap_or(0);
                reply(format::format_session_status(&session, count)).await?;
            }
            None => {
                reply("No matching session. `/sessions` lists them.".to_string()).await?;
            }
        },
        Command::Switch(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => {
                let name = session.name.clone();
                ctx.update_prefs(chat, |p| p.active_session = Some(session.id));
                reply(format!("Active session is now `{name}`.")).await?;
            }
            None => {
                reply("No matching session.".to_string()).await?;
            }
        },
        Command::Handoff(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => match ctx.registry.handoff_to_remote(&session.id).await {
                Ok(Some(_)) => {
                    reply(format!(
                        "🎮 You have control of `{}`. Messages now run as tasks.",
                        session.name
                    ))
                    .await?;
                }
                _ => {
                    reply(format!(
                        "Cannot hand off `{}` — state is {}.",
                        session.name,
                        format::control_label(session.control_state)
                    ))
                    .await?;
                }
            },
            None => {
                reply("No matching session.".to_string()).await?;
            }
        },
        Command::Release(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => match ctx.registry.release_to_cli(&session.id).await {
                Ok(Some(_)) => {
                    reply(format!("🏳️ Released `{}` back to the CLI.", session.name)).await?;
                }
                _ => {
                    reply(format!("`{}` is not under remote control.", session.name)).await?;
                }
            },
            None => {
                reply("No matching session.".to_string()).await?;
            }
        },
        Command::Queue(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => {
                let messages = ctx
                    .registry
                    .get_queued_messages(&session.id)
                    .await
                    .unwrap_or_default();
                if messages.is_empty() {
                    reply(format!("Queue for `{}` is empty.", session.name)).await?;
                } else {
                    let mut lines = vec![format!("📬 Queue for `{}`:", session.name)];
                    for (i, m) in messages.iter().enumerate() {
                        let preview: String = m.content.chars().take(60).collect();
                        lines.push(format!("{}. {preview}", i + 1));
                    }
                    reply(lines.join("\n")).await?;
                }
            }
            None => {
                reply("No matching session.".to_string()).await?;
            }
        },
        Command::Done(selector) => match ctx.select_session(chat, &selector).await {
            Some(session) => {
                // Resolves any stop-hook wait as a cancellation, which the
                // hook translates into "allow the Agent to stop".
                ctx.rendezvous.cancel_all_waits(&session.id);
                reply(format!("🏁 `{}` may stop now.", session.name)).await?;
            }
            None => {
                reply("No matching session.".to_string()).await?;
            }
        },
        Command::Setproject(path) => {
            let path = path.trim().to_string();
            if path.is_empty() {
                reply("Usage: `/setproject /absolute/path`".to_string()).await?;
            } else {
                ctx.update_prefs(chat, |p| p.project_dir = Some(path.clone()));
                reply(format!("📁 Fresh tasks will run in `{path}`.")).await?;
            }
        }
        Command::Setmodel(model) => {
            let model = model.trim().to_string();
            if model.is_empty() {
                ctx.update_prefs(chat, |p| p.model = None);
                reply("Model reset to the Agent default.".to_string()).await?;
            } else {
                ctx.update_prefs(chat, |p| p.model = Some(model.clone()));
                reply(format!("🧠 Tasks will use `{model}`.")).await?;
            }
        }
        Command::Clearsession => {
            let prefs = ctx.prefs(chat);
            match prefs.project_dir {
                Some(dir) if ctx.executor.clear_session(&dir) => {
                    reply(format!("🗑 Forgot the continuation session for `{dir}`.")).await?;
                }
                Some(dir) => {
                    reply(format!("No continuation session stored for `{dir}`.")).await?;
                }
                None => {
                    reply("No project directory set — `/setproject` first.".to_string()).await?;
                }
            }
        }
    }
    Ok(())
}

// ── Free text ─────────────────────────────────────────────────────────────────

async fn handle_text(bot: Bot, msg: Message, ctx: Arc<BotCtx>) -> ResponseResult<()> {
    let chat = msg.chat.id;
    if !ctx.authorized(chat) {
        return Ok(());
    }
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };

    let reply = |text: String| {
        let bot = bot.clone();
        async move {
            bot.send_message(chat, text)
                .parse_mode(ParseMode::Markdown)
                .await?;
            ResponseResult::Ok(())
        }
    };

    if let Some(session) = ctx.select_session(chat, "").await {
        // An outstanding question takes priority: the text is the answer.
        if let Some(pending) = &session.pending_request {
            let lowered = text.trim().to_lowercase();
            if pending.kind == NotificationType::Permission
                && matches!(lowered.as_str(), "approve" | "yes" | "y" | "ok" | "allow" | "deny" | "no" | "n")
            {
                let approved = !matches!(lowered.as_str(), "deny" | "no" | "n");
                let _ = ctx
                    .engine
                    .resolve(&session.id, &pending.id, approved, None, DecidedBy::Bot)
                    .await;
                reply(if approved { "✅ Approved.".into() } else { "❌ Denied.".into() }).await?;
            } else {
                ctx.rendezvous
                    .deliver_response(&session.id, Some(&pending.id), text);
                let _ = ctx.registry.set_pending_request(&session.id, None).await;
                let _ = ctx
                    .registry
                    .update_status(&session.id, SessionStatus::Running)
                    .await;
                reply(format!("📨 Sent to `{}`.", session.name)).await?;
            }
            return Ok(());
        }

        if ctx
            .registry
            .should_queue_message(&session.id)
            .await
            .unwrap_or(false)
        {
            let _ = ctx
                .registry
                .queue_message(&session.id, text, MessageSource::Telegram.as_str().to_string())
                .await;
            reply(format!(
                "📥 Queued for `{}` (CLI has control — `/handoff` to run now).",
                session.name
            ))
            .await?;
            return Ok(());
        }

        if ctx
            .registry
            .can_execute_remote_task(&session.id)
            .await
            .unwrap_or(false)
        {
            let prefs = ctx.prefs(chat);
            let task_id = ctx.executor.spawn(TaskRequest {
                session_id: Some(session.id.clone()),
                model: prefs.model,
                source: MessageSource::Telegram.as_str().to_string(),
                ..TaskRequest::new(text, session.project_dir.clone())
            });
            reply(format!("🚀 Running on `{}` (task `{task_id}`)…", session.name)).await?;
            return Ok(());
        }

        reply(format!(
            "`{}` is {} — `/handoff` to take control.",
            session.name,
            format::control_label(session.control_state)
        ))
        .await?;
        return Ok(());
    }

    // No session in scope: run a fresh task in the chat's project dir.
    let prefs = ctx.prefs(chat);
    match prefs.project_dir {
        Some(dir) => {
            let task_id = ctx.executor.spawn(TaskRequest {
                model: prefs.model,
                source: MessageSource::Telegram.as_str().to_string(),
                ..TaskRequest::new(text, dir.clone())
            });
            reply(format!("🚀 Task `{task_id}` started in `{dir}`.")).await?;
        }
        None => {
            reply(
                "No session selected and no project directory set.\n\
                 `/sessions` to pick one, or `/setproject <path>`."
                    .to_string(),
            )
            .await?;
        }
    }
    Ok(())
}

// ── Button callbacks ──────────────────────────────────────────────────────────

async fn handle_callback(bot: Bot, q: CallbackQuery, ctx: Arc<BotCtx>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let chat = match &q.message {
        Some(MaybeInaccessibleMessage::Regular(m)) => m.chat.id,
        _ => return Ok(()),
    };
    if !ctx.authorized(chat) {
        return Ok(());
    }

    let mut parts = data.splitn(3, ':');
    let action = parts.next().unwrap_or_default();
    let sid = parts.next().unwrap_or_default();
    let extra = parts.next();

    let Ok(Some(session)) = ctx.registry.get(sid).await else {
        warn!(sid, "callback for unknown session");
        return Ok(());
    };
    let Some(pending) = session.pending_request.clone() else {
        debug!(session_id = %session.id, "callback with no pending request");
        return Ok(());
    };

    let verdict = match action {
        "approve" => {
            let _ = ctx
                .engine
                .resolve(&session.id, &pending.id, true, None, DecidedBy::Bot)
                .await;
            Some("✅ Approved")
        }
        "deny" => {
            let _ = ctx
                .engine
                .resolve(&session.id, &pending.id, false, None, DecidedBy::Bot)
                .await;
            Some("❌ Denied")
        }
        "approve_all" => {
            // Approve and remember: a global allow rule for this pattern.
            let _ = ctx
                .engine
                .resolve(
                    &session.id,
                    &pending.id,
                    true,
                    Some(RuleScope::Global),
                    DecidedBy::Bot,
                )
                .await;
            Some("✅ Approved (always)")
        }
        "resp" => {
            let answer = extra.unwrap_or_default();
            ctx.rendezvous
                .deliver_response(&session.id, Some(&pending.id), answer);
            let _ = ctx.registry.set_pending_request(&session.id, None).await;
            let _ = ctx
                .registry
                .update_status(&session.id, SessionStatus::Running)
                .await;
            Some("📨 Sent")
        }
        other => {
            warn!(other, "unknown callback action");
            None
        }
    };

    // Rewrite the prompt in place so the buttons disappear.
    if let (Some(verdict), Some(MaybeInaccessibleMessage::Regular(m))) = (verdict, &q.message) {
        let text = format!("{}\n\n{} — `{}`", pending.message, verdict, session.name);
        let _ = bot
            .edit_message_text(chat, m.id, text)
            .parse_mode(ParseMode::Markdown)
            .await;
    }
    Ok(())
}
