// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Telegram bot surface.
//!
//! The bot is one of the two remote surfaces (the other is the web socket).
//! It renders notifications as messages with inline keyboards, accepts
//! commands (`/sessions`, `/handoff`, …) and free text, and routes button
//! callbacks back into the core: permission resolutions through the
//! [`tether_core::PermissionEngine`], plain responses through the
//! rendezvous queue, and new work to the queue or the task executor.
//!
//! The rest of the bridge talks to the bot only through [`BotHandle`] — an
//! mpsc command channel with oneshot replies, so the HTTP notify path can
//! learn the Telegram message id it needs for in-place edits. Without a
//! configured token the bridge runs fine; `BotHandle` is simply absent.

mod bot;
mod format;
mod handle;

pub use bot::{spawn, BotConfig};
pub use handle::{BotCommand, BotHandle};
