// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Shared application state threaded through every handler.

use std::sync::Arc;

use tether_config::Config;
use tether_core::{Notifier, PermissionEngine, RendezvousQueue, SessionRegistry};
use tether_exec::TaskExecutor;
use tether_store::Store;
use tether_telegram::BotHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: Arc<SessionRegistry>,
    pub rendezvous: Arc<RendezvousQueue>,
    pub engine: Arc<PermissionEngine>,
    pub executor: Arc<TaskExecutor>,
    pub notifier: Notifier,
    /// Present when a bot token is configured and the adapter is running.
    pub bot: Option<BotHandle>,
}
