// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt};

use cli::{Cli, Commands};
use tether_config::Config;
use tether_core::{Notifier, PermissionEngine, RendezvousQueue, SessionRegistry};
use tether_exec::TaskExecutor;
use tether_server::AppState;
use tether_store::Store;
use tether_telegram::BotConfig;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Fatal-only startup errors: missing secrets, unopenable database.
    let config = Config::from_env().context("invalid configuration")?;
    init_logging(&config)?;

    match cli.command {
        Some(Commands::ShowConfig) => {
            print_config(&config);
            Ok(())
        }
        Some(Commands::Serve) | None => run_server(config),
    }
}

fn run_server(config: Config) -> anyhow::Result<()> {
    tokio::runtime::Runtime::new()?.block_on(async {
        let config = Arc::new(config);

        let store = Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?;
        info!(path = %config.db_path.display(), "database ready");

        let notifier = Notifier::new();
        let rendezvous = Arc::new(RendezvousQueue::new());
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            rendezvous.clone(),
            notifier.clone(),
        ));
        let engine = Arc::new(PermissionEngine::new(
            store.clone(),
            registry.clone(),
            rendezvous.clone(),
            notifier.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            notifier.clone(),
            config.agent_bin.clone(),
        ));

        let bot = match &config.telegram_bot_token {
            Some(token) => {
                if config.telegram_allowed_chat_ids.is_empty() {
                    tracing::warn!(
                        "TELEGRAM_BOT_TOKEN set but TELEGRAM_ALLOWED_CHAT_IDS is empty — \
                         the bot will refuse every chat"
                    );
                }
                info!("starting telegram bot");
                Some(tether_telegram::spawn(
                    BotConfig {
                        token: token.clone(),
                        allowed_chat_ids: config.telegram_allowed_chat_ids.clone(),
                        default_project_dir: config
                            .project_dirs
                            .first()
                            .map(|p| p.display().to_string()),
                    },
                    registry.clone(),
                    engine.clone(),
                    executor.clone(),
                    rendezvous.clone(),
                    store.clone(),
                    notifier.clone(),
                ))
            }
            None => {
                info!("no TELEGRAM_BOT_TOKEN — bot surface disabled");
                None
            }
        };

        let state = AppState {
            config,
            store,
            registry,
            rendezvous,
            engine,
            executor,
            notifier,
            bot,
        };
        tether_server::serve(state).await
    })
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

fn print_config(config: &Config) {
    let redacted = serde_json::json!({
        "host": config.host,
        "port": config.port,
        "bridge_secret": "<redacted>",
        "auth_username": config.auth_username,
        "jwt_expiry_hours": config.jwt_expiry_hours,
        "default_timeout": config.default_timeout,
        "permission_timeout": config.permission_timeout,
        "notify_timeout": config.notify_timeout,
        "web_ui_url": config.web_ui_url,
        "enable_directory_browser": config.enable_directory_browser,
        "project_dirs": config.project_dirs,
        "log_level": config.log_level,
        "log_file": config.log_file,
        "db_path": config.db_path,
        "upload_dir": config.upload_dir,
        "agent_bin": config.agent_bin,
        "telegram_configured": config.telegram_bot_token.is_some(),
        "telegram_allowed_chat_ids": config.telegram_allowed_chat_ids,
    });
    match serde_json::to_string_pretty(&redacted) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
