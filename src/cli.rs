// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// tether — remote-control bridge for headless AI coding-agent CLIs.
///
/// Configuration comes from the environment only (see the variable table in
/// `tether-config`). The bridge multiplexes one Agent between its own
/// terminal, a Telegram bot and a web UI: lifecycle hooks report in over
/// `/hooks/*`, humans answer from either surface, and headless tasks are
/// spawned on demand.
#[derive(Parser)]
#[command(name = "tether", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bridge server (the default when no subcommand is given).
    Serve,

    /// Print the effective configuration (secrets redacted) and exit.
    ShowConfig,
}
