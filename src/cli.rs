// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "salmalm",
    about = "A personal AI gateway: multi-provider LLM routing, agent tools, durable sessions",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as a remote tool executor bound to a gateway URL.
    #[arg(long, value_name = "GATEWAY_URL")]
    pub node: Option<String>,

    /// Show a system tray icon (desktop builds only).
    #[arg(long)]
    pub tray: bool,

    /// Create a desktop shortcut (Windows only).
    #[arg(long)]
    pub shortcut: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Self-upgrade to the latest released build.
    ///
    /// Re-runs the package installer for this binary. Exits non-zero when
    /// the upgrade fails so wrapper scripts can retry or alert.
    Update,
}
