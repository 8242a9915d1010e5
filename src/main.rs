// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::Update) = &cli.command {
        return run_update();
    }

    if cli.tray || cli.shortcut {
        // Desktop integration is provided by the platform packages; the
        // server binary itself carries no GUI toolkit.
        eprintln!("This build has no desktop integration; install the desktop package instead.");
        std::process::exit(2);
    }

    if let Some(gateway_url) = &cli.node {
        anyhow::bail!(
            "node mode (remote tool executor for {gateway_url}) requires a \
             nodes.json pairing created by the gateway; see the deployment docs"
        );
    }

    let home = salmalm_config::home_dir();
    let config = salmalm_config::load().context("loading configuration")?;
    tracing::info!(
        home = %home.display(),
        port = config.port,
        "starting salmalm"
    );

    let app = salmalm_server::App::bootstrap(config).context("bootstrap failed")?;
    salmalm_server::serve(app).await
}

/// Re-exec the installer for this package. Exit code 0 on success; the
/// installer's status otherwise.
fn run_update() -> anyhow::Result<()> {
    println!("Updating salmalm via cargo install…");
    let status = std::process::Command::new("cargo")
        .args(["install", "salmalm", "--force"])
        .status()
        .context("failed to launch cargo")?;
    if !status.success() {
        eprintln!("Update failed (installer exited with {status}).");
        std::process::exit(status.code().unwrap_or(1));
    }
    println!("Update complete. Restart salmalm to pick up the new binary.");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
