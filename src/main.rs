// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use qrelay_account::{AccountStore, JsonFileStore};
use qrelay_server::GatewayBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = qrelay_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::Accounts => {
                let config = qrelay_config::load(cli.config.as_deref())?;
                return list_accounts(&config).await;
            }
            Commands::Serve { listen } => {
                let config = qrelay_config::load(cli.config.as_deref())?;
                return serve(config, listen.clone()).await;
            }
        }
    }

    let config = qrelay_config::load(cli.config.as_deref())?;
    serve(config, None).await
}

async fn serve(config: qrelay_config::Config, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.server.listen.clone());
    let data_dir = config.store.resolved_data_dir();
    let store = open_store(&config).await?;

    let gateway = GatewayBuilder::new(Arc::new(config), store)
        .data_dir(data_dir)
        .build()?;

    // Shutdown on SIGINT/SIGTERM: flip the watch flag so the HTTP server
    // drains and the background tasks exit.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    });

    qrelay_server::serve(gateway, &listen, shutdown_rx).await
}

async fn open_store(config: &qrelay_config::Config) -> anyhow::Result<Arc<dyn AccountStore>> {
    let path = config
        .store
        .accounts_file
        .clone()
        .unwrap_or_else(|| config.store.resolved_data_dir().join("accounts.json"));
    let store = JsonFileStore::open(&path)
        .await
        .with_context(|| format!("opening account store {}", path.display()))?;
    tracing::info!(path = %path.display(), "account store opened");
    Ok(Arc::new(store))
}

async fn list_accounts(config: &qrelay_config::Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let accounts = store
        .list_normal_accounts(&config.pool.order, 0)
        .await
        .context("listing accounts")?;

    if accounts.is_empty() {
        println!("No eligible accounts found.");
        println!("Add accounts to the store file and restart.");
        return Ok(());
    }

    let id_w = accounts.iter().map(|a| a.id.len()).max().unwrap_or(8).max(8);
    println!(
        "{:<id_w$}  {:<10}  {:>7}  {:>7}  {:>9}  EMAIL",
        "ID",
        "STATUS",
        "USED",
        "LIMIT",
        "ERRORS",
        id_w = id_w,
    );
    println!("{}", "-".repeat(id_w + 50));
    for a in &accounts {
        println!(
            "{:<id_w$}  {:<10}  {:>7}  {:>7}  {:>9}  {}",
            a.id,
            format!("{:?}", a.status).to_lowercase(),
            a.usage_current,
            a.usage_limit,
            a.error_count,
            a.email.as_deref().unwrap_or("-"),
            id_w = id_w,
        );
    }
    println!("\nTotal: {} account(s)", accounts.len());
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv()  => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
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
