// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qrelay",
    about = "Multi-tenant Claude/OpenAI-compatible gateway over the Amazon Q streaming protocol",
    version
)]
pub struct Cli {
    /// Path to an explicit config file (merged over the default locations).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (the default when no subcommand is given).
    Serve {
        /// Listen address override, e.g. `0.0.0.0:8990`.
        #[arg(long, short = 'l')]
        listen: Option<String>,
    },

    /// List the accounts in the local store with status and quota.
    Accounts,

    /// Print the effective merged configuration and exit.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
