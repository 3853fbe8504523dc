// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "aria", about = "Multi-agent AI orchestration node", version)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (equivalent to RUST_LOG=debug).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestration node (default).
    Serve {
        /// Listen address override, e.g. 0.0.0.0:8750.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the effective merged configuration as YAML.
    ShowConfig,

    /// Mint a bearer token; only its SHA-256 digest is stored.
    GenerateToken {
        /// Token file path override.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}
