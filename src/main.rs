// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use aria_config::Config;
use aria_core::{NullSpeech, Orchestrator, UserContext};
use aria_node::{NodeError, NodeState, StaticTokenAuth, TokenDigest};
use aria_store::{RedisStore, Store};
use aria_tools::ToolRegistry;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = aria_config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::GenerateToken { out } => {
            let path = out.unwrap_or_else(|| token_path(&config));
            let secret = TokenDigest::issue_to_file(&path)?;
            println!("New bearer token (shown once — save it now):\n{secret}");
            println!("Digest stored in {}", path.display());
            Ok(())
        }
        Commands::Serve { bind } => run_serve(config, bind).await,
    }
}

async fn run_serve(config: Config, bind: Option<String>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| NodeError::Config(format!("invalid bind address '{bind}': {e}")))?;

    let store = RedisStore::connect(&config.store.redis_url)
        .await
        .with_context(|| format!("connecting to redis at {}", config.store.redis_url))?;
    let store: Arc<dyn Store> = Arc::new(store);

    // Tool implementations are external; register adapters here as they are
    // brought up.  An empty registry still serves chat.
    let tools = ToolRegistry::new();

    let orchestrator = Orchestrator::new(&config, store, tools, Arc::new(NullSpeech));
    orchestrator.warmup().await;

    let auth = load_or_create_auth(&config)?;

    // Background sweep for expired sessions.
    let gc = Arc::clone(&orchestrator);
    let gc_interval = Duration::from_secs(config.session.gc_interval_s.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match gc.garbage_collect().await {
                Ok(0) => {}
                Ok(n) => info!(collected = n, "expired sessions collected"),
                Err(e) => warn!(error = %e, "session sweep failed"),
            }
            gc.mirror_breaker_state().await;
        }
    });

    let state = Arc::new(NodeState {
        orchestrator,
        auth: Arc::new(auth),
    });

    aria_node::serve(addr, state, shutdown_signal()).await?;
    info!("node stopped");
    Ok(())
}

fn load_or_create_auth(config: &Config) -> anyhow::Result<StaticTokenAuth> {
    let path = token_path(config);
    let digest = if path.is_file() {
        TokenDigest::read_from(&path)?
    } else {
        let secret = TokenDigest::issue_to_file(&path)?;
        println!("Generated bearer token (shown once — save it now):\n{secret}");
        secret.digest()
    };
    // The operator identity carries every role; a real identity provider
    // replaces StaticTokenAuth when one is attached.
    let operator = UserContext::new("operator").with_role("admin").with_role("member");
    Ok(StaticTokenAuth::new(digest, operator))
}

fn token_path(config: &Config) -> PathBuf {
    if let Some(path) = &config.server.token_file {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aria/token.yaml")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
