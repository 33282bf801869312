#![forbid(unsafe_code)]

//! `adapter-bridge`: WebSocket to stdio adapter bridge binary.
//!
//! Loads the listener configuration, binds one WebSocket endpoint per
//! listener, and bridges every accepted connection to its own adapter
//! process until a shutdown signal arrives.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use adapter_bridge::config::GlobalConfig;
use adapter_bridge::orchestrator::SessionManager;
use adapter_bridge::transport::BridgeListener;
use adapter_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "adapter-bridge", about = "WebSocket to stdio adapter bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("adapter-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(listeners = config.listeners.len(), "configuration loaded");

    // ── Bind every listener before accepting anything ───
    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        listeners.push(BridgeListener::bind(listener, &config.session).await?);
    }

    // ── Serve ───────────────────────────────────────────
    let ct = CancellationToken::new();
    let manager = SessionManager::new(ct.child_token());
    let mut servers = JoinSet::new();
    for listener in listeners {
        let manager = manager.clone();
        let listener_ct = ct.clone();
        servers.spawn(async move {
            let name = listener.name().to_owned();
            if let Err(err) = listener.serve(manager, listener_ct).await {
                error!(listener = %name, %err, "listener failed");
            }
        });
    }
    info!("bridge ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let remaining = manager
        .shutdown(config.session.shutdown_timeout())
        .await;
    if remaining > 0 {
        warn!(remaining, "exiting with sessions still closing");
    }

    // ── Wait for listeners ──────────────────────────────
    while let Some(joined) = servers.join_next().await {
        if let Err(err) = joined {
            error!(%err, "listener task panicked");
        }
    }
    info!("adapter-bridge shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if let Err(err) = ctrl_c.await {
                    error!(%err, "ctrl-c signal handler failed");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
