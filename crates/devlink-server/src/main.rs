//! devlink-server entry point.
//!
//! Loads the TOML configuration, opens a listener for every enabled
//! `[[servers]]` entry, logs connection lifecycle events, and shuts down on
//! Ctrl-C.
//!
//! ```text
//! main()
//!  └─ load_config()            -- file from --config / DEVLINK_CONFIG, or defaults
//!  └─ ServerServices
//!       ├─ initialize(ALL)     -- one listener per configured scheme
//!       └─ subscribe()         -- accept / close / received events
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use devlink_core::InstructionContext;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use devlink_server::application::ContextConsumer;
use devlink_server::infrastructure::network::{ServerEvent, ServerMask, ServerServices};
use devlink_server::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Multiplexed device-link server.
#[derive(Debug, Parser)]
#[command(
    name = "devlink-server",
    about = "Accepts device connections over tcp, ws, ssl and wss and schedules instructions to them",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "devlink.toml", env = "DEVLINK_CONFIG")]
    config: PathBuf,

    /// Log level when `RUST_LOG` is not set; overrides `log_level` from the file.
    #[arg(long, env = "DEVLINK_LOG_LEVEL")]
    log_level: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!("devlink-server starting (config {})", cli.config.display());

    let services = build_services(&config)?;
    let mut events = services.subscribe();

    let consumer: ContextConsumer = Arc::new(|ctx: &InstructionContext| {
        if ctx.success {
            debug!("{}: {} ok", ctx.device, ctx.instruction);
        } else {
            warn!(
                "{}: {} failed: {}",
                ctx.device,
                ctx.instruction,
                ctx.message.as_deref().unwrap_or("unknown error")
            );
        }
    });

    let report = services.initialize(ServerMask::ALL, Some(consumer)).await;
    for (kind, addr) in &report.started {
        info!("{kind} listening on {addr}");
    }
    for (kind, e) in &report.failed {
        error!("{kind} not started: {e}");
    }
    if report.started.is_empty() {
        anyhow::bail!("no listener could be started");
    }

    info!("devlink-server ready.  Press Ctrl-C to exit.");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("{n} lifecycle event(s) dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    services.close().await;
    info!("devlink-server stopped");
    Ok(())
}

fn build_services(config: &AppConfig) -> anyhow::Result<ServerServices> {
    let listeners = config
        .listener_configs()
        .context("invalid [[servers]] configuration")?;
    let mut services = ServerServices::new().with_pool_settings(config.pool.settings());
    for listener in listeners {
        services.configure(listener);
    }
    Ok(services)
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::Accepted { kind, endpoint } => info!("{kind}: {endpoint} connected"),
        ServerEvent::Closed { kind, endpoint } => info!("{kind}: {endpoint} disconnected"),
        ServerEvent::Received {
            kind,
            endpoint,
            frame,
        } => debug!("{kind}: {} byte(s) from {endpoint}", frame.len()),
        ServerEvent::StatusChanged {
            kind,
            endpoint,
            change,
        } => info!("{kind}: {endpoint} {:?} -> {:?}", change.from, change.to),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
