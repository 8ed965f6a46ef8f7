#![forbid(unsafe_code)]

//! The `audit-logd` server binary: a centralized audit log receiver.
//!
//! Bootstraps configuration and the TCP listener. Depending on the
//! configured sink, streamed session records are stored as local event
//! and I/O logs or journaled for relaying to an upstream receiver.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use audit_logd::config::GlobalConfig;
use audit_logd::eventlog::JsonlEventWriter;
use audit_logd::server;
use audit_logd::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "audit-logd", about = "Audit log receiver daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/audit-logd/config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured TCP listen address.
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("audit-logd server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen_address = listen;
    }
    if config.debug.random_drop_percent > 0.0 {
        info!(
            percent = config.debug.random_drop_percent,
            "random connection drop enabled; do not use in production"
        );
    }
    let config = Arc::new(config);

    let evlogger = Arc::new(JsonlEventWriter::new(config.eventlog.dir.clone())?);

    let ct = CancellationToken::new();
    let shutdown = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    if let Err(err) = server::run_server(config, evlogger, ct).await {
        error!(%err, "server terminated");
        return Err(err);
    }
    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}
