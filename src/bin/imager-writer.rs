use anyhow::{Context, Result};
use clap::Parser;
use imager_engine::config::EngineConfig;
use imager_engine::disk::LinuxDeviceHost;
use imager_engine::ipc;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Privileged writer process: flashes an image to raw devices on request of a
/// controller talking JSON lines over stdin/stdout
#[derive(Parser, Debug)]
#[clap(name = "imager-writer", author, version, about, long_about = None)]
struct Args {
    /// Engine config file (defaults to the per-user config directory)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Also write a daily log file into this directory
    #[clap(long)]
    log_dir: Option<PathBuf>,

    /// Log at debug level (overridden by RUST_LOG)
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries the protocol, so logs go to stderr
    let (file_layer, _guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "imager-writer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    info!("imager-writer {} ready", env!("CARGO_PKG_VERSION"));

    ipc::serve(
        LinuxDeviceHost::new(),
        config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
    .context("Writer session failed")
}
