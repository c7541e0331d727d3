//! CLI entry point: parses the configuration path, loads and validates the
//! config, installs a tracing subscriber, and drives the pipeline to
//! completion or graceful shutdown.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use edge_bridge_core::config::MainConfig;

#[derive(Parser)]
#[command(name = "edge-bridge", about = "Mirrors a public procurement catalog into a local document store")]
struct Cli {
    /// Path to the `main:`-rooted YAML configuration file.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match MainConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_for_signal.cancel();
        }
    });

    if let Err(e) = edge_bridge_core::run(config, shutdown).await {
        error!(error = %e, "pipeline exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
