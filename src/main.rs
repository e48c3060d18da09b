//! Entry point for `mllp-bridge`.
//!
//! Parses CLI arguments and dispatches into listener, client or proxy
//! mode. All protocol work lives in library modules; this file owns only
//! process setup (argument parsing, configuration load, logging init).

use clap::Parser;
use mllp_bridge::{client, Bridge, BridgeError, Hl7Settings, MllpListener, Mode};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// HL7 v2 MLLP listener, client and store-and-forward proxy.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the JSON configuration file (settings under the `Hl7` key).
    #[arg(short, long, default_value = "hl7bridge.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    let cli = Cli::parse();
    let settings = Hl7Settings::load(&cli.config)?;
    init_logging(&settings)?;

    match settings.effective_mode() {
        Mode::Proxy => {
            let handle = Bridge::spawn(settings).await?;
            wait_for_shutdown().await;
            handle.shutdown().await;
        }
        Mode::Server => {
            let handle = MllpListener::spawn(settings).await?;
            wait_for_shutdown().await;
            handle.shutdown().await;
        }
        Mode::Client => {
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                wait_for_shutdown().await;
                stop.cancel();
            });
            client::run(settings, cancel).await?;
        }
    }
    Ok(())
}

async fn wait_for_shutdown() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn init_logging(settings: &Hl7Settings) -> Result<(), BridgeError> {
    if settings.log_file_path.is_empty() {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
        return Ok(());
    }

    let date = chrono::Local::now().format("%Y%m%d").to_string();
    let path = settings.log_file_path.replace("{Date}", &date);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BridgeError::InvalidConfig(format!("cannot open log file {}: {}", path, e)))?;
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
