use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;
use virt_driver::{Config, VirtDriver};

/// Host agent exposing virtual machines as orchestrator tasks.
#[derive(Debug, Parser)]
#[command(name = "virt-driver", version)]
struct Args {
    /// Path to the driver configuration file.
    #[arg(long, env = "VIRT_DRIVER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let driver = VirtDriver::setup(config)
        .await
        .wrap_err("failed to set up the virt driver")?;
    tracing::info!("Driver ready, publishing fingerprints");

    let mut fingerprints = driver.fingerprint();
    loop {
        tokio::select! {
            attrs = fingerprints.recv() => {
                match attrs {
                    Some(attrs) => {
                        let mut keys: Vec<_> = attrs.keys().collect();
                        keys.sort();
                        for key in keys {
                            tracing::debug!("fingerprint {key}={}", attrs[key]);
                        }
                        tracing::info!("Published {} fingerprint attributes", attrs.len());
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                driver.shutdown();
                break;
            }
        }
    }
    Ok(())
}
