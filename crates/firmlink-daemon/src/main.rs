//! firmlink daemon
//!
//! Starts a bridge, logs port status changes and runs until Ctrl-C.
//! Configuration comes from the JSON file named by `FIRMLINK_CONFIG`;
//! without it the defaults apply. Log filtering follows `RUST_LOG`.

use anyhow::Context;
use firmlink_core::prelude::*;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "FIRMLINK_CONFIG";

fn load_config() -> anyhow::Result<BridgeConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => BridgeConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.to_string_lossy())),
        None => Ok(BridgeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    tracing::info!("firmlink {} at {} baud", firmlink_core::VERSION, config.baud_rate);

    let bridge = Bridge::new(config).context("starting bridge")?;
    bridge.start();

    let mut status = bridge.status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.port {
                    Some(port) if current.healthy => tracing::info!("{}: good", port),
                    Some(port) => tracing::warn!("{}: bad", port),
                    None => tracing::info!("no port"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    bridge.shutdown();
    Ok(())
}
