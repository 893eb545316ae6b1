//! Node runner: load configuration, start a replica, run until interrupted.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use merkle_kv_mobile::config::Config;
use merkle_kv_mobile::Client;

/// Replicated key-value node speaking MQTT.
#[derive(Debug, Parser)]
#[command(name = "merkle_kv_mobile", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=info.
    env_logger::init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!(
        "starting node '{}' against {}:{}",
        config.node_id,
        config.mqtt.host,
        config.effective_mqtt_port()
    );

    let client = Client::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    client.shutdown().await?;
    Ok(())
}
