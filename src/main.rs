use anyhow::{Context, Result};
use clap::Parser;
use voice_relay_rs::config::RelayConfig;
use voice_relay_rs::relay::RelayServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for client connections
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    log::info!("🚀 Starting voice relay with args: {:?}", args);

    let mut config = RelayConfig::from_env().context("Failed to load relay configuration")?;
    config.bind_address = args.bind;

    RelayServer::new(config)
        .run()
        .await
        .context("Relay server failed")
}
