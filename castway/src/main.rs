mod config;
mod logging;
mod public_ip;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use castway_sfu::SfuManager;
use clap::Parser;
use tracing::{info, warn};

use crate::config::load_config;
use crate::server::CastwayServer;

#[derive(Parser, Debug)]
#[command(name = "castway")]
#[command(about = "WHIP/WHEP WebRTC selective forwarding server", long_about = None)]
struct Cli {
    /// Path to a YAML/TOML/JSON config file
    #[arg(long, short, env = "CASTWAY_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let mut config = load_config(cli.config)?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Castway server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Advertise the public address as a host candidate
    if config.sfu.include_public_ip {
        match public_ip::lookup_public_ip(&config.sfu.public_ip_lookup_url).await {
            Ok(ip) => {
                info!(ip = %ip, "Adding public IP to NAT 1:1 candidates");
                config.sfu.nat_1to1_ips.push(ip);
            }
            Err(e) => warn!("Skipping public IP candidate: {:#}", e),
        }
    }

    // 4. Build the routing engine
    let sfu = SfuManager::new(config.sfu.clone()).await?;

    // 5. Serve until shutdown
    CastwayServer::new(config, sfu).start().await
}
