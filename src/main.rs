use std::process::ExitCode;

use clap::Parser;
use discv4_conform::{codec, config::Options, driver};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let options = Options::parse();
    let config = match options.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    info!("this node accepts neighbours payloads of up to {} entries", codec::max_neighbors());

    let target_addr = config.target.udp_addr();
    let target_id = config.target.node_id();
    let announce_ip = match config.nat {
        discv4_conform::endpoint::NatMode::ExtIp(ip) => Some(ip),
        _ => config.announce_address,
    };
    let report = match driver::run_with(
        config.bind_addr,
        config.signer,
        target_addr,
        Some(target_id),
        announce_ip,
        config.net_restrict,
    )
    .await
    {
        Ok(report) => report,
        Err(e) => {
            error!("harness failed to start: {e}");
            return ExitCode::from(1);
        }
    };

    if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
