//! TENT Peer
//!
//! A rendezvous client that:
//! - Discovers its public address through the coordinator's STUN socket
//! - Announces its public and local address pair over the control connection
//! - Collects the peers it would attempt to connect to
//! - Keeps its NAT binding alive with periodic keep-alives

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

mod client;
mod config;
mod session;

use client::PeerClient;
use config::Config;

const USAGE: &str = "\
Usage: tent-peer [options]

  --config <path>            JSON config file (fields as the flags below)
  --server <ip>              Coordinator address (default 127.0.0.1)
  --control-port <port>      Coordinator TCP control port (default 8080)
  --stun-port <port>         Coordinator UDP STUN port (default 8081)
  --stun-retry-ms <n>        STUN request retry interval (default 200)
  --keepalive-ms <n>         Keep-alive interval (default 5000)
  --poll-timeout-ms <n>      Maximum poll wait (default 1000)";

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::from_args(&args)?;

    log::info!("TENT Peer starting...");
    log::info!("  Control:   {}", config.control_addr());
    log::info!("  STUN:      {}", config.stun_addr());
    log::info!("  Retry:     {:?}", config.timings.stun_retry);
    log::info!("  Keepalive: {:?}", config.timings.keepalive);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut client = PeerClient::new(&config, shutdown)?;
    if let Err(e) = client.run() {
        log::error!(
            "Peer stopped in state {}: {}",
            client.session().state(),
            e
        );
        return Err(e);
    }

    Ok(())
}
