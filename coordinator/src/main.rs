//! TENT Coordinator
//!
//! A rendezvous server that:
//! - Answers STUN-style binding requests over UDP with the observed address
//! - Accepts peer control connections over TCP
//! - Fans out peer lists when a peer announces its address pair

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

mod config;
mod metrics;
mod peer;
mod peer_table;
mod registry;
mod server;
mod stun;

use config::Config;
use server::Server;

const USAGE: &str = "\
Usage: tent-coordinator [options]

  --config <path>            JSON config file (fields as the flags below)
  --bind <ip>                Interface to bind (default 0.0.0.0)
  --control-port <port>      TCP control port (default 8080)
  --stun-port <port>         UDP STUN port (default 8081)
  --idle-timeout-secs <n>    Drop silent peers after n seconds (default off)
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

    log::info!("TENT Coordinator starting...");
    log::info!("  Control: {}", config.control_addr());
    log::info!("  STUN:    {}", config.stun_addr());
    match config.idle_timeout {
        Some(timeout) => log::info!("  Idle:    {:?}", timeout),
        None => log::info!("  Idle:    disabled"),
    }

    // SIGINT/SIGTERM request a clean stop at the next loop iteration
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(config, shutdown)?;
    if let Err(e) = server.run() {
        log::error!("Coordinator stopped: {}", e);
        log::info!("Metrics:\n{}", server.metrics().render());
        return Err(e);
    }

    Ok(())
}
