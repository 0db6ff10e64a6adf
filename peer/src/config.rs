//! Peer configuration
//!
//! Defaults, optionally overridden by a JSON file (`--config <path>`), then
//! by command-line flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tent_core::config::{load_json, parse_arg, parse_value, ConfigError};
use tent_core::{DEFAULT_CONTROL_PORT, DEFAULT_STUN_PORT};

use crate::session::{Timings, DEFAULT_KEEPALIVE, DEFAULT_STUN_RETRY};

/// Default poll timeout when the session timer is further away
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: Option<String>,
    control_port: Option<u16>,
    stun_port: Option<u16>,
    stun_retry_ms: Option<u64>,
    keepalive_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Coordinator IP
    pub server: IpAddr,
    pub control_port: u16,
    pub stun_port: u16,
    pub timings: Timings,
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: DEFAULT_CONTROL_PORT,
            stun_port: DEFAULT_STUN_PORT,
            timings: Timings {
                stun_retry: DEFAULT_STUN_RETRY,
                keepalive: DEFAULT_KEEPALIVE,
            },
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = parse_arg(args, "--config") {
            config.apply_file(load_json(&path)?)?;
        }

        if let Some(value) = parse_arg(args, "--server") {
            config.server = parse_value("--server", &value)?;
        }
        if let Some(value) = parse_arg(args, "--control-port") {
            config.control_port = parse_value("--control-port", &value)?;
        }
        if let Some(value) = parse_arg(args, "--stun-port") {
            config.stun_port = parse_value("--stun-port", &value)?;
        }
        if let Some(value) = parse_arg(args, "--stun-retry-ms") {
            config.timings.stun_retry = millis("--stun-retry-ms", parse_value("--stun-retry-ms", &value)?)?;
        }
        if let Some(value) = parse_arg(args, "--keepalive-ms") {
            config.timings.keepalive = millis("--keepalive-ms", parse_value("--keepalive-ms", &value)?)?;
        }
        if let Some(value) = parse_arg(args, "--poll-timeout-ms") {
            config.poll_timeout = Duration::from_millis(parse_value("--poll-timeout-ms", &value)?);
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(server) = file.server {
            self.server = parse_value("server", &server)?;
        }
        if let Some(port) = file.control_port {
            self.control_port = port;
        }
        if let Some(port) = file.stun_port {
            self.stun_port = port;
        }
        if let Some(ms) = file.stun_retry_ms {
            self.timings.stun_retry = millis("stun_retry_ms", ms)?;
        }
        if let Some(ms) = file.keepalive_ms {
            self.timings.keepalive = millis("keepalive_ms", ms)?;
        }
        if let Some(ms) = file.poll_timeout_ms {
            self.poll_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.control_port)
    }

    pub fn stun_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.stun_port)
    }
}

/// Timer intervals must be non-zero
fn millis(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: ms.to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}
