//! Coordinator configuration
//!
//! Defaults, optionally overridden by a JSON file (`--config <path>`), then
//! by command-line flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tent_core::config::{load_json, parse_arg, parse_value, ConfigError};
use tent_core::{DEFAULT_CONTROL_PORT, DEFAULT_STUN_PORT};

/// Default poll timeout when no deadline is closer
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// Configuration
// ============================================================================

/// On-disk form; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    control_port: Option<u16>,
    stun_port: Option<u16>,
    idle_timeout_secs: Option<u64>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Interface both sockets bind to
    pub bind: IpAddr,
    /// TCP control port
    pub control_port: u16,
    /// UDP STUN port
    pub stun_port: u16,
    /// Drop peers silent for this long (`None` = never)
    pub idle_timeout: Option<Duration>,
    /// Upper bound on one poll wait
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            stun_port: DEFAULT_STUN_PORT,
            idle_timeout: None,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Build from `std::env::args()`-style arguments
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = parse_arg(args, "--config") {
            config.apply_file(load_json(&path)?)?;
        }

        if let Some(value) = parse_arg(args, "--bind") {
            config.bind = parse_value("--bind", &value)?;
        }
        if let Some(value) = parse_arg(args, "--control-port") {
            config.control_port = parse_value("--control-port", &value)?;
        }
        if let Some(value) = parse_arg(args, "--stun-port") {
            config.stun_port = parse_value("--stun-port", &value)?;
        }
        if let Some(value) = parse_arg(args, "--idle-timeout-secs") {
            config.idle_timeout = idle_timeout(parse_value("--idle-timeout-secs", &value)?);
        }
        if let Some(value) = parse_arg(args, "--poll-timeout-ms") {
            config.poll_timeout = Duration::from_millis(parse_value("--poll-timeout-ms", &value)?);
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(bind) = file.bind {
            self.bind = parse_value("bind", &bind)?;
        }
        if let Some(port) = file.control_port {
            self.control_port = port;
        }
        if let Some(port) = file.stun_port {
            self.stun_port = port;
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.idle_timeout = idle_timeout(secs);
        }
        if let Some(ms) = file.poll_timeout_ms {
            self.poll_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.control_port)
    }

    pub fn stun_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.stun_port)
    }
}

/// Zero disables the idle timeout
fn idle_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
