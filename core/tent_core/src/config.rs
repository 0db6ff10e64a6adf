//! Command-line and JSON file helpers shared by the coordinator and peer

use std::fmt;

use serde::de::DeserializeOwned;

#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: String, source: std::io::Error },
    /// Config file is not valid JSON for this schema
    Json { path: String, source: serde_json::Error },
    /// A flag or field had an unusable value
    Invalid { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read {}: {}", path, source),
            ConfigError::Json { path, source } => write!(f, "invalid config {}: {}", path, source),
            ConfigError::Invalid { name, value } => write!(f, "invalid {}: {:?}", name, value),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Read and deserialize a JSON config file
pub fn load_json<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.to_string(),
        source,
    })
}

/// Parse `value`, naming the flag or field on failure
pub fn parse_value<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

/// Value following `flag` in the argument list
pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
