//! TOML configuration loading.
//!
//! Follows the same raw-shadow-then-default shape used elsewhere in this
//! codebase: an all-`Option` struct absorbs whatever the file provides, and
//! [`Config::default`] fills every gap. A missing file is not an error —
//! it just means every field takes its default.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_scan_interval_secs: u64,
    pub tcp_keepalive_idle_secs: u64,
    pub tcp_keepalive_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            udp_port: 5000,
            tcp_port: 5001,
            heartbeat_timeout_secs: 60,
            heartbeat_scan_interval_secs: 10,
            tcp_keepalive_idle_secs: 30,
            tcp_keepalive_interval_secs: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct RawConfig {
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    heartbeat_timeout_secs: Option<u64>,
    heartbeat_scan_interval_secs: Option<u64>,
    tcp_keepalive_idle_secs: Option<u64>,
    tcp_keepalive_interval_secs: Option<u64>,
}

/// Loads configuration from `path`. A missing file yields [`Config::default`]
/// rather than an error; a present-but-unparsable file is an error.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };
    let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let defaults = Config::default();
    Ok(Config {
        udp_port: raw.udp_port.unwrap_or(defaults.udp_port),
        tcp_port: raw.tcp_port.unwrap_or(defaults.tcp_port),
        heartbeat_timeout_secs: raw
            .heartbeat_timeout_secs
            .unwrap_or(defaults.heartbeat_timeout_secs),
        heartbeat_scan_interval_secs: raw
            .heartbeat_scan_interval_secs
            .unwrap_or(defaults.heartbeat_scan_interval_secs),
        tcp_keepalive_idle_secs: raw
            .tcp_keepalive_idle_secs
            .unwrap_or(defaults.tcp_keepalive_idle_secs),
        tcp_keepalive_interval_secs: raw
            .tcp_keepalive_interval_secs
            .unwrap_or(defaults.tcp_keepalive_interval_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::path::Path::new("/tmp/this-file-should-not-exist-rv-coordinator.toml");
        let config = load(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_fills_gaps_with_defaults() {
        let mut file = tempfile_in_tmp("partial");
        writeln!(file.1, "tcp_port = 9001\nheartbeat_timeout_secs = 120").unwrap();
        let config = load(&file.0).unwrap();
        assert_eq!(config.tcp_port, 9001);
        assert_eq!(config.heartbeat_timeout_secs, 120);
        assert_eq!(config.udp_port, Config::default().udp_port);
        std::fs::remove_file(&file.0).ok();
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile_in_tmp("malformed");
        writeln!(file.1, "tcp_port = \"not a number\"").unwrap();
        let result = load(&file.0);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        std::fs::remove_file(&file.0).ok();
    }

    fn tempfile_in_tmp(label: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("rv-coordinator-test-{label}.toml"));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
