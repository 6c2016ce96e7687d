//! Error taxonomy for the coordinator's fallible boundaries.
//!
//! Per-frame and per-session failures never appear here — they are logged
//! and absorbed where they occur (see `session.rs`). Only the handful of
//! outcomes a caller or the host process needs to act on are typed.

use thiserror::Error;

/// A listening socket could not be bound. Fatal for the owning component
/// only; the other three activities keep running.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind UDP discovery socket on port {port}: {source}")]
    Udp {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind TCP session listener on port {port}: {source}")]
    Tcp {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of `SendCommand`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("target '{0}' is not connected")]
    NotConnected(String),
    #[error("I/O error sending command: {0}")]
    Io(#[source] std::io::Error),
}

/// Configuration file could not be loaded or parsed. Surfaced to the host
/// via log output at startup; the core never decides to exit over this.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
