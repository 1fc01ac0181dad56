//! Error types shared across the crate.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to an upstream resolver.
///
/// The router never surfaces these to clients directly: an upstream that
/// fails is treated as having produced no answer.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("timeout waiting for {server}")]
    Timeout { server: SocketAddr },

    #[error("I/O error talking to {server}: {source}")]
    Io {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed DNS response: {0}")]
    Malformed(&'static str),

    #[error("{server} answered with rcode {rcode}")]
    ServerFailure { server: SocketAddr, rcode: u8 },
}

/// An upstream address that cannot be parsed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpstreamAddrError {
    #[error("unsupported scheme in {0:?}, expected udp:// or tcp://")]
    UnsupportedScheme(String),

    #[error("{0:?} is not an IP address with an optional port")]
    InvalidAddress(String),
}

/// Failure loading the domestic route table.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("failed to read route table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field} address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("invalid {field}: {source}")]
    InvalidUpstream {
        field: &'static str,
        #[source]
        source: UpstreamAddrError,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
