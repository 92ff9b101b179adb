//! Error types for the arpgate daemon.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Main error type for arpgate operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("firewall error: {0}")]
    Firewall(#[from] FirewallError),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("read_timeout_ms must be greater than 0")]
    ZeroReadTimeout,

    #[error("observation_queue_capacity must be greater than 0")]
    ZeroObservationQueue,

    #[error("enforcement.refresh_interval_ms must be greater than 0")]
    ZeroRefreshInterval,

    #[error("enforcement.idle_timeout_secs must be greater than 0")]
    ZeroIdleTimeout,

    #[error("enforcement.portal_port must be greater than 0")]
    ZeroPortalPort,

    #[error("invalid device MAC address: {mac:?}")]
    InvalidMac { mac: String },

    #[error("device MAC address {mac:?} is the null address")]
    NullMac { mac: String },

    #[error("device MAC address {mac} is configured more than once")]
    DuplicateMac { mac: String },
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no suitable network interface found")]
    NoInterface,

    #[error("failed to open datalink channel: {0}")]
    ChannelOpen(String),

    #[error("unsupported channel type")]
    UnsupportedChannel,

    #[error("failed to send packet: {0}")]
    SendFailed(String),

    #[error("no default gateway found: {0}")]
    NoGateway(String),

    #[error("gateway {0} did not answer ARP requests")]
    GatewayUnresolved(Ipv4Addr),
}

/// Firewall command errors.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to spawn nft: {0}")]
    Spawn(#[source] io::Error),

    #[error("statement {statement:?} failed: {stderr}")]
    Rejected { statement: String, stderr: String },

    #[error("failed to access ip_forward setting: {0}")]
    Sysctl(#[source] io::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
