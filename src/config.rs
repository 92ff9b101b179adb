//! Configuration loading and validation.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pnet::util::MacAddr;
use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};
use crate::network::CanonicalMac;
use crate::policy::Policy;

/// Main configuration for the arpgate daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Network interface to manage. If None, auto-detect.
    pub interface: Option<String>,

    /// Gateway IP address. If None, read from the routing table.
    pub gateway_ip: Option<Ipv4Addr>,

    /// Upper bound on a single capture read, in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Capacity of the downstream host observation queue.
    #[serde(default = "default_observation_queue_capacity")]
    pub observation_queue_capacity: usize,

    /// Active enforcement settings.
    #[serde(default)]
    pub enforcement: EnforcementSettings,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Per-device settings keyed by MAC address.
    #[serde(default, deserialize_with = "deserialize_devices")]
    pub devices: BTreeMap<MacAddr, DeviceSettings>,
}

/// Settings for ARP spoofing, firewall and captive portal.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnforcementSettings {
    /// Active mode. When false the daemon only observes hosts.
    #[serde(default)]
    pub enabled: bool,

    /// Send unconfigured devices (and `default` ones) to the captive portal.
    #[serde(default)]
    pub captive_portal: bool,

    /// Local TCP port the portal HTTP front end listens on.
    #[serde(default = "default_portal_port")]
    pub portal_port: u16,

    /// Unix socket where the portal front end reports authentications.
    #[serde(default = "default_portal_socket")]
    pub portal_socket: PathBuf,

    /// Interval between spoof refresh ticks, in milliseconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Spoof entries idle for this long are dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            captive_portal: false,
            portal_port: default_portal_port(),
            portal_socket: default_portal_socket(),
            refresh_interval_ms: default_refresh_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl EnforcementSettings {
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

/// Settings for a single device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    #[serde(default)]
    pub policy: Policy,

    /// Friendly name shown in logs.
    pub name: Option<String>,
}

const fn default_read_timeout() -> u64 {
    500
}

const fn default_observation_queue_capacity() -> usize {
    1024
}

const fn default_portal_port() -> u16 {
    9000
}

fn default_portal_socket() -> PathBuf {
    PathBuf::from("/run/arpgate/portal.sock")
}

const fn default_refresh_interval() -> u64 {
    500
}

const fn default_idle_timeout() -> u64 {
    300
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

fn deserialize_devices<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<MacAddr, DeviceSettings>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = HashMap::<String, DeviceSettings>::deserialize(deserializer)?;
    let mut devices = BTreeMap::new();
    for (key, settings) in raw {
        let mac = parse_device_mac(&key).map_err(serde::de::Error::custom)?;
        // keys differing only in case name the same device
        if devices.insert(mac, settings).is_some() {
            return Err(serde::de::Error::custom(ValidationError::DuplicateMac {
                mac: CanonicalMac(mac).to_string(),
            }));
        }
    }
    Ok(devices)
}

fn parse_device_mac(key: &str) -> std::result::Result<MacAddr, ValidationError> {
    let mac: MacAddr = key.parse().map_err(|_| ValidationError::InvalidMac {
        mac: key.to_string(),
    })?;
    if mac == MacAddr::zero() {
        return Err(ValidationError::NullMac {
            mac: key.to_string(),
        });
    }
    Ok(mac)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.read_timeout_ms == 0 {
            return Err(ValidationError::ZeroReadTimeout);
        }

        if self.observation_queue_capacity == 0 {
            return Err(ValidationError::ZeroObservationQueue);
        }

        if self.enforcement.refresh_interval_ms == 0 {
            return Err(ValidationError::ZeroRefreshInterval);
        }

        if self.enforcement.idle_timeout_secs == 0 {
            return Err(ValidationError::ZeroIdleTimeout);
        }

        if self.enforcement.portal_port == 0 {
            return Err(ValidationError::ZeroPortalPort);
        }

        Ok(())
    }
}
