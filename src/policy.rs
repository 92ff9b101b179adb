//! Per-device access policies and their resolution.

use std::collections::BTreeMap;
use std::fmt;

use pnet::util::MacAddr;
use serde::Deserialize;

use crate::config::{Config, DeviceSettings};

/// Access decision for a single device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Full network access, never spoofed.
    Pass,
    /// Spoofed and dropped by the forward chain.
    Block,
    /// Spoofed and redirected to the portal until it authenticates.
    CaptivePortal,
    /// Spoofed but allowed, so its traffic transits this host.
    Capture,
    /// Follow the global default.
    #[default]
    Default,
}

impl Policy {
    /// Whether a device resolved to this policy has its ARP cache poisoned.
    pub const fn is_enforced(self) -> bool {
        matches!(self, Self::Block | Self::CaptivePortal | Self::Capture)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Block => "block",
            Self::CaptivePortal => "captive_portal",
            Self::Capture => "capture",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured device as seen by the enforcement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredDevice {
    pub mac: MacAddr,
    pub policy: Policy,
    pub name: Option<String>,
}

/// Snapshot of the policy-relevant part of the configuration.
///
/// Replaced wholesale on every reload. Lookups are never cached outside of
/// a single reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    captive_portal: bool,
    devices: BTreeMap<MacAddr, DeviceSettings>,
}

impl PolicyTable {
    /// Build a table from a global default and per-device settings.
    pub fn new(
        captive_portal: bool,
        devices: impl IntoIterator<Item = (MacAddr, DeviceSettings)>,
    ) -> Self {
        Self {
            captive_portal,
            devices: devices.into_iter().collect(),
        }
    }

    /// Extract the policy table from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.enforcement.captive_portal,
            config.devices.iter().map(|(mac, dev)| (*mac, dev.clone())),
        )
    }

    /// Whether unconfigured devices default to the captive portal.
    pub const fn captive_portal_enabled(&self) -> bool {
        self.captive_portal
    }

    /// The policy written in configuration for `mac`, `Default` if absent.
    pub fn explicit_policy(&self, mac: MacAddr) -> Policy {
        self.devices
            .get(&mac)
            .map_or(Policy::Default, |dev| dev.policy)
    }

    /// The effective policy for `mac`. Never returns `Policy::Default`.
    pub fn get_policy(&self, mac: MacAddr) -> Policy {
        self.resolve(self.explicit_policy(mac))
    }

    /// Resolve a possibly-default policy against the global default.
    pub const fn resolve(&self, policy: Policy) -> Policy {
        match policy {
            Policy::Default if self.captive_portal => Policy::CaptivePortal,
            Policy::Default => Policy::Pass,
            other => other,
        }
    }

    /// All devices with an entry in configuration, in mac order.
    pub fn configured_devices(&self) -> Vec<ConfiguredDevice> {
        self.devices
            .iter()
            .map(|(mac, dev)| ConfiguredDevice {
                mac: *mac,
                policy: dev.policy,
                name: dev.name.clone(),
            })
            .collect()
    }
}
