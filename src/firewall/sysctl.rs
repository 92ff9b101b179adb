//! IPv4 forwarding toggle.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FirewallError;

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Reads and writes `net.ipv4.ip_forward`.
#[derive(Debug, Clone)]
pub struct IpForwarding {
    path: PathBuf,
}

impl IpForwarding {
    /// The system-wide setting under `/proc`.
    pub fn system() -> Self {
        Self::at(IP_FORWARD_PATH)
    }

    /// A setting stored at an arbitrary path.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn read(&self) -> Result<bool, FirewallError> {
        let value = fs::read_to_string(&self.path).map_err(FirewallError::Sysctl)?;
        Ok(value.trim() != "0")
    }

    pub fn write(&self, enabled: bool) -> Result<(), FirewallError> {
        let value = if enabled { "1\n" } else { "0\n" };
        fs::write(&self.path, value).map_err(FirewallError::Sysctl)
    }
}
