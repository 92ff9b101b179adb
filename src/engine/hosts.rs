//! Hosts seen on the segment.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::SystemTime;

use pnet::util::MacAddr;

use crate::network::NULL_MAC;

/// Everything known about one link-layer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub name: Option<String>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

/// Message pushed downstream for every observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostObservation {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub name: Option<String>,
    pub seen_at: SystemTime,
    pub new_host: bool,
}

/// Hosts keyed by mac, with a reverse index from ip.
#[derive(Debug, Default)]
pub struct HostTracker {
    hosts: HashMap<MacAddr, HostRecord>,
    by_ip: HashMap<Ipv4Addr, MacAddr>,
}

impl HostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting.
    ///
    /// Returns None for the all-zero mac. An unspecified ip refreshes the
    /// record without replacing a known address.
    pub fn observe(
        &mut self,
        mac: MacAddr,
        ip: Ipv4Addr,
        name: Option<&str>,
        seen_at: SystemTime,
    ) -> Option<HostObservation> {
        if mac == NULL_MAC {
            return None;
        }

        let name = name.filter(|n| !n.is_empty());
        let new_host = !self.hosts.contains_key(&mac);

        let record = self.hosts.entry(mac).or_insert_with(|| HostRecord {
            mac,
            ip: Ipv4Addr::UNSPECIFIED,
            name: None,
            first_seen: seen_at,
            last_seen: seen_at,
        });
        record.last_seen = seen_at;
        if let Some(name) = name {
            record.name = Some(name.to_string());
        }

        let previous_ip = record.ip;
        if !ip.is_unspecified() && ip != previous_ip {
            record.ip = ip;
        }
        let observation = HostObservation {
            mac,
            ip: record.ip,
            name: record.name.clone(),
            seen_at,
            new_host,
        };

        if !ip.is_unspecified() && ip != previous_ip {
            if self.by_ip.get(&previous_ip) == Some(&mac) {
                self.by_ip.remove(&previous_ip);
            }
            // a reassigned address belongs to its latest claimant
            if let Some(old_owner) = self.by_ip.insert(ip, mac)
                && old_owner != mac
                && let Some(old) = self.hosts.get_mut(&old_owner)
                && old.ip == ip
            {
                old.ip = Ipv4Addr::UNSPECIFIED;
            }
        }

        Some(observation)
    }

    pub fn get(&self, mac: MacAddr) -> Option<&HostRecord> {
        self.hosts.get(&mac)
    }

    /// The mac currently holding `ip`.
    pub fn mac_for_ip(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.by_ip.get(&ip).copied()
    }

    /// Known address of `mac`, if it ever announced one.
    pub fn ip_of(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.hosts
            .get(&mac)
            .map(|host| host.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
