//! Devices whose ARP cache we currently hold.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use pnet::util::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoofEntry {
    pub target_ip: Ipv4Addr,
    pub last_activity: Instant,
}

/// Spoof entries with idle expiry.
#[derive(Debug)]
pub struct SpoofTable {
    entries: BTreeMap<MacAddr, SpoofEntry>,
    idle_timeout: Duration,
}

impl SpoofTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            idle_timeout,
        }
    }

    /// Create or refresh the entry for `mac`. Returns true when created.
    pub fn touch(&mut self, mac: MacAddr, target_ip: Ipv4Addr, now: Instant) -> bool {
        match self.entries.get_mut(&mac) {
            Some(entry) => {
                entry.target_ip = target_ip;
                entry.last_activity = entry.last_activity.max(now);
                false
            }
            None => {
                self.entries.insert(
                    mac,
                    SpoofEntry {
                        target_ip,
                        last_activity: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, mac: MacAddr) -> Option<SpoofEntry> {
        self.entries.remove(&mac)
    }

    pub fn get(&self, mac: MacAddr) -> Option<&SpoofEntry> {
        self.entries.get(&mac)
    }

    pub fn contains(&self, mac: MacAddr) -> bool {
        self.entries.contains_key(&mac)
    }

    /// Drop every entry idle for at least the timeout and return them.
    pub fn prune(&mut self, now: Instant) -> Vec<(MacAddr, SpoofEntry)> {
        let idle_timeout = self.idle_timeout;
        let expired: Vec<MacAddr> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) >= idle_timeout)
            .map(|(mac, _)| *mac)
            .collect();

        expired
            .into_iter()
            .filter_map(|mac| self.entries.remove(&mac).map(|entry| (mac, entry)))
            .collect()
    }

    /// Snapshot of live entries, in mac order.
    pub fn active(&self) -> Vec<(MacAddr, Ipv4Addr)> {
        self.entries
            .iter()
            .map(|(mac, entry)| (*mac, entry.target_ip))
            .collect()
    }

    pub fn macs(&self) -> impl Iterator<Item = MacAddr> + '_ {
        self.entries.keys().copied()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(MacAddr, SpoofEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
