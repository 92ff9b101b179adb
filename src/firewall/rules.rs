//! nftables statement builder.
//!
//! Every statement the daemon issues comes from here. Table, chain and set
//! names are fixed; only the managed interface, the portal port and set
//! elements vary.

use std::fmt::Display;

/// Address family of every table we touch.
pub const FAMILY: &str = "ip";

/// Prefix of every chain and set owned by the daemon.
pub const ENGINE_PREFIX: &str = "arpgate";

const DNS_PORT: u16 = 53;
const HTTP_PORT: u16 = 80;

/// Shared tables. Created if missing, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub const ALL: [Self; 2] = [Self::Nat, Self::Filter];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Filter => "filter",
        }
    }
}

/// Device classification sets, mirrored in both tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamedSet {
    /// Source IPs that passed the captive portal.
    AuthOk,
    /// MACs allowed through without the portal.
    Whitelisted,
    /// MACs whose traffic is dropped.
    Blacklisted,
}

impl NamedSet {
    pub const ALL: [Self; 3] = [Self::AuthOk, Self::Whitelisted, Self::Blacklisted];

    pub const fn name(self) -> &'static str {
        match self {
            Self::AuthOk => "arpgate_auth_ok",
            Self::Whitelisted => "arpgate_whitelisted",
            Self::Blacklisted => "arpgate_blacklisted",
        }
    }

    const fn element_type(self) -> &'static str {
        match self {
            Self::AuthOk => "ipv4_addr",
            Self::Whitelisted | Self::Blacklisted => "ether_addr",
        }
    }
}

/// Base chains owned by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Prerouting,
    Postrouting,
    Forward,
}

impl Chain {
    pub const ALL: [Self; 3] = [Self::Prerouting, Self::Postrouting, Self::Forward];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Prerouting => "arpgate_prerouting",
            Self::Postrouting => "arpgate_postrouting",
            Self::Forward => "arpgate_forward",
        }
    }

    pub const fn table(self) -> Table {
        match self {
            Self::Prerouting | Self::Postrouting => Table::Nat,
            Self::Forward => Table::Filter,
        }
    }

    const fn hook(self) -> &'static str {
        match self {
            Self::Prerouting => "type nat hook prerouting priority -100;",
            Self::Postrouting => "type nat hook postrouting priority 100;",
            Self::Forward => "type filter hook forward priority 0;",
        }
    }
}

/// Produces nftables statements for one managed interface.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    interface: String,
    portal_port: u16,
}

impl RuleBuilder {
    pub fn new(interface: impl Into<String>, portal_port: u16) -> Self {
        Self {
            interface: interface.into(),
            portal_port,
        }
    }

    pub fn add_table(&self, table: Table) -> String {
        format!("add table {FAMILY} {}", table.name())
    }

    pub fn add_set(&self, table: Table, set: NamedSet) -> String {
        format!(
            "add set {FAMILY} {} {} {{ type {}; }}",
            table.name(),
            set.name(),
            set.element_type()
        )
    }

    pub fn flush_set(&self, table: Table, set: NamedSet) -> String {
        format!("flush set {FAMILY} {} {}", table.name(), set.name())
    }

    pub fn delete_set(&self, table: Table, set: NamedSet) -> String {
        format!("delete set {FAMILY} {} {}", table.name(), set.name())
    }

    /// Add elements to a set. Returns None when there is nothing to add.
    pub fn add_elements<T: Display>(
        &self,
        table: Table,
        set: NamedSet,
        elements: impl IntoIterator<Item = T>,
    ) -> Option<String> {
        let elements: Vec<String> = elements.into_iter().map(|e| e.to_string()).collect();
        if elements.is_empty() {
            return None;
        }
        Some(format!(
            "add element {FAMILY} {} {} {{ {} }}",
            table.name(),
            set.name(),
            elements.join(", ")
        ))
    }

    pub fn add_chain(&self, chain: Chain) -> String {
        format!(
            "add chain {FAMILY} {} {} {{ {} policy accept; }}",
            chain.table().name(),
            chain.name(),
            chain.hook()
        )
    }

    pub fn flush_chain(&self, chain: Chain) -> String {
        format!("flush chain {FAMILY} {} {}", chain.table().name(), chain.name())
    }

    pub fn delete_chain(&self, chain: Chain) -> String {
        format!("delete chain {FAMILY} {} {}", chain.table().name(), chain.name())
    }

    /// Rules of a chain, in evaluation order.
    pub fn chain_rules(&self, chain: Chain) -> Vec<String> {
        let prefix = format!("add rule {FAMILY} {} {}", chain.table().name(), chain.name());
        let iface = &self.interface;
        let auth_ok = NamedSet::AuthOk.name();
        let whitelisted = NamedSet::Whitelisted.name();
        let blacklisted = NamedSet::Blacklisted.name();

        match chain {
            Chain::Prerouting => vec![format!(
                "{prefix} iifname \"{iface}\" tcp dport {HTTP_PORT} \
                 ip saddr != @{auth_ok} ether saddr != @{whitelisted} \
                 ether saddr != @{blacklisted} redirect to :{}",
                self.portal_port
            )],
            Chain::Postrouting => vec![format!("{prefix} oifname \"{iface}\" masquerade")],
            Chain::Forward => vec![
                format!("{prefix} iifname \"{iface}\" ether saddr @{blacklisted} drop"),
                format!("{prefix} iifname \"{iface}\" udp dport {DNS_PORT} accept"),
                format!("{prefix} iifname \"{iface}\" tcp dport {DNS_PORT} accept"),
                format!(
                    "{prefix} iifname \"{iface}\" ct state new \
                     ip saddr != @{auth_ok} ether saddr != @{whitelisted} drop"
                ),
            ],
        }
    }
}
