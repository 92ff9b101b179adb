//! Firewall orchestration over nftables.
//!
//! The daemon owns three chains and three sets in each of the shared `ip nat`
//! and `ip filter` tables. Whitelist and blacklist contents are always
//! rewritten in full from the current policy, so a failed statement is
//! repaired by the next reconciliation. Authenticated addresses only ever
//! grow until teardown.
//!
//! Every statement is fire-and-forget: a failure is logged and counted, never
//! retried and never returned to the caller.

pub mod rules;
mod sysctl;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;

use pnet::util::MacAddr;
use tracing::{debug, info, warn};

pub use rules::{Chain, NamedSet, RuleBuilder, Table};
pub use sysctl::IpForwarding;

#[cfg(test)]
pub use tests as mocks;

use crate::error::FirewallError;
use crate::metrics::FIREWALL_FAILURES;
use crate::network::CanonicalMac;

/// Executes one firewall statement at a time.
pub trait FirewallBackend: Send {
    /// Run a single statement synchronously.
    fn run(&mut self, statement: &str) -> Result<(), FirewallError>;
}

/// Runs statements through the `nft` command line tool.
#[derive(Debug, Clone)]
pub struct NftBackend {
    program: PathBuf,
}

impl NftBackend {
    pub fn new() -> Self {
        Self::with_program("nft")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallBackend for NftBackend {
    fn run(&mut self, statement: &str) -> Result<(), FirewallError> {
        let output = Command::new(&self.program)
            .arg(statement)
            .output()
            .map_err(FirewallError::Spawn)?;

        if !output.status.success() {
            return Err(FirewallError::Rejected {
                statement: statement.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Maintains the daemon's chains and sets.
pub struct Firewall<B: FirewallBackend> {
    backend: B,
    rules: RuleBuilder,
    forwarding: IpForwarding,
    saved_forwarding: Option<bool>,
    whitelisted: BTreeSet<MacAddr>,
    blacklisted: BTreeSet<MacAddr>,
    authenticated: BTreeSet<Ipv4Addr>,
    failures: u64,
}

impl<B: FirewallBackend> Firewall<B> {
    pub fn new(backend: B, rules: RuleBuilder, forwarding: IpForwarding) -> Self {
        Self {
            backend,
            rules,
            forwarding,
            saved_forwarding: None,
            whitelisted: BTreeSet::new(),
            blacklisted: BTreeSet::new(),
            authenticated: BTreeSet::new(),
            failures: 0,
        }
    }

    /// Macs currently expected in both whitelisted sets.
    pub const fn whitelisted(&self) -> &BTreeSet<MacAddr> {
        &self.whitelisted
    }

    /// Macs currently expected in both blacklisted sets.
    pub const fn blacklisted(&self) -> &BTreeSet<MacAddr> {
        &self.blacklisted
    }

    /// Addresses currently expected in both auth_ok sets.
    pub const fn authenticated(&self) -> &BTreeSet<Ipv4Addr> {
        &self.authenticated
    }

    /// Number of statements the backend rejected so far.
    pub const fn failures(&self) -> u64 {
        self.failures
    }

    /// Create tables, sets and chains, install rules and enable forwarding.
    ///
    /// Safe to run over state left behind by a previous instance: `add` is
    /// idempotent and chains are flushed before their rules are added.
    pub fn setup(&mut self) {
        match self.forwarding.read() {
            Ok(previous) => {
                debug!(previous, "Captured ip_forward setting");
                self.saved_forwarding = Some(previous);
            }
            Err(err) => warn!("Cannot read ip_forward, it will not be restored: {err}"),
        }
        if let Err(err) = self.forwarding.write(true) {
            warn!("Failed to enable ip_forward: {err}");
        }

        for table in Table::ALL {
            self.exec(self.rules.add_table(table));
            for set in NamedSet::ALL {
                self.exec(self.rules.add_set(table, set));
            }
        }

        for chain in Chain::ALL {
            self.exec(self.rules.add_chain(chain));
            self.exec(self.rules.flush_chain(chain));
            for rule in self.rules.chain_rules(chain) {
                self.exec(rule);
            }
        }

        info!(failures = self.failures, "Firewall rules installed");
    }

    /// Rewrite whitelisted and blacklisted sets from scratch.
    ///
    /// The caller guarantees both sets are disjoint.
    pub fn replace_exceptions(
        &mut self,
        whitelisted: BTreeSet<MacAddr>,
        blacklisted: BTreeSet<MacAddr>,
    ) {
        debug_assert!(whitelisted.is_disjoint(&blacklisted));

        for table in Table::ALL {
            for (set, members) in [
                (NamedSet::Whitelisted, &whitelisted),
                (NamedSet::Blacklisted, &blacklisted),
            ] {
                self.exec(self.rules.flush_set(table, set));
                let elements = members.iter().map(|mac| CanonicalMac(*mac));
                if let Some(statement) = self.rules.add_elements(table, set, elements) {
                    self.exec(statement);
                }
            }
        }

        debug!(
            whitelisted = whitelisted.len(),
            blacklisted = blacklisted.len(),
            "Rebuilt firewall exceptions"
        );
        self.whitelisted = whitelisted;
        self.blacklisted = blacklisted;
    }

    /// Let an authenticated source through both tables.
    pub fn add_authenticated(&mut self, ip: Ipv4Addr) {
        for table in Table::ALL {
            if let Some(statement) = self.rules.add_elements(table, NamedSet::AuthOk, [ip]) {
                self.exec(statement);
            }
        }
        self.authenticated.insert(ip);
    }

    /// Remove owned chains and sets and restore the forwarding setting.
    ///
    /// The shared tables are left in place.
    pub fn teardown(&mut self) {
        for chain in Chain::ALL {
            self.exec(self.rules.flush_chain(chain));
            self.exec(self.rules.delete_chain(chain));
        }
        for table in Table::ALL {
            for set in NamedSet::ALL {
                self.exec(self.rules.delete_set(table, set));
            }
        }

        self.whitelisted.clear();
        self.blacklisted.clear();
        self.authenticated.clear();

        if let Some(previous) = self.saved_forwarding.take() {
            match self.forwarding.write(previous) {
                Ok(()) => debug!(previous, "Restored ip_forward setting"),
                Err(err) => warn!("Failed to restore ip_forward: {err}"),
            }
        }

        info!(failures = self.failures, "Firewall state removed");
    }

    fn exec(&mut self, statement: String) {
        debug!(%statement, "nft");
        if let Err(err) = self.backend.run(&statement) {
            self.failures += 1;
            metrics::counter!(FIREWALL_FAILURES).increment(1);
            warn!("Firewall statement failed: {err}");
        }
    }
}
