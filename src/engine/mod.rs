//! The enforcement engine.
//!
//! All mutable state of the daemon lives in one [`Engine`] value, driven by a
//! single thread (see [`run_loop`]). Devices move through
//! `untracked -> spoofing -> authenticated`:
//!
//! - a device whose effective policy is enforced gets a spoof entry the
//!   first time it shows up with a usable address, and every ARP request it
//!   sends is answered with our MAC for the gateway's address;
//! - live entries are re-poisoned on every refresh tick and dropped once idle;
//! - a captive-portal login moves the device to authenticated for the rest
//!   of the process lifetime and restores its cache.

mod hosts;
mod runner;
mod spoof;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime};

use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use hosts::{HostObservation, HostRecord, HostTracker};
pub use runner::{LoopContext, run_loop};
pub use spoof::{SpoofEntry, SpoofTable};

use crate::firewall::{Firewall, FirewallBackend};
use crate::metrics::{
    ARP_PACKETS_SENT, ARP_SEND_FAILURES, PORTAL_EVENTS, RECONCILIATIONS, SPOOFED_HOSTS,
    TRACKED_HOSTS,
};
use crate::network::{
    ArpInjector, ArpPacketBuilder, CanonicalMac, LinkIdentity, NULL_MAC, PacketKind,
    PacketRecord, PacketSender,
};
use crate::policy::{Policy, PolicyTable};
use crate::portal::PortalEvent;

/// Addresses of the managed interface and of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub iface_ip: Ipv4Addr,
    pub iface_mac: MacAddr,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddr,
}

impl Identity {
    pub const fn link(&self) -> LinkIdentity {
        LinkIdentity {
            our_ip: self.iface_ip,
            our_mac: self.iface_mac,
            gateway_ip: self.gateway_ip,
        }
    }

    /// Macs that are never spoofed nor classified.
    pub fn is_protected(&self, mac: MacAddr) -> bool {
        mac == self.gateway_mac || mac == self.iface_mac || mac == NULL_MAC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Active mode. When false hosts are only tracked.
    pub enforce: bool,
    pub idle_timeout: Duration,
}

/// Counters reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub packets: u64,
    pub spoof_replies: u64,
    pub spoof_requests: u64,
    pub rearps: u64,
    pub send_failures: u64,
    pub evictions: u64,
    pub authentications: u64,
    pub dropped_auth_events: u64,
    pub reconciliations: u64,
    pub dropped_observations: u64,
}

#[derive(Debug, Clone, Copy)]
enum ArpAction {
    SpoofReply,
    SpoofRequest,
    Rearp,
}

impl ArpAction {
    const fn label(self) -> &'static str {
        match self {
            Self::SpoofReply => "spoof_reply",
            Self::SpoofRequest => "spoof_request",
            Self::Rearp => "rearp",
        }
    }
}

pub struct Engine<S: PacketSender, B: FirewallBackend> {
    identity: Identity,
    settings: EngineSettings,
    policies: PolicyTable,
    hosts: HostTracker,
    spoofs: SpoofTable,
    authenticated: HashSet<MacAddr>,
    /// Evicted while idle, still poisoned until rearped at shutdown.
    evicted: BTreeMap<MacAddr, Ipv4Addr>,
    injector: ArpInjector<S>,
    firewall: Option<Firewall<B>>,
    observations: Option<mpsc::Sender<HostObservation>>,
    /// New hosts whose first observation has not been queued yet.
    unannounced: HashSet<MacAddr>,
    stats: EngineStats,
}

impl<S: PacketSender, B: FirewallBackend> Engine<S, B> {
    /// Build an engine. `firewall` is None in passive mode.
    pub fn new(
        identity: Identity,
        settings: EngineSettings,
        policies: PolicyTable,
        sender: S,
        firewall: Option<Firewall<B>>,
    ) -> Self {
        let builder = ArpPacketBuilder::new(identity.link());
        Self {
            identity,
            settings,
            policies,
            hosts: HostTracker::new(),
            spoofs: SpoofTable::new(settings.idle_timeout),
            authenticated: HashSet::new(),
            evicted: BTreeMap::new(),
            injector: ArpInjector::new(builder, sender, identity.gateway_mac),
            firewall,
            observations: None,
            unannounced: HashSet::new(),
            stats: EngineStats::default(),
        }
    }

    /// Push a [`HostObservation`] on this channel for every sighting.
    pub fn with_observations(mut self, observations: mpsc::Sender<HostObservation>) -> Self {
        self.observations = Some(observations);
        self
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    pub const fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub const fn hosts(&self) -> &HostTracker {
        &self.hosts
    }

    pub const fn spoofs(&self) -> &SpoofTable {
        &self.spoofs
    }

    pub const fn firewall(&self) -> Option<&Firewall<B>> {
        self.firewall.as_ref()
    }

    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn is_authenticated(&self, mac: MacAddr) -> bool {
        self.authenticated.contains(&mac)
    }

    /// Track the sender of a decoded frame and spoof it if its policy says so.
    pub fn handle_packet(&mut self, packet: &PacketRecord, now: Instant) {
        self.stats.packets += 1;

        // our own injected frames and gateway traffic relayed to us
        if packet.mac == self.identity.iface_mac
            || (packet.kind == PacketKind::Redirected && packet.mac == self.identity.gateway_mac)
        {
            return;
        }

        let Some(observation) =
            self.hosts
                .observe(packet.mac, packet.ip, packet.name.as_deref(), SystemTime::now())
        else {
            return;
        };
        if observation.new_host {
            info!(
                mac = %CanonicalMac(packet.mac),
                ip = %observation.ip,
                name = observation.name.as_deref().unwrap_or(""),
                "New host"
            );
            metrics::gauge!(TRACKED_HOSTS).set(self.hosts.len() as f64);
        }
        self.publish(observation);

        if !self.settings.enforce {
            return;
        }
        if self.consider_spoof(packet.mac, packet.ip, now) && packet.is_arp_request() {
            self.send(ArpAction::SpoofReply, packet.mac, packet.ip);
        }
    }

    /// Apply an event from the captive portal.
    pub fn handle_portal_event(&mut self, event: PortalEvent) {
        match event {
            PortalEvent::AuthOk(ip) => self.authenticate(ip),
        }
    }

    /// Replace the policy snapshot. Takes effect on the next reconciliation.
    pub fn apply_policies(&mut self, policies: PolicyTable) {
        info!(
            devices = policies.configured_devices().len(),
            captive_portal = policies.captive_portal_enabled(),
            "Applied policies"
        );
        self.policies = policies;
    }

    /// Rebuild the firewall exceptions and spoof state from current policy.
    pub fn reload_exceptions(&mut self, now: Instant) {
        let mut macs: BTreeMap<MacAddr, Policy> = self
            .policies
            .configured_devices()
            .into_iter()
            .map(|dev| (dev.mac, dev.policy))
            .collect();
        for mac in self.spoofs.macs() {
            macs.entry(mac).or_insert(Policy::Default);
        }

        let mut whitelisted = BTreeSet::new();
        let mut blacklisted = BTreeSet::new();

        for (mac, policy) in macs {
            if self.identity.is_protected(mac) {
                debug!(mac = %CanonicalMac(mac), "Skipping protected mac");
                continue;
            }

            match policy {
                Policy::Pass => {
                    whitelisted.insert(mac);
                    self.release(mac);
                }
                Policy::Capture => {
                    whitelisted.insert(mac);
                }
                Policy::Block => {
                    blacklisted.insert(mac);
                    if let Some(ip) = self.hosts.ip_of(mac)
                        && self.settings.enforce
                    {
                        self.consider_spoof(mac, ip, now);
                    }
                }
                Policy::CaptivePortal => {}
                Policy::Default => {
                    if self.policies.resolve(Policy::Default) == Policy::Pass {
                        self.release(mac);
                    }
                }
            }
        }

        if let Some(firewall) = self.firewall.as_mut() {
            firewall.replace_exceptions(whitelisted, blacklisted);
        }

        self.stats.reconciliations += 1;
        metrics::counter!(RECONCILIATIONS).increment(1);
        metrics::gauge!(SPOOFED_HOSTS).set(self.spoofs.len() as f64);
    }

    /// Periodic tick: drop idle entries and re-poison the rest.
    pub fn refresh(&mut self, now: Instant) {
        for (mac, entry) in self.spoofs.prune(now) {
            info!(mac = %CanonicalMac(mac), ip = %entry.target_ip, "Spoof entry idle, dropping");
            self.evicted.insert(mac, entry.target_ip);
            self.stats.evictions += 1;
        }

        for (mac, ip) in self.spoofs.active() {
            self.send(ArpAction::SpoofRequest, mac, ip);
        }
        metrics::gauge!(SPOOFED_HOSTS).set(self.spoofs.len() as f64);
    }

    /// Restore every poisoned cache and remove firewall state.
    ///
    /// Running it twice is harmless.
    pub fn shutdown(&mut self) {
        let spoofed = self.spoofs.drain();
        let evicted = std::mem::take(&mut self.evicted);
        info!(
            spoofed = spoofed.len(),
            evicted = evicted.len(),
            "Restoring poisoned hosts"
        );

        for (mac, entry) in spoofed {
            self.send(ArpAction::Rearp, mac, entry.target_ip);
        }
        for (mac, ip) in evicted {
            self.send(ArpAction::Rearp, mac, ip);
        }

        if let Some(mut firewall) = self.firewall.take() {
            firewall.teardown();
        }
        metrics::gauge!(SPOOFED_HOSTS).set(0.0);

        info!(
            packets = self.stats.packets,
            hosts = self.hosts.len(),
            spoof_replies = self.stats.spoof_replies,
            spoof_requests = self.stats.spoof_requests,
            rearps = self.stats.rearps,
            send_failures = self.stats.send_failures,
            evictions = self.stats.evictions,
            authentications = self.stats.authentications,
            reconciliations = self.stats.reconciliations,
            "Engine stopped"
        );
    }

    /// Create or refresh a spoof entry when `mac` is eligible.
    ///
    /// Returns whether `mac` is spoofed afterwards.
    fn consider_spoof(&mut self, mac: MacAddr, ip: Ipv4Addr, now: Instant) -> bool {
        if self.identity.is_protected(mac)
            || ip.is_unspecified()
            || self.authenticated.contains(&mac)
        {
            return false;
        }

        let policy = self.policies.get_policy(mac);
        if !policy.is_enforced() {
            return false;
        }

        if self.spoofs.touch(mac, ip, now) {
            self.evicted.remove(&mac);
            info!(mac = %CanonicalMac(mac), %ip, %policy, "Spoofing host");
            metrics::gauge!(SPOOFED_HOSTS).set(self.spoofs.len() as f64);
        }
        true
    }

    /// Stop spoofing `mac`, restoring its cache if it had a live entry.
    fn release(&mut self, mac: MacAddr) {
        if let Some(entry) = self.spoofs.remove(mac) {
            info!(mac = %CanonicalMac(mac), ip = %entry.target_ip, "Host no longer enforced");
            self.send(ArpAction::Rearp, mac, entry.target_ip);
        }
    }

    fn authenticate(&mut self, ip: Ipv4Addr) {
        let Some(mac) = self.hosts.mac_for_ip(ip) else {
            warn!(%ip, "Portal login from unknown address, dropping");
            self.drop_auth_event("unresolved");
            return;
        };

        if self.identity.is_protected(mac) {
            warn!(%ip, mac = %CanonicalMac(mac), "Portal login from protected mac, dropping");
            self.drop_auth_event("protected");
            return;
        }

        let policy = self.policies.get_policy(mac);
        if policy != Policy::CaptivePortal {
            info!(%ip, mac = %CanonicalMac(mac), %policy, "Portal login for host outside the portal, dropping");
            self.drop_auth_event("policy_mismatch");
            return;
        }

        if self.authenticated.insert(mac) {
            info!(%ip, mac = %CanonicalMac(mac), "Host authenticated");
            self.stats.authentications += 1;
            self.spoofs.remove(mac);
            self.evicted.remove(&mac);
            self.send(ArpAction::Rearp, mac, ip);
            metrics::gauge!(SPOOFED_HOSTS).set(self.spoofs.len() as f64);
        } else {
            debug!(%ip, mac = %CanonicalMac(mac), "Repeated login for authenticated host");
        }

        if let Some(firewall) = self.firewall.as_mut() {
            firewall.add_authenticated(ip);
        }
        metrics::counter!(PORTAL_EVENTS, "outcome" => "accepted").increment(1);
    }

    fn drop_auth_event(&mut self, outcome: &'static str) {
        self.stats.dropped_auth_events += 1;
        metrics::counter!(PORTAL_EVENTS, "outcome" => outcome).increment(1);
    }

    /// Queue an observation. A host stays flagged as new until one of its
    /// observations makes it into the queue.
    fn publish(&mut self, mut observation: HostObservation) {
        let Some(observations) = &self.observations else {
            return;
        };
        let mac = observation.mac;
        if observation.new_host {
            self.unannounced.insert(mac);
        }
        observation.new_host = self.unannounced.contains(&mac);

        match observations.try_send(observation) {
            Ok(()) => {
                self.unannounced.remove(&mac);
            }
            Err(err) => {
                self.stats.dropped_observations += 1;
                debug!("Host observation dropped: {err}");
            }
        }
    }

    fn send(&mut self, action: ArpAction, mac: MacAddr, ip: Ipv4Addr) {
        let result = match action {
            ArpAction::SpoofReply => self.injector.spoof_reply(mac, ip),
            ArpAction::SpoofRequest => self.injector.spoof_request(mac, ip),
            ArpAction::Rearp => self.injector.rearp(mac, ip),
        };

        match result {
            Ok(()) => {
                match action {
                    ArpAction::SpoofReply => self.stats.spoof_replies += 1,
                    ArpAction::SpoofRequest => self.stats.spoof_requests += 1,
                    ArpAction::Rearp => self.stats.rearps += 1,
                }
                metrics::counter!(ARP_PACKETS_SENT, "kind" => action.label()).increment(1);
            }
            Err(err) => {
                self.stats.send_failures += 1;
                metrics::counter!(ARP_SEND_FAILURES).increment(1);
                warn!(mac = %CanonicalMac(mac), %ip, action = action.label(), "ARP send failed: {err}");
            }
        }
    }
}
