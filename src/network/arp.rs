//! ARP frame construction and injection.
//!
//! Enforcement relies on ARP cache poisoning: a victim is told that the
//! gateway's IP address lives at our MAC address, so its traffic transits
//! this host where the firewall decides what happens to it.
//!
//! Three frames are involved:
//!
//! 1. A forged reply, sent right after a victim asks who the gateway is,
//!    racing the genuine reply.
//! 2. A forged request, sent periodically. Receiving a request from the
//!    "gateway" makes the victim refresh its cache entry with our MAC.
//! 3. A restoring reply ("rearp") carrying the true gateway MAC, used when a
//!    device leaves enforcement and at shutdown.
//!
//! It requires root privileges and should only be used on networks you own/manage.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use pnet::datalink::NetworkInterface;
use pnet::packet::Packet;
use pnet::packet::arp::{
    ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket,
};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use super::capture::{PacketCapture, PacketSender};
use super::mac::{BROADCAST_MAC, CanonicalMac, NULL_MAC};
use crate::error::{NetworkError, Result};

/// Size of an ARP packet payload.
const ARP_PACKET_SIZE: usize = 28;

/// Size of an Ethernet header.
const ETHERNET_HEADER_SIZE: usize = 14;

/// Size of an Ethernet frame with ARP payload.
pub const ARP_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE;

/// Information about a network host discovered via ARP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// Addresses of this host and of the gateway it impersonates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIdentity {
    pub our_ip: Ipv4Addr,
    pub our_mac: MacAddr,
    pub gateway_ip: Ipv4Addr,
}

/// Builds ARP frames for spoofing and restoration.
#[derive(Debug, Clone)]
pub struct ArpPacketBuilder {
    identity: LinkIdentity,
}

impl ArpPacketBuilder {
    /// Create a new ARP packet builder.
    pub const fn new(identity: LinkIdentity) -> Self {
        Self { identity }
    }

    pub const fn identity(&self) -> &LinkIdentity {
        &self.identity
    }

    /// Build an ARP reply that tells `target_ip` that the gateway IP is at `our_mac`.
    pub fn build_spoof_reply(&self, target_ip: Ipv4Addr, target_mac: MacAddr) -> Vec<u8> {
        build_arp_frame(&ArpFrame {
            operation: ArpOperations::Reply,
            eth_source: self.identity.our_mac,
            eth_destination: target_mac,
            sender_mac: self.identity.our_mac,
            sender_ip: self.identity.gateway_ip,
            target_mac,
            target_ip,
        })
    }

    /// Build a unicast ARP request that impersonates the gateway.
    ///
    /// The victim learns the sender pair (gateway IP, our MAC) from the request
    /// itself, so this re-poisons its cache without waiting for it to ask.
    pub fn build_spoof_request(&self, target_ip: Ipv4Addr, target_mac: MacAddr) -> Vec<u8> {
        build_arp_frame(&ArpFrame {
            operation: ArpOperations::Request,
            eth_source: self.identity.our_mac,
            eth_destination: target_mac,
            sender_mac: self.identity.our_mac,
            sender_ip: self.identity.gateway_ip,
            target_mac: NULL_MAC,
            target_ip,
        })
    }

    /// Build an ARP reply to restore the real gateway's MAC address.
    pub fn build_restore_reply(
        &self,
        gateway_mac: MacAddr,
        target_ip: Ipv4Addr,
        target_mac: MacAddr,
    ) -> Vec<u8> {
        build_arp_frame(&ArpFrame {
            operation: ArpOperations::Reply,
            eth_source: gateway_mac,
            eth_destination: target_mac,
            sender_mac: gateway_mac,
            sender_ip: self.identity.gateway_ip,
            target_mac,
            target_ip,
        })
    }

    /// Build a broadcast ARP request to discover a host's MAC address.
    pub fn build_arp_request(&self, target_ip: Ipv4Addr) -> Vec<u8> {
        build_arp_frame(&ArpFrame {
            operation: ArpOperations::Request,
            eth_source: self.identity.our_mac,
            eth_destination: BROADCAST_MAC,
            sender_mac: self.identity.our_mac,
            sender_ip: self.identity.our_ip,
            target_mac: NULL_MAC,
            target_ip,
        })
    }
}

struct ArpFrame {
    operation: ArpOperation,
    eth_source: MacAddr,
    eth_destination: MacAddr,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
}

fn build_arp_frame(frame: &ArpFrame) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_FRAME_SIZE];

    // Ethernet header
    {
        let mut ethernet = MutableEthernetPacket::new(&mut buffer)
            .expect("buffer is sized for an ethernet header");
        ethernet.set_destination(frame.eth_destination);
        ethernet.set_source(frame.eth_source);
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    // ARP payload
    {
        let mut arp = MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_SIZE..])
            .expect("buffer is sized for an ARP payload");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(frame.operation);
        arp.set_sender_hw_addr(frame.sender_mac);
        arp.set_sender_proto_addr(frame.sender_ip);
        arp.set_target_hw_addr(frame.target_mac);
        arp.set_target_proto_addr(frame.target_ip);
    }

    buffer
}

/// Parse an ARP packet from an Ethernet frame.
pub fn parse_arp_packet(frame: &[u8]) -> Option<(ArpOperation, HostInfo)> {
    let ethernet = EthernetPacket::new(frame)?;

    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }

    let arp = ArpPacket::new(ethernet.payload())?;

    if arp.get_hardware_type() != ArpHardwareTypes::Ethernet
        || arp.get_protocol_type() != EtherTypes::Ipv4
    {
        return None;
    }

    let host = HostInfo {
        ip: arp.get_sender_proto_addr(),
        mac: arp.get_sender_hw_addr(),
    };

    Some((arp.get_operation(), host))
}

/// Sends forged and restoring ARP frames through a packet sender.
pub struct ArpInjector<S: PacketSender> {
    builder: ArpPacketBuilder,
    sender: S,
    gateway_mac: MacAddr,
}

impl<S: PacketSender> ArpInjector<S> {
    /// Create an injector for a gateway whose real MAC is already known.
    pub const fn new(builder: ArpPacketBuilder, sender: S, gateway_mac: MacAddr) -> Self {
        Self {
            builder,
            sender,
            gateway_mac,
        }
    }

    /// Answer a victim as if we were the gateway.
    pub fn spoof_reply(&mut self, mac: MacAddr, ip: Ipv4Addr) -> Result<()> {
        let frame = self.builder.build_spoof_reply(ip, mac);
        self.sender.send(&frame)
    }

    /// Re-poison a victim's cache with a request impersonating the gateway.
    pub fn spoof_request(&mut self, mac: MacAddr, ip: Ipv4Addr) -> Result<()> {
        let frame = self.builder.build_spoof_request(ip, mac);
        self.sender.send(&frame)
    }

    /// Point a victim back to the real gateway.
    pub fn rearp(&mut self, mac: MacAddr, ip: Ipv4Addr) -> Result<()> {
        let frame = self.builder.build_restore_reply(self.gateway_mac, ip, mac);
        self.sender.send(&frame)
    }
}

/// Resolve the gateway's MAC address by ARP.
///
/// Sends up to `attempts` broadcast requests, each followed by `wait` worth of
/// capture reads. Any ARP frame whose sender is the gateway IP settles it.
pub fn discover_gateway_mac<C, S>(
    capture: &mut C,
    sender: &mut S,
    builder: &ArpPacketBuilder,
    attempts: u32,
    wait: Duration,
) -> Result<MacAddr>
where
    C: PacketCapture,
    S: PacketSender,
{
    let identity = builder.identity();
    let request = builder.build_arp_request(identity.gateway_ip);

    for attempt in 1..=attempts {
        info!(
            gateway = %identity.gateway_ip,
            attempt,
            "Sending ARP request to discover gateway"
        );
        if let Err(err) = sender.send(&request) {
            warn!("Failed to send gateway discovery request: {err}");
        }

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            let Some(frame) = capture.next_packet() else {
                continue;
            };

            if let Some((_, host)) = parse_arp_packet(&frame)
                && host.ip == identity.gateway_ip
                && host.mac != identity.our_mac
                && host.mac != NULL_MAC
            {
                info!(
                    "Discovered gateway MAC: {} -> {}",
                    host.ip,
                    CanonicalMac(host.mac)
                );
                return Ok(host.mac);
            }
        }
        debug!(attempt, "No ARP answer from gateway yet");
    }

    Err(NetworkError::GatewayUnresolved(identity.gateway_ip).into())
}

/// Extract our IP and MAC from a network interface.
pub fn get_interface_info(interface: &NetworkInterface) -> Result<(Ipv4Addr, MacAddr)> {
    let mac = interface.mac.ok_or(NetworkError::NoInterface)?;

    let ip = interface
        .ips
        .iter()
        .find_map(|ip| match ip.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or(NetworkError::NoInterface)?;

    Ok((ip, mac))
}

/// Detect the default gateway IP address.
///
/// This reads the system routing table to find the default gateway.
pub fn detect_gateway() -> Result<Ipv4Addr> {
    let route = std::fs::read_to_string("/proc/net/route")
        .map_err(|e| NetworkError::NoGateway(format!("failed to read routing table: {e}")))?;
    parse_default_gateway(&route)
}

fn parse_default_gateway(route: &str) -> Result<Ipv4Addr> {
    for line in route.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 {
            let dest = fields[1];
            let gateway = fields[2];

            // Default route has destination 00000000
            if dest == "00000000" {
                // Gateway is in hex, little-endian
                let gw = u32::from_str_radix(gateway, 16)
                    .map_err(|e| NetworkError::NoGateway(format!("invalid gateway: {e}")))?;
                return Ok(Ipv4Addr::from(gw.to_be()));
            }
        }
    }

    Err(NetworkError::NoGateway("no default route".into()).into())
}
