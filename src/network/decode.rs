//! Classification of captured frames into host observations.
//!
//! Only the link-layer sender and its IPv4 address matter to the engine. A
//! frame is turned into a [`PacketRecord`] when it is:
//! - an ARP request or reply (Ethernet/IPv4),
//! - a DHCP request announcing a requested address (with optional host name),
//! - any other IPv4 frame sent to the broadcast address,
//! - an IPv4 frame addressed to our MAC, i.e. traffic redirected through us.

use std::net::Ipv4Addr;

use pnet::packet::Packet;
use pnet::packet::arp::ArpOperations;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::util::MacAddr;

use super::arp::parse_arp_packet;
use super::mac::BROADCAST_MAC;

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_BOOT_REQUEST: u8 = 1;
const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const DHCP_OPTIONS_OFFSET: usize = 240;
const DHCP_OPTION_PAD: u8 = 0;
const DHCP_OPTION_HOST_NAME: u8 = 12;
const DHCP_OPTION_REQUESTED_IP: u8 = 50;
const DHCP_OPTION_MESSAGE_TYPE: u8 = 53;
const DHCP_OPTION_END: u8 = 255;
const DHCP_MESSAGE_REQUEST: u8 = 3;

/// Host names longer than this are truncated.
const MAX_HOST_NAME_LEN: usize = 63;

/// How a frame was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    ArpRequest,
    ArpReply,
    Dhcp,
    Broadcast,
    Redirected,
}

/// A decoded frame, as consumed by the enforcement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub name: Option<String>,
    pub kind: PacketKind,
}

impl PacketRecord {
    pub const fn is_arp_request(&self) -> bool {
        matches!(self.kind, PacketKind::ArpRequest)
    }
}

/// Decode a captured Ethernet frame.
///
/// `our_mac` identifies frames that reached us because their sender was
/// spoofed. Returns None for anything the engine does not care about.
pub fn decode_frame(frame: &[u8], our_mac: MacAddr) -> Option<PacketRecord> {
    let ethernet = EthernetPacket::new(frame)?;

    match ethernet.get_ethertype() {
        EtherTypes::Arp => {
            let (operation, host) = parse_arp_packet(frame)?;
            let kind = match operation {
                ArpOperations::Request => PacketKind::ArpRequest,
                ArpOperations::Reply => PacketKind::ArpReply,
                _ => return None,
            };
            Some(PacketRecord {
                mac: host.mac,
                ip: host.ip,
                name: None,
                kind,
            })
        }
        EtherTypes::Ipv4 => decode_ipv4(&ethernet, our_mac),
        _ => None,
    }
}

fn decode_ipv4(ethernet: &EthernetPacket<'_>, our_mac: MacAddr) -> Option<PacketRecord> {
    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    if ipv4.get_version() != 4 {
        return None;
    }

    let mac = ethernet.get_source();

    if ipv4.get_next_level_protocol() == IpNextHeaderProtocols::Udp
        && let Some(udp) = UdpPacket::new(ipv4.payload())
        && udp.get_source() == DHCP_CLIENT_PORT
        && udp.get_destination() == DHCP_SERVER_PORT
    {
        // Only requests carrying an address are useful; other DHCP traffic
        // comes from 0.0.0.0.
        let (ip, name) = parse_dhcp_request(udp.payload())?;
        return Some(PacketRecord {
            mac,
            ip,
            name,
            kind: PacketKind::Dhcp,
        });
    }

    let destination = ethernet.get_destination();
    let kind = if destination == BROADCAST_MAC {
        PacketKind::Broadcast
    } else if destination == our_mac {
        PacketKind::Redirected
    } else {
        return None;
    };

    Some(PacketRecord {
        mac,
        ip: ipv4.get_source(),
        name: None,
        kind,
    })
}

/// Extract the requested address and host name from a DHCPREQUEST.
fn parse_dhcp_request(payload: &[u8]) -> Option<(Ipv4Addr, Option<String>)> {
    if payload.len() < DHCP_OPTIONS_OFFSET
        || payload[0] != DHCP_BOOT_REQUEST
        || payload[2] != 6
        || payload[236..DHCP_OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE
    {
        return None;
    }

    let mut message_type = None;
    let mut requested_ip = None;
    let mut host_name = None;

    let options = &payload[DHCP_OPTIONS_OFFSET..];
    let mut i = 0;
    while i < options.len() {
        let code = options[i];
        if code == DHCP_OPTION_END {
            break;
        }
        if code == DHCP_OPTION_PAD {
            i += 1;
            continue;
        }

        let len = usize::from(*options.get(i + 1)?);
        let value = options.get(i + 2..i + 2 + len)?;

        match code {
            DHCP_OPTION_MESSAGE_TYPE if len == 1 => message_type = Some(value[0]),
            DHCP_OPTION_REQUESTED_IP if len == 4 => {
                requested_ip = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
            }
            DHCP_OPTION_HOST_NAME => host_name = sanitize_host_name(value),
            _ => {}
        }

        i += 2 + len;
    }

    if message_type != Some(DHCP_MESSAGE_REQUEST) {
        return None;
    }

    let ip = requested_ip.filter(|ip| !ip.is_unspecified())?;
    Some((ip, host_name))
}

fn sanitize_host_name(raw: &[u8]) -> Option<String> {
    let raw = raw.split(|&b| b == 0).next().unwrap_or_default();
    let name: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_HOST_NAME_LEN)
        .collect();
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::arp::{ArpPacketBuilder, LinkIdentity};
    use pnet::packet::ethernet::MutableEthernetPacket;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::udp::MutableUdpPacket;

    const OUR_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
    const HOST_MAC: MacAddr = MacAddr(0x11, 0x22, 0x33, 0x44, 0x55, 0x66);

    /// Build an Ethernet/IPv4/UDP frame with the given payload.
    pub fn build_udp_frame(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        ports: (u16, u16),
        payload: &[u8],
    ) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let ip_len = 20 + udp_len;
        let mut buffer = vec![0u8; 14 + ip_len];

        {
            let mut eth = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth.set_source(src_mac);
            eth.set_destination(dst_mac);
            eth.set_ethertype(EtherTypes::Ipv4);
        }

        {
            let mut ipv4 = MutableIpv4Packet::new(&mut buffer[14..]).unwrap();
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(ip_len as u16);
            ipv4.set_ttl(64);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            ipv4.set_source(src_ip);
            ipv4.set_destination(dst_ip);
        }

        {
            let mut udp = MutableUdpPacket::new(&mut buffer[34..]).unwrap();
            udp.set_source(ports.0);
            udp.set_destination(ports.1);
            udp.set_length(udp_len as u16);
            udp.set_payload(payload);
        }

        buffer
    }

    /// Build a DHCP payload with the given options (code, value).
    pub fn build_dhcp_payload(options: &[(u8, &[u8])]) -> Vec<u8> {
        let mut payload = vec![0u8; DHCP_OPTIONS_OFFSET];
        payload[0] = DHCP_BOOT_REQUEST;
        payload[1] = 1;
        payload[2] = 6;
        payload[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        for (code, value) in options {
            payload.push(*code);
            payload.push(value.len() as u8);
            payload.extend_from_slice(value);
        }
        payload.push(DHCP_OPTION_END);
        payload
    }

    fn dhcp_frame(options: &[(u8, &[u8])]) -> Vec<u8> {
        build_udp_frame(
            HOST_MAC,
            BROADCAST_MAC,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            (DHCP_CLIENT_PORT, DHCP_SERVER_PORT),
            &build_dhcp_payload(options),
        )
    }

    #[test]
    fn should_decode_arp_request_sender() {
        let builder = ArpPacketBuilder::new(LinkIdentity {
            our_ip: Ipv4Addr::new(10, 0, 0, 5),
            our_mac: HOST_MAC,
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
        });
        let frame = builder.build_arp_request(Ipv4Addr::new(10, 0, 0, 1));

        let record = decode_frame(&frame, OUR_MAC).unwrap();
        assert_eq!(record.mac, HOST_MAC);
        assert_eq!(record.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert!(record.is_arp_request());
    }

    #[test]
    fn should_decode_dhcp_request_with_host_name() {
        let frame = dhcp_frame(&[
            (DHCP_OPTION_MESSAGE_TYPE, &[DHCP_MESSAGE_REQUEST]),
            (DHCP_OPTION_REQUESTED_IP, &[10, 0, 0, 42]),
            (DHCP_OPTION_HOST_NAME, b"kitchen-tablet"),
        ]);

        let record = decode_frame(&frame, OUR_MAC).unwrap();
        assert_eq!(record.kind, PacketKind::Dhcp);
        assert_eq!(record.mac, HOST_MAC);
        assert_eq!(record.ip, Ipv4Addr::new(10, 0, 0, 42));
        assert_eq!(record.name.as_deref(), Some("kitchen-tablet"));
    }

    #[test]
    fn should_ignore_dhcp_discover() {
        let frame = dhcp_frame(&[(DHCP_OPTION_MESSAGE_TYPE, &[1])]);
        assert!(decode_frame(&frame, OUR_MAC).is_none());
    }

    #[test]
    fn should_ignore_truncated_dhcp_options() {
        let mut payload = build_dhcp_payload(&[(DHCP_OPTION_MESSAGE_TYPE, &[DHCP_MESSAGE_REQUEST])]);
        payload.pop();
        payload.extend_from_slice(&[DHCP_OPTION_REQUESTED_IP, 4, 10]);
        let frame = build_udp_frame(
            HOST_MAC,
            BROADCAST_MAC,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            (DHCP_CLIENT_PORT, DHCP_SERVER_PORT),
            &payload,
        );
        assert!(decode_frame(&frame, OUR_MAC).is_none());
    }

    #[test]
    fn should_decode_broadcast_and_redirected_frames() {
        let src = Ipv4Addr::new(10, 0, 0, 7);
        let broadcast = build_udp_frame(
            HOST_MAC,
            BROADCAST_MAC,
            src,
            Ipv4Addr::new(10, 0, 0, 255),
            (137, 137),
            &[],
        );
        let record = decode_frame(&broadcast, OUR_MAC).unwrap();
        assert_eq!(record.kind, PacketKind::Broadcast);
        assert_eq!(record.ip, src);

        let redirected = build_udp_frame(
            HOST_MAC,
            OUR_MAC,
            src,
            Ipv4Addr::new(1, 1, 1, 1),
            (5000, 443),
            &[],
        );
        let record = decode_frame(&redirected, OUR_MAC).unwrap();
        assert_eq!(record.kind, PacketKind::Redirected);
    }

    #[test]
    fn should_ignore_unicast_between_other_hosts() {
        let frame = build_udp_frame(
            HOST_MAC,
            MacAddr(0x22, 0x22, 0x22, 0x22, 0x22, 0x22),
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::new(10, 0, 0, 8),
            (5000, 5001),
            &[],
        );
        assert!(decode_frame(&frame, OUR_MAC).is_none());
    }

    #[test]
    fn should_sanitize_host_names() {
        assert_eq!(sanitize_host_name(b"pc\0garbage").as_deref(), Some("pc"));
        assert_eq!(sanitize_host_name(b"  \x07 "), None);
        let long = [b'a'; 100];
        assert_eq!(sanitize_host_name(&long).unwrap().len(), MAX_HOST_NAME_LEN);
    }
}
