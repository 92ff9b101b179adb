//! Link-layer capture, decoding and ARP injection.

pub mod arp;
mod capture;
pub mod decode;
pub mod mac;

pub use arp::{
    ArpInjector, ArpPacketBuilder, LinkIdentity, detect_gateway, discover_gateway_mac,
    get_interface_info,
};
pub use capture::{PacketCapture, PacketSender, PnetCapture, PnetSender, find_interface};
pub use decode::{PacketKind, PacketRecord, decode_frame};
pub use mac::{CanonicalMac, NULL_MAC};

#[cfg(test)]
pub use capture::tests as mocks;
