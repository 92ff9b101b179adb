//! MAC address helpers.

use std::fmt;

use pnet::util::MacAddr;

/// The all-zero address. Never a real device.
pub const NULL_MAC: MacAddr = MacAddr(0, 0, 0, 0, 0, 0);

/// Broadcast MAC address for ARP requests.
pub const BROADCAST_MAC: MacAddr = MacAddr(0xff, 0xff, 0xff, 0xff, 0xff, 0xff);

/// Displays a MAC address in canonical upper-case, colon-separated form.
///
/// This is the form used in logs, firewall statements and observation
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalMac(pub MacAddr);

impl fmt::Display for CanonicalMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let MacAddr(a, b, c, d, e, g) = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}
