//! arpgate - network access control for a single LAN segment.
//!
//! arpgate sits on the same broadcast domain as the devices it controls. It
//! poisons their ARP caches so their traffic flows through this host, then
//! lets nftables decide what happens to it: pass, drop, or redirect to a
//! captive portal until the user logs in.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`policy`]: Per-device policies and global default resolution
//! - [`network`]: Packet capture, frame decoding and ARP injection
//! - [`firewall`]: nftables chains, sets and the forwarding toggle
//! - [`engine`]: Host tracking, spoof state machine and the event loop
//! - [`portal`]: Authentication events from the captive portal
//! - [`latch`]: Configuration change signal
//! - [`metrics`]: Prometheus exporter
//! - [`error`]: Error types
//!
//! # Testing
//!
//! Packet I/O and firewall commands sit behind traits, so the engine can be
//! driven without a network interface or root privileges:
//!
//! ```rust
//! use arpgate::config::DeviceSettings;
//! use arpgate::policy::{Policy, PolicyTable};
//! use pnet::util::MacAddr;
//!
//! let printer = MacAddr(0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x01);
//! let laptop = MacAddr(0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0x02);
//! let settings = DeviceSettings { policy: Policy::Pass, name: None };
//!
//! let table = PolicyTable::new(true, [(printer, settings)]);
//! assert_eq!(table.get_policy(printer), Policy::Pass);
//! assert_eq!(table.get_policy(laptop), Policy::CaptivePortal);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod latch;
pub mod metrics;
pub mod network;
pub mod policy;
pub mod portal;

pub use config::Config;
pub use error::{Error, Result};
