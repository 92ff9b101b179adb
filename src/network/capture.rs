//! Link-layer capture and injection handles.
//!
//! The engine only sees [`PacketCapture`] and [`PacketSender`], so it runs
//! against scripted frames in tests and a pnet channel in production.

use std::io;
use std::time::Duration;

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use tracing::warn;

use crate::error::{NetworkError, Result};
use crate::metrics::CAPTURE_ERRORS;

/// Trait for packet capture implementations.
pub trait PacketCapture: Send {
    /// Receive the next frame, waiting at most the configured read timeout.
    ///
    /// Returns None when the wait elapsed without a frame.
    fn next_packet(&mut self) -> Option<Vec<u8>>;
}

/// Trait for packet sending implementations.
pub trait PacketSender: Send {
    /// Send a packet.
    fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Find a suitable network interface.
///
/// Returns the first interface that is:
/// - Up (active)
/// - Not a loopback interface
/// - Has at least one IP address
pub fn find_interface(name: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();

    if let Some(name) = name {
        interfaces
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| NetworkError::NoInterface.into())
    } else {
        interfaces
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or_else(|| NetworkError::NoInterface.into())
    }
}

/// Production packet capture using pnet.
pub struct PnetCapture {
    rx: Box<dyn DataLinkReceiver>,
    read_timeout: Duration,
}

impl PnetCapture {
    /// Open a capture and injection handle on the given interface.
    pub fn new(
        interface: &NetworkInterface,
        read_timeout: Duration,
    ) -> Result<(Self, PnetSender)> {
        let config = datalink::Config {
            read_timeout: Some(read_timeout),
            promiscuous: true,
            ..Default::default()
        };

        let (tx, rx) = match datalink::channel(interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(NetworkError::UnsupportedChannel.into()),
            Err(e) => return Err(NetworkError::ChannelOpen(e.to_string()).into()),
        };

        Ok((Self { rx, read_timeout }, PnetSender { tx }))
    }
}

/// Whether a failed read only means that no frame arrived in time.
fn is_idle_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl PacketCapture for PnetCapture {
    fn next_packet(&mut self) -> Option<Vec<u8>> {
        match self.rx.next() {
            Ok(frame) => Some(frame.to_vec()),
            Err(err) if is_idle_read(&err) => None,
            Err(err) => {
                warn!("Capture read failed: {err}");
                metrics::counter!(CAPTURE_ERRORS).increment(1);
                // a dead interface fails instantly, keep the loop at its usual pace
                std::thread::sleep(self.read_timeout);
                None
            }
        }
    }
}

/// Production packet sender using pnet.
pub struct PnetSender {
    tx: Box<dyn DataLinkSender>,
}

impl PacketSender for PnetSender {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.tx
            .send_to(packet, None)
            .ok_or_else(|| NetworkError::SendFailed("send returned None".into()))?
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Mock packet capture for testing.
    pub struct MockCapture {
        packets: VecDeque<Vec<u8>>,
    }

    impl MockCapture {
        pub fn new(packets: Vec<Vec<u8>>) -> Self {
            Self {
                packets: packets.into(),
            }
        }
    }

    impl PacketCapture for MockCapture {
        fn next_packet(&mut self) -> Option<Vec<u8>> {
            self.packets.pop_front()
        }
    }

    /// Mock packet sender for testing.
    #[derive(Clone, Default)]
    pub struct MockSender {
        pub sent_packets: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl MockSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent_count(&self) -> usize {
            self.sent_packets.lock().len()
        }

        pub fn last_sent(&self) -> Option<Vec<u8>> {
            self.sent_packets.lock().last().cloned()
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent_packets.lock().clone()
        }

        pub fn clear(&self) {
            self.sent_packets.lock().clear();
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock() = fail;
        }
    }

    impl PacketSender for MockSender {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            if *self.fail.lock() {
                return Err(NetworkError::SendFailed("mock failure".into()).into());
            }
            self.sent_packets.lock().push(packet.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_idle_read_classification() {
        assert!(is_idle_read(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_idle_read(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_idle_read(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_idle_read(&io::Error::other("Network is down")));
    }

    #[test]
    fn test_mock_capture() {
        let packets = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let mut capture = MockCapture::new(packets);

        assert_eq!(capture.next_packet(), Some(vec![1, 2, 3]));
        assert_eq!(capture.next_packet(), Some(vec![4, 5, 6]));
        assert_eq!(capture.next_packet(), None);
    }

    #[test]
    fn test_mock_sender() {
        let mut sender = MockSender::new();

        sender.send(&[1, 2, 3]).unwrap();
        assert_eq!(sender.sent_count(), 1);

        sender.send(&[4, 5, 6]).unwrap();
        assert_eq!(sender.sent_count(), 2);
        assert_eq!(sender.last_sent(), Some(vec![4, 5, 6]));

        sender.set_failing(true);
        assert!(sender.send(&[7]).is_err());
        assert_eq!(sender.sent_count(), 2);
    }
}
