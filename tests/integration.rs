//! Integration tests for the enforcement loop.
//!
//! These tests drive `run_loop` end to end with a scripted capture, a
//! recording sender and a recording firewall backend.

use std::collections::VecDeque;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arpgate::config::Config;
use arpgate::engine::{Engine, EngineSettings, Identity, LoopContext, run_loop};
use arpgate::error::FirewallError;
use arpgate::firewall::{Firewall, FirewallBackend, IpForwarding, RuleBuilder};
use arpgate::latch::ReloadLatch;
use arpgate::network::{PacketCapture, PacketSender};
use arpgate::policy::PolicyTable;
use arpgate::portal::PortalEvent;
use parking_lot::Mutex;
use pnet::packet::Packet;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::util::MacAddr;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::mpsc;

const IFACE_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0xfe);
const GATEWAY_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
const HOST_A: MacAddr = MacAddr(0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x01);
const HOST_B: MacAddr = MacAddr(0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0x02);

const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

/// Builds an ARP request as a device on the segment would send it.
fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
    let mut buffer = vec![0u8; 42];
    {
        let mut ethernet = MutableEthernetPacket::new(&mut buffer).unwrap();
        ethernet.set_destination(MacAddr::broadcast());
        ethernet.set_source(sender_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buffer[14..]).unwrap();
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(Ipv4Addr::new(10, 0, 0, 1));
    }
    buffer
}

/// Sender that keeps every frame.
#[derive(Clone, Default)]
struct RecordingSender {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSender {
    /// Destinations of restoring replies, i.e. frames claiming the real gateway mac.
    fn rearped(&self) -> Vec<MacAddr> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| {
                let ethernet = EthernetPacket::new(frame)?;
                let arp = ArpPacket::new(ethernet.payload())?;
                (arp.get_operation() == ArpOperations::Reply
                    && arp.get_sender_hw_addr() == GATEWAY_MAC)
                    .then(|| ethernet.get_destination())
            })
            .collect()
    }

    fn count(&self) -> usize {
        self.frames.lock().len()
    }
}

impl PacketSender for RecordingSender {
    fn send(&mut self, packet: &[u8]) -> arpgate::Result<()> {
        self.frames.lock().push(packet.to_vec());
        Ok(())
    }
}

/// Backend that accepts and keeps every statement.
#[derive(Clone, Default)]
struct RecordingBackend {
    statements: Arc<Mutex<Vec<String>>>,
}

impl RecordingBackend {
    fn count(&self, statement: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|s| s.as_str() == statement)
            .count()
    }
}

impl FirewallBackend for RecordingBackend {
    fn run(&mut self, statement: &str) -> Result<(), FirewallError> {
        self.statements.lock().push(statement.to_string());
        Ok(())
    }
}

enum Step {
    Frame(Vec<u8>),
    Portal(PortalEvent),
    Reload(&'static str),
    Idle,
}

/// Plays a script, one step per read, and stops the loop when done.
struct ScriptedCapture {
    steps: VecDeque<Step>,
    portal: mpsc::Sender<PortalEvent>,
    reload: ReloadLatch,
    config_path: PathBuf,
    running: Arc<AtomicBool>,
}

impl PacketCapture for ScriptedCapture {
    fn next_packet(&mut self) -> Option<Vec<u8>> {
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Some(frame),
            Some(Step::Portal(event)) => {
                self.portal.try_send(event).unwrap();
                None
            }
            Some(Step::Reload(content)) => {
                fs::write(&self.config_path, content).unwrap();
                self.reload.set();
                None
            }
            Some(Step::Idle) => None,
            None => {
                self.running.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

struct Daemon {
    engine: Engine<RecordingSender, RecordingBackend>,
    sender: RecordingSender,
    backend: RecordingBackend,
    sysctl: NamedTempFile,
    _dir: TempDir,
    config_path: PathBuf,
}

fn start_daemon(config: &str) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, config).unwrap();
    let loaded = Config::load(&config_path).unwrap();

    let sysctl = NamedTempFile::new().unwrap();
    fs::write(sysctl.path(), "0\n").unwrap();

    let sender = RecordingSender::default();
    let backend = RecordingBackend::default();
    let mut firewall = Firewall::new(
        backend.clone(),
        RuleBuilder::new("eth0", loaded.enforcement.portal_port),
        IpForwarding::at(sysctl.path()),
    );
    firewall.setup();

    let mut engine = Engine::new(
        Identity {
            iface_ip: Ipv4Addr::new(10, 0, 0, 2),
            iface_mac: IFACE_MAC,
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            gateway_mac: GATEWAY_MAC,
        },
        EngineSettings {
            enforce: loaded.enforcement.enabled,
            idle_timeout: loaded.enforcement.idle_timeout(),
        },
        PolicyTable::from_config(&loaded),
        sender.clone(),
        Some(firewall),
    );
    engine.reload_exceptions(Instant::now());

    Daemon {
        engine,
        sender,
        backend,
        sysctl,
        _dir: dir,
        config_path,
    }
}

fn run_script(daemon: &mut Daemon, steps: Vec<Step>, refresh_interval: Duration) {
    let (portal_tx, portal_rx) = mpsc::channel(8);
    let reload = ReloadLatch::new();
    let running = Arc::new(AtomicBool::new(true));

    let capture = ScriptedCapture {
        steps: steps.into(),
        portal: portal_tx,
        reload: reload.clone(),
        config_path: daemon.config_path.clone(),
        running: Arc::clone(&running),
    };

    run_loop(
        &mut daemon.engine,
        LoopContext {
            capture,
            portal_events: portal_rx,
            reload,
            running,
            config_path: daemon.config_path.clone(),
            refresh_interval,
        },
    );
}

fn sysctl_value(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

const PORTAL_CONFIG: &str = r#"
    [enforcement]
    enabled = true
    captive_portal = true

    [devices."aa:aa:aa:aa:aa:01"]
    policy = "block"
"#;

const PORTAL_CONFIG_A_PASS: &str = r#"
    [enforcement]
    enabled = true
    captive_portal = true

    [devices."aa:aa:aa:aa:aa:01"]
    policy = "pass"
"#;

#[test]
fn should_authenticate_and_reload_through_the_loop() {
    let mut daemon = start_daemon(PORTAL_CONFIG);
    assert_eq!(sysctl_value(daemon.sysctl.path()), "1\n");

    run_script(
        &mut daemon,
        vec![
            Step::Frame(arp_request(HOST_B, IP_B)),
            Step::Frame(arp_request(HOST_A, IP_A)),
            Step::Portal(PortalEvent::AuthOk(IP_B)),
            Step::Reload(PORTAL_CONFIG_A_PASS),
            Step::Idle,
        ],
        Duration::from_secs(3600),
    );

    assert!(daemon.engine.is_authenticated(HOST_B));
    assert_eq!(daemon.engine.stats().authentications, 1);
    assert_eq!(daemon.engine.stats().spoof_replies, 2);
    for table in ["nat", "filter"] {
        assert_eq!(
            daemon
                .backend
                .count(&format!("add element ip {table} arpgate_auth_ok {{ 10.0.0.9 }}")),
            1
        );
        assert_eq!(
            daemon.backend.count(&format!(
                "add element ip {table} arpgate_whitelisted {{ AA:AA:AA:AA:AA:01 }}"
            )),
            1
        );
    }

    // one restore each: HOST_B on login, HOST_A when moved to pass
    let mut rearped = daemon.sender.rearped();
    rearped.sort();
    assert_eq!(rearped, vec![HOST_A, HOST_B]);

    // shutdown tore down firewall state and restored forwarding
    assert_eq!(
        daemon
            .backend
            .count("delete chain ip filter arpgate_forward"),
        1
    );
    assert_eq!(sysctl_value(daemon.sysctl.path()), "0\n");
}

#[test]
fn should_keep_previous_policy_on_invalid_reload() {
    let mut daemon = start_daemon(PORTAL_CONFIG);

    run_script(
        &mut daemon,
        vec![
            Step::Frame(arp_request(HOST_A, IP_A)),
            Step::Reload("[enforcement]\nrefresh_interval_ms = 0\n"),
            Step::Idle,
        ],
        Duration::from_secs(3600),
    );

    assert_eq!(daemon.engine.stats().reconciliations, 2);
    for table in ["nat", "filter"] {
        assert_eq!(
            daemon.backend.count(&format!(
                "add element ip {table} arpgate_blacklisted {{ AA:AA:AA:AA:AA:01 }}"
            )),
            2
        );
    }
    // restored only at shutdown
    assert_eq!(daemon.sender.rearped(), vec![HOST_A]);
}

#[test]
fn should_drop_login_before_the_host_is_seen() {
    let mut daemon = start_daemon(PORTAL_CONFIG);

    // nobody announced 10.0.0.9 yet
    run_script(
        &mut daemon,
        vec![
            Step::Portal(PortalEvent::AuthOk(IP_B)),
            Step::Frame(arp_request(HOST_B, IP_B)),
        ],
        Duration::from_secs(3600),
    );

    assert!(!daemon.engine.is_authenticated(HOST_B));
    assert_eq!(daemon.engine.stats().dropped_auth_events, 1);
    assert_eq!(daemon.sender.rearped(), vec![HOST_B]);
}

#[test]
fn should_refresh_spoofed_hosts_on_every_tick() {
    let mut daemon = start_daemon(PORTAL_CONFIG);

    run_script(
        &mut daemon,
        vec![
            Step::Frame(arp_request(HOST_A, IP_A)),
            Step::Idle,
            Step::Idle,
        ],
        Duration::ZERO,
    );

    assert!(daemon.engine.stats().spoof_requests >= 3);
    assert!(daemon.engine.spoofs().is_empty());
}

#[test]
fn should_only_observe_in_passive_mode() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "[enforcement]\ncaptive_portal = true\n").unwrap();
    let loaded = Config::load(&config_path).unwrap();

    let sender = RecordingSender::default();
    let mut engine: Engine<RecordingSender, RecordingBackend> = Engine::new(
        Identity {
            iface_ip: Ipv4Addr::new(10, 0, 0, 2),
            iface_mac: IFACE_MAC,
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            gateway_mac: GATEWAY_MAC,
        },
        EngineSettings {
            enforce: loaded.enforcement.enabled,
            idle_timeout: loaded.enforcement.idle_timeout(),
        },
        PolicyTable::from_config(&loaded),
        sender.clone(),
        None,
    );

    let (portal_tx, portal_rx) = mpsc::channel(1);
    let running = Arc::new(AtomicBool::new(true));
    let reload = ReloadLatch::new();
    let capture = ScriptedCapture {
        steps: vec![Step::Frame(arp_request(HOST_A, IP_A)), Step::Idle].into(),
        portal: portal_tx,
        reload: reload.clone(),
        config_path: config_path.clone(),
        running: Arc::clone(&running),
    };

    run_loop(
        &mut engine,
        LoopContext {
            capture,
            portal_events: portal_rx,
            reload,
            running,
            config_path,
            refresh_interval: Duration::ZERO,
        },
    );

    assert_eq!(engine.hosts().len(), 1);
    assert_eq!(engine.hosts().mac_for_ip(IP_A), Some(HOST_A));
    assert_eq!(sender.count(), 0);
}
