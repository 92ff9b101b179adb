//! arpgate daemon - entry point.
//!
//! Resolves the managed interface and the gateway, installs firewall state
//! when enforcement is enabled, then runs the engine loop on a blocking
//! thread. The async runtime only hosts the edges: signals, the portal
//! socket, the observation consumer and the metrics exporter.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use arpgate::config::Config;
use arpgate::engine::{Engine, EngineSettings, HostObservation, Identity, LoopContext, run_loop};
use arpgate::firewall::{Firewall, IpForwarding, NftBackend, RuleBuilder};
use arpgate::latch::ReloadLatch;
use arpgate::network::{
    ArpPacketBuilder, CanonicalMac, LinkIdentity, PnetCapture, detect_gateway,
    discover_gateway_mac, find_interface, get_interface_info,
};
use arpgate::policy::PolicyTable;
use arpgate::portal::{PortalEvent, PortalListener};

const GATEWAY_DISCOVERY_ATTEMPTS: u32 = 5;
const GATEWAY_DISCOVERY_WAIT: Duration = Duration::from_secs(1);
const PORTAL_QUEUE_CAPACITY: usize = 64;

/// Log every observation the engine publishes.
fn spawn_observation_consumer(mut rx: mpsc::Receiver<HostObservation>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(obs) = rx.recv().await {
            debug!(
                mac = %CanonicalMac(obs.mac),
                ip = %obs.ip,
                name = obs.name.as_deref().unwrap_or(""),
                new_host = obs.new_host,
                "Host observed"
            );
        }
    })
}

/// Raise the reload latch on every SIGHUP.
fn spawn_reload_trigger(latch: ReloadLatch) -> Result<JoinHandle<()>> {
    let mut hangups = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!("SIGHUP received, configuration will be reloaded");
            latch.set();
        }
    }))
}

fn spawn_portal_listener(
    config: &Config,
    events: mpsc::Sender<PortalEvent>,
) -> Result<JoinHandle<()>> {
    let listener = PortalListener::bind(&config.enforcement.portal_socket).with_context(|| {
        format!(
            "Failed to bind portal socket {}",
            config.enforcement.portal_socket.display()
        )
    })?;

    Ok(tokio::spawn(async move {
        if let Err(err) = listener.serve(events).await {
            error!("Portal listener failed: {err}");
        }
    }))
}

/// Handlers for the stop signals. Installed before any firewall state exists.
struct StopSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl StopSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .context("Failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
        })
    }
}

/// Wait for SIGINT or SIGTERM, then stop the engine loop.
async fn wait_for_shutdown(running: Arc<AtomicBool>, mut signals: StopSignals) {
    tokio::select! {
        _ = signals.interrupt.recv() => info!("SIGINT received, shutting down..."),
        _ = signals.terminate.recv() => info!("SIGTERM received, shutting down..."),
    }
    running.store(false, Ordering::SeqCst);
}

async fn run() -> Result<()> {
    let config_path = std::env::var_os("CONFIG_PATH")
        .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from);
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    // Must run before any metric is recorded
    arpgate::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let interface =
        find_interface(config.interface.as_deref()).context("Failed to find network interface")?;
    let (iface_ip, iface_mac) =
        get_interface_info(&interface).context("Failed to get interface info")?;
    info!(
        "Managing interface {} ({iface_ip}, {})",
        interface.name,
        CanonicalMac(iface_mac)
    );

    let gateway_ip = if let Some(ip) = config.gateway_ip {
        info!("Using configured gateway IP: {ip}");
        ip
    } else {
        let detected = detect_gateway().context("Failed to detect gateway")?;
        info!("Auto-detected gateway IP: {detected}");
        detected
    };

    let (mut capture, mut sender) = PnetCapture::new(&interface, config.read_timeout())
        .context("Failed to open packet capture")?;

    let builder = ArpPacketBuilder::new(LinkIdentity {
        our_ip: iface_ip,
        our_mac: iface_mac,
        gateway_ip,
    });
    let gateway_mac = discover_gateway_mac(
        &mut capture,
        &mut sender,
        &builder,
        GATEWAY_DISCOVERY_ATTEMPTS,
        GATEWAY_DISCOVERY_WAIT,
    )
    .context("Failed to resolve gateway MAC")?;

    let (portal_tx, portal_rx) = mpsc::channel(PORTAL_QUEUE_CAPACITY);
    let portal_handle = if config.enforcement.enabled {
        Some(spawn_portal_listener(&config, portal_tx)?)
    } else {
        drop(portal_tx);
        None
    };

    let latch = ReloadLatch::new();
    let reload_handle = spawn_reload_trigger(latch.clone())?;
    let stop_signals = StopSignals::install()?;
    let running = Arc::new(AtomicBool::new(true));

    let firewall = if config.enforcement.enabled {
        info!("Enforcement enabled - installing firewall rules");
        let mut firewall = Firewall::new(
            NftBackend::new(),
            RuleBuilder::new(interface.name.as_str(), config.enforcement.portal_port),
            IpForwarding::system(),
        );
        firewall.setup();
        Some(firewall)
    } else {
        info!("Enforcement disabled - running in passive mode");
        None
    };

    let (observation_tx, observation_rx) = mpsc::channel(config.observation_queue_capacity);
    let observation_handle = spawn_observation_consumer(observation_rx);

    let mut engine = Engine::new(
        Identity {
            iface_ip,
            iface_mac,
            gateway_ip,
            gateway_mac,
        },
        EngineSettings {
            enforce: config.enforcement.enabled,
            idle_timeout: config.enforcement.idle_timeout(),
        },
        PolicyTable::from_config(&config),
        sender,
        firewall,
    )
    .with_observations(observation_tx);

    let ctx = LoopContext {
        capture,
        portal_events: portal_rx,
        reload: latch,
        running: Arc::clone(&running),
        config_path,
        refresh_interval: config.enforcement.refresh_interval(),
    };
    let engine_handle = tokio::task::spawn_blocking(move || {
        engine.reload_exceptions(Instant::now());
        run_loop(&mut engine, ctx);
        *engine.stats()
    });

    wait_for_shutdown(running, stop_signals).await;

    match engine_handle.await {
        Ok(stats) => debug!(?stats, "Engine finished"),
        Err(err) => warn!("Engine thread failed: {err}"),
    }

    reload_handle.abort();
    if let Some(handle) = portal_handle {
        handle.abort();
    }
    // the engine dropped its sender, the consumer drains and exits
    let _ = observation_handle.await;

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run().await
}
