//! The engine's event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use super::Engine;
use crate::config::Config;
use crate::firewall::FirewallBackend;
use crate::latch::ReloadLatch;
use crate::network::{PacketCapture, PacketSender, decode_frame};
use crate::policy::PolicyTable;
use crate::portal::PortalEvent;

/// Inputs polled by [`run_loop`] besides the engine itself.
pub struct LoopContext<C: PacketCapture> {
    pub capture: C,
    pub portal_events: mpsc::Receiver<PortalEvent>,
    pub reload: ReloadLatch,
    pub running: Arc<AtomicBool>,
    pub config_path: PathBuf,
    pub refresh_interval: Duration,
}

/// Drive `engine` until `running` is cleared, then shut it down.
///
/// Each iteration waits for at most one frame, then drains portal events,
/// handles a pending reload, applies the frame and runs the refresh tick
/// when due. Blocks the calling thread.
pub fn run_loop<C, S, B>(engine: &mut Engine<S, B>, mut ctx: LoopContext<C>)
where
    C: PacketCapture,
    S: PacketSender,
    B: FirewallBackend,
{
    let our_mac = engine.identity().iface_mac;
    let mut next_refresh = Instant::now() + ctx.refresh_interval;
    let mut portal_open = true;

    info!("Engine loop started");

    while ctx.running.load(Ordering::SeqCst) {
        let frame = ctx.capture.next_packet();

        while portal_open {
            match ctx.portal_events.try_recv() {
                Ok(event) => engine.handle_portal_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Portal event channel closed");
                    portal_open = false;
                }
            }
        }

        if ctx.reload.take() {
            reload_config(engine, &ctx.config_path);
        }

        let now = Instant::now();
        if let Some(packet) = frame.as_deref().and_then(|f| decode_frame(f, our_mac)) {
            engine.handle_packet(&packet, now);
        }

        if now >= next_refresh {
            engine.refresh(now);
            next_refresh = now + ctx.refresh_interval;
        }
    }

    info!("Engine loop stopping");
    engine.shutdown();
}

fn reload_config<S, B>(engine: &mut Engine<S, B>, path: &Path)
where
    S: PacketSender,
    B: FirewallBackend,
{
    match Config::load(path) {
        Ok(config) => {
            debug!(path = %path.display(), "Configuration reloaded");
            engine.apply_policies(PolicyTable::from_config(&config));
        }
        Err(err) => {
            warn!(path = %path.display(), "Keeping previous configuration: {err}");
        }
    }
    engine.reload_exceptions(Instant::now());
}
