//! Metrics initialization for Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Forged ARP packets sent, labelled by `kind` (spoof_reply, spoof_request, rearp).
pub const ARP_PACKETS_SENT: &str = "arpgate_arp_packets_sent_total";
/// ARP packets that failed to send.
pub const ARP_SEND_FAILURES: &str = "arpgate_arp_send_failures_total";
/// Capture reads that failed for a reason other than the read timeout.
pub const CAPTURE_ERRORS: &str = "arpgate_capture_errors_total";
/// Firewall statements rejected by the backend.
pub const FIREWALL_FAILURES: &str = "arpgate_firewall_failures_total";
/// Portal events, labelled by `outcome`.
pub const PORTAL_EVENTS: &str = "arpgate_portal_events_total";
/// Policy reconciliations run.
pub const RECONCILIATIONS: &str = "arpgate_reconciliations_total";
/// Hosts currently tracked.
pub const TRACKED_HOSTS: &str = "arpgate_tracked_hosts";
/// Hosts currently held in a spoof entry.
pub const SPOOFED_HOSTS: &str = "arpgate_spoofed_hosts";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape. Must run inside a tokio
/// runtime.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    Ok(())
}
