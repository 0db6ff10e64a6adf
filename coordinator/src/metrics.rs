//! Lightweight Prometheus-compatible metrics for the coordinator.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format; the snapshot is logged on shutdown.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the coordinator.
pub struct Metrics {
    /// Attached control connections (gauge)
    pub active_peers: AtomicU64,
    /// Control connections accepted (counter)
    pub accepted_total: AtomicU64,
    /// Connect announces handled (counter)
    pub announces_total: AtomicU64,
    /// PeersToConnect messages written to peers (counter)
    pub peer_lists_sent_total: AtomicU64,
    /// StunResponses sent (counter)
    pub stun_responses_total: AtomicU64,
    /// KeepAlives received on the packet socket (counter)
    pub keepalives_total: AtomicU64,
    /// Control connections dropped (counter)
    pub disconnects_total: AtomicU64,
    /// Bytes skipped while re-synchronising control streams (counter)
    pub framing_resyncs_total: AtomicU64,
    /// Coordinator start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_peers: AtomicU64::new(0),
            accepted_total: AtomicU64::new(0),
            announces_total: AtomicU64::new(0),
            peer_lists_sent_total: AtomicU64::new(0),
            stun_responses_total: AtomicU64::new(0),
            keepalives_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            framing_resyncs_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `(name, kind, help, value)` for every exported series
    fn samples(&self) -> [(&'static str, &'static str, &'static str, u64); 9] {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        [
            ("tent_active_peers", "gauge", "Attached control connections", load(&self.active_peers)),
            ("tent_accepted_total", "counter", "Control connections accepted", load(&self.accepted_total)),
            ("tent_announces_total", "counter", "Connect announces handled", load(&self.announces_total)),
            ("tent_peer_lists_sent_total", "counter", "PeersToConnect messages written", load(&self.peer_lists_sent_total)),
            ("tent_stun_responses_total", "counter", "STUN responses sent", load(&self.stun_responses_total)),
            ("tent_keepalives_total", "counter", "Keep-alives received", load(&self.keepalives_total)),
            ("tent_disconnects_total", "counter", "Control connections dropped", load(&self.disconnects_total)),
            ("tent_framing_resyncs_total", "counter", "Bytes skipped to find a frame header", load(&self.framing_resyncs_total)),
            ("tent_uptime_seconds", "gauge", "Coordinator uptime in seconds", self.start_time.elapsed().as_secs()),
        ]
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, kind, help, value) in self.samples() {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
