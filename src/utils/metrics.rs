//! Observability and Metrics
//!
//! Atomic counters for tunnel activity: connections, handshakes, USC envelopes
//! and bytes moved in each direction.
//!
//! Under the process backend every child counts into its own copy, so the
//! dispatcher's snapshot only reflects accept-side counters there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector shared by the dispatcher and every connection
#[derive(Debug)]
pub struct Metrics {
    /// Total connections started
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused at the client limit
    pub connections_rejected: AtomicU64,
    /// Connections torn down by an error
    pub connection_errors: AtomicU64,
    /// Failed accept calls
    pub accept_errors: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Handshakes that resumed a cached session
    pub handshakes_resumed: AtomicU64,
    /// Envelopes written towards TLS
    pub envelopes_sent: AtomicU64,
    /// Envelopes decoded from TLS
    pub envelopes_received: AtomicU64,
    /// Envelopes whose payload was not forwarded
    pub envelopes_rejected: AtomicU64,
    /// ALERT envelopes sent
    pub alerts_sent: AtomicU64,
    /// ALERT envelopes received
    pub alerts_received: AtomicU64,
    /// Heartbeat requests and responses exchanged
    pub heartbeats: AtomicU64,
    /// NETCONF message starts seen on the plaintext side
    pub messages: AtomicU64,
    /// Plaintext bytes read from local sockets
    pub plain_bytes_in: AtomicU64,
    /// Plaintext bytes written to local sockets
    pub plain_bytes_out: AtomicU64,
    /// Plaintext bytes handed to TLS
    pub tls_bytes_out: AtomicU64,
    /// Plaintext bytes read from TLS
    pub tls_bytes_in: AtomicU64,
    /// Transfer loops aborted by the stall watchdog
    pub stalls: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            handshakes_resumed: AtomicU64::new(0),
            envelopes_sent: AtomicU64::new(0),
            envelopes_received: AtomicU64::new(0),
            envelopes_rejected: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_received: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            plain_bytes_in: AtomicU64::new(0),
            plain_bytes_out: AtomicU64::new(0),
            tls_bytes_out: AtomicU64::new(0),
            tls_bytes_in: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self, resumed: bool) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
        if resumed {
            self.handshakes_resumed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_sent(&self) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_rejected(&self) {
        self.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_sent(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_received(&self) {
        self.alerts_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a NETCONF message
    pub fn message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Add per-connection byte counters at teardown
    pub fn add_bytes(&self, plain_in: u64, plain_out: u64, tls_in: u64, tls_out: u64) {
        self.plain_bytes_in.fetch_add(plain_in, Ordering::Relaxed);
        self.plain_bytes_out.fetch_add(plain_out, Ordering::Relaxed);
        self.tls_bytes_in.fetch_add(tls_in, Ordering::Relaxed);
        self.tls_bytes_out.fetch_add(tls_out, Ordering::Relaxed);
    }

    pub fn stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            handshakes_resumed: self.handshakes_resumed.load(Ordering::Relaxed),
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            envelopes_rejected: self.envelopes_rejected.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_received: self.alerts_received.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            plain_bytes_in: self.plain_bytes_in.load(Ordering::Relaxed),
            plain_bytes_out: self.plain_bytes_out.load(Ordering::Relaxed),
            tls_bytes_in: self.tls_bytes_in.load(Ordering::Relaxed),
            tls_bytes_out: self.tls_bytes_out.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            connection_errors = snapshot.connection_errors,
            accept_errors = snapshot.accept_errors,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            handshakes_resumed = snapshot.handshakes_resumed,
            envelopes_sent = snapshot.envelopes_sent,
            envelopes_received = snapshot.envelopes_received,
            envelopes_rejected = snapshot.envelopes_rejected,
            alerts_sent = snapshot.alerts_sent,
            alerts_received = snapshot.alerts_received,
            heartbeats = snapshot.heartbeats,
            messages = snapshot.messages,
            plain_bytes_in = snapshot.plain_bytes_in,
            plain_bytes_out = snapshot.plain_bytes_out,
            tls_bytes_in = snapshot.tls_bytes_in,
            tls_bytes_out = snapshot.tls_bytes_out,
            stalls = snapshot.stalls,
            uptime_seconds = snapshot.uptime_seconds,
            "Tunnel metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub connection_errors: u64,
    pub accept_errors: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub handshakes_resumed: u64,
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub envelopes_rejected: u64,
    pub alerts_sent: u64,
    pub alerts_received: u64,
    pub heartbeats: u64,
    pub messages: u64,
    pub plain_bytes_in: u64,
    pub plain_bytes_out: u64,
    pub tls_bytes_in: u64,
    pub tls_bytes_out: u64,
    pub stalls: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[test]
    fn test_resumed_handshakes_counted_separately() {
        let metrics = Metrics::new();
        metrics.handshake_success(false);
        metrics.handshake_success(true);
        let snap = metrics.snapshot();
        assert_eq!(snap.handshakes_success, 2);
        assert_eq!(snap.handshakes_resumed, 1);
    }

    #[test]
    fn test_byte_totals() {
        let metrics = Metrics::new();
        metrics.add_bytes(200, 100, 92, 208);
        metrics.add_bytes(1, 2, 3, 4);
        let snap = metrics.snapshot();
        assert_eq!(snap.plain_bytes_in, 201);
        assert_eq!(snap.plain_bytes_out, 102);
        assert_eq!(snap.tls_bytes_in, 95);
        assert_eq!(snap.tls_bytes_out, 212);
    }
}
