//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring transport and socket health.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for bridge operations
#[derive(Debug)]
pub struct BridgeMetrics {
    /// Total transports registered
    pub transports_total: AtomicU64,
    /// Currently live transports
    pub transports_active: AtomicU64,
    /// Total handshakes completed (transport went online)
    pub handshakes_success: AtomicU64,
    /// Failed auth attempts (bad signature or rejected key)
    pub auth_failures: AtomicU64,
    /// Total packets sent
    pub packets_sent: AtomicU64,
    /// Total packets received
    pub packets_received: AtomicU64,
    /// Total payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Total payload bytes received
    pub bytes_received: AtomicU64,
    /// Local sockets opened
    pub sockets_opened: AtomicU64,
    /// Local sockets closed
    pub sockets_closed: AtomicU64,
    /// Service opens refused (unknown name or policy)
    pub services_refused: AtomicU64,
    /// Protocol errors observed
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            transports_total: AtomicU64::new(0),
            transports_active: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            sockets_opened: AtomicU64::new(0),
            sockets_closed: AtomicU64::new(0),
            services_refused: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new transport registration
    pub fn transport_registered(&self) {
        self.transports_total.fetch_add(1, Ordering::Relaxed);
        self.transports_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport teardown
    pub fn transport_closed(&self) {
        self.transports_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a completed handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed auth attempt
    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet sent
    pub fn packet_sent(&self, payload_bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Record a packet received
    pub fn packet_received(&self, payload_bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Record a local socket installed
    pub fn socket_opened(&self) {
        self.sockets_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a local socket reaped
    pub fn socket_closed(&self) {
        self.sockets_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused service open
    pub fn service_refused(&self) {
        self.services_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transports_total: self.transports_total.load(Ordering::Relaxed),
            transports_active: self.transports_active.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sockets_opened: self.sockets_opened.load(Ordering::Relaxed),
            sockets_closed: self.sockets_closed.load(Ordering::Relaxed),
            services_refused: self.services_refused.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            transports_total = snapshot.transports_total,
            transports_active = snapshot.transports_active,
            handshakes_success = snapshot.handshakes_success,
            auth_failures = snapshot.auth_failures,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            sockets_opened = snapshot.sockets_opened,
            sockets_closed = snapshot.sockets_closed,
            services_refused = snapshot.services_refused,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Bridge metrics snapshot"
        );
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub transports_total: u64,
    pub transports_active: u64,
    pub handshakes_success: u64,
    pub auth_failures: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sockets_opened: u64,
    pub sockets_closed: u64,
    pub services_refused: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<BridgeMetrics> = once_cell::sync::Lazy::new(BridgeMetrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static BridgeMetrics {
    &METRICS
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
