// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub accepted: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub dropped: AtomicUsize,
    pub stale: AtomicUsize,
}

/// Point-in-time copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub live_conns: usize,
    pub accepted: usize,
    pub requests: usize,
    pub bytes_sent: usize,
    pub dropped: usize,
    pub stale: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            stale: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_conns: self.live_conns.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            requests: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
