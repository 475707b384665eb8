//! Lock-free counters for the handful of numbers the host operator actually
//! needs: dropped frames, admission denials, active flows.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline(always)]
    pub fn incr(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Session-wide counters, snapshotted for logging and for the host admin
/// surface.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_in: AtomicCounter,
    pub frames_out: AtomicCounter,
    pub frames_dropped_malformed: AtomicCounter,
    pub flows_opened: AtomicCounter,
    pub flows_closed: AtomicCounter,
    pub admission_denied: AtomicCounter,
    pub dns_queries: AtomicCounter,
    pub dns_queries_blocked: AtomicCounter,
    pub tls_handshakes_intercepted: AtomicCounter,
    pub secrets_substituted: AtomicCounter,
    pub secrets_blocked: AtomicCounter,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionMetricsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped_malformed: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub admission_denied: u64,
    pub dns_queries: u64,
    pub dns_queries_blocked: u64,
    pub tls_handshakes_intercepted: u64,
    pub secrets_substituted: u64,
    pub secrets_blocked: u64,
}

impl SessionMetrics {
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            frames_in: self.frames_in.get(),
            frames_out: self.frames_out.get(),
            frames_dropped_malformed: self.frames_dropped_malformed.get(),
            flows_opened: self.flows_opened.get(),
            flows_closed: self.flows_closed.get(),
            admission_denied: self.admission_denied.get(),
            dns_queries: self.dns_queries.get(),
            dns_queries_blocked: self.dns_queries_blocked.get(),
            tls_handshakes_intercepted: self.tls_handshakes_intercepted.get(),
            secrets_substituted: self.secrets_substituted.get(),
            secrets_blocked: self.secrets_blocked.get(),
        }
    }
}
