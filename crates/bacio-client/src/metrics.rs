use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter, relaxed ordering throughout; the
/// counters are observability data, not synchronization.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Client activity counters. A metrics sink can poll these; nothing in the
/// client pushes them anywhere.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connect_attempts: Counter,
    pub disconnects: Counter,
    pub requests_sent: Counter,
    pub requests_succeeded: Counter,
    pub requests_failed: Counter,
    pub requests_timed_out: Counter,
    pub retransmissions: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub who_is_sent: Counter,
    pub i_am_received: Counter,
    pub devices_discovered: Counter,
    pub cov_notifications: Counter,
}
