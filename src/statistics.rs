use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;

/// Process-wide traffic accounting.
///
/// Per-session counters live with the sessions; these are the totals a
/// periodic report line and the shutdown summary come from.
#[derive(Default)]
struct Inner {
    allocations: AtomicUsize,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    dropped_packets: AtomicU64,
}

#[derive(Default, Clone)]
pub struct Statistics(Arc<Inner>);

impl Statistics {
    pub fn allocation_opened(&self) {
        self.0.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocation_closed(&self) {
        self.0.allocations.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> usize {
        self.0.allocations.load(Ordering::Relaxed)
    }

    pub fn report_received(&self, bytes: usize) {
        self.0.received_packets.fetch_add(1, Ordering::Relaxed);
        self.0.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn report_sent(&self, bytes: usize) {
        self.0.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.0.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn report_dropped(&self) {
        self.0.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// One log line a minute with the totals and the windowed rates.
    pub async fn run_reporter(self) {
        let mut last_received = 0u64;
        let mut last_sent = 0u64;

        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;

            let received = self.0.received_bytes.load(Ordering::Relaxed);
            let sent = self.0.sent_bytes.load(Ordering::Relaxed);

            log::info!(
                "stats: allocations={}, rx={} ({} B/s), tx={} ({} B/s), dropped={}",
                self.allocations(),
                received,
                (received - last_received) / 60,
                sent,
                (sent - last_sent) / 60,
                self.0.dropped_packets.load(Ordering::Relaxed),
            );

            last_received = received;
            last_sent = sent;
        }
    }
}
