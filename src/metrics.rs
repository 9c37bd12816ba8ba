//! Per-endpoint datagram link counters.
//!
//! One [`LinkMetrics`] is shared by every task that touches the same UDP
//! endpoint; readers take a [`LinkStats`] snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub sent: u64,
    pub received: u64,
    /// Datagrams sent again after a loss or a missing receipt.
    pub retransmitted: u64,
    pub duplicates: u64,
    /// Datagrams known to have gone missing on the way in.
    pub lost: u64,
}

impl LinkStats {
    /// Lost datagrams as a percentage of datagrams sent by the peer side.
    pub fn loss_rate(&self) -> f64 {
        percentage(self.lost, self.received + self.lost)
    }

    pub fn retransmission_rate(&self) -> f64 {
        percentage(self.retransmitted, self.sent)
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

impl core::fmt::Display for LinkStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "sent {} | received {} | retransmitted {} | duplicates {} | lost {} ({:.2}% loss)",
            self.sent,
            self.received,
            self.retransmitted,
            self.duplicates,
            self.lost,
            self.loss_rate()
        )
    }
}

#[derive(Debug, Default)]
pub struct LinkMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    retransmitted: AtomicU64,
    duplicates: AtomicU64,
    lost: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted as sent as well.
    pub fn record_retransmitted(&self, count: u64) {
        self.retransmitted.fetch_add(count, Ordering::Relaxed);
        self.record_sent(count);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, count: u64) {
        self.lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            retransmitted: self.retransmitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}
