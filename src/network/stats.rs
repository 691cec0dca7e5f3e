//! Receiver statistics

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    tot: u64,
    lost: u64,
    out_of_order: u64,
    revived: u64,
    stat_count: u64,
}

/// Point-in-time copy of a receiver's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PacketStatsSnapshot {
    /// Packets the sender produced, as counted from sequence numbers
    pub tot: u64,
    /// Packets neither received nor recovered from redundancy
    pub lost: u64,
    /// Transmissions discarded as stale or implausible
    pub out_of_order: u64,
    /// Packets recovered from a later transmission's redundancy window
    pub revived: u64,
    /// Number of snapshots taken before this one
    pub stat_count: u64,
}

impl PacketStatsSnapshot {
    /// Fraction of packets lost outright
    pub fn loss_rate(&self) -> f64 {
        if self.tot == 0 {
            0.0
        } else {
            self.lost as f64 / self.tot as f64
        }
    }
}

/// Counters shared between a receive loop and `stats()` callers
#[derive(Debug, Default)]
pub struct PacketStats {
    inner: Mutex<Counters>,
}

impl PacketStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one accepted transmission.
    ///
    /// `lost` is the raw sequence gap in front of it; `revived` of those
    /// were recovered from its redundancy window.
    pub fn record_delivery(&self, lost: u64, revived: u64) {
        let mut c = self.inner.lock();
        c.tot += 1 + lost;
        c.lost += lost.saturating_sub(revived);
        c.revived += revived;
    }

    /// Stale transmissions carry nothing new and leave `tot` alone
    pub fn record_out_of_order(&self) {
        self.inner.lock().out_of_order += 1;
    }

    /// Back to the state of a freshly created stream
    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }

    /// Zero the traffic counters after a resynchronization.
    ///
    /// `stat_count` keeps counting.
    pub fn reset_sync(&self) {
        let mut c = self.inner.lock();
        c.tot = 0;
        c.lost = 0;
        c.out_of_order = 0;
        c.revived = 0;
    }

    /// Copy the counters out.
    ///
    /// The very first snapshot discards whatever loss was counted while
    /// the stream was settling.
    pub fn snapshot(&self) -> PacketStatsSnapshot {
        let mut c = self.inner.lock();
        if c.stat_count == 0 {
            c.lost = 0;
            c.out_of_order = 0;
            c.revived = 0;
        }
        let snapshot = PacketStatsSnapshot {
            tot: c.tot,
            lost: c.lost,
            out_of_order: c.out_of_order,
            revived: c.revived,
            stat_count: c.stat_count,
        };
        c.stat_count += 1;
        snapshot
    }
}
