//! Forward redundancy without retransmission
//!
//! The sender keeps its last `R` packets and transmits all of them every
//! tick, newest first, so each packet travels in `R` consecutive
//! transmissions. The receiver reads the newest sequence number from
//! slot 0 and, when packets went missing, looks further back in the same
//! transmission for the copies it did not get.
//!
//! ```text
//!  tick k    [ P(k)   | P(k-1) ]      R = 2
//!  tick k+1  [ P(k+1) | P(k)   ]      lost?  P(k) is still in slot 1
//! ```

use serde::{Deserialize, Serialize};
use std::io::IoSlice;

use crate::protocol::sequence::{classify, SequenceCheck};

/// The sender's last `R` packets as a ring of owned buffers
#[derive(Debug, Clone)]
pub struct RedundancyWindow {
    slots: Vec<Vec<u8>>,
    packet_size: usize,
    newest: usize,
}

impl RedundancyWindow {
    pub fn new(redundancy: usize, packet_size: usize) -> Self {
        let redundancy = redundancy.max(1);
        Self {
            slots: vec![vec![0u8; packet_size]; redundancy],
            packet_size,
            newest: redundancy - 1,
        }
    }

    pub fn redundancy(&self) -> usize {
        self.slots.len()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Bytes of one full transmission
    pub fn transmission_size(&self) -> usize {
        self.packet_size * self.slots.len()
    }

    /// Buffer that will hold the next packet. It currently holds the
    /// oldest packet, which stays in the window until [`commit`] is called.
    ///
    /// [`commit`]: RedundancyWindow::commit
    pub fn stage(&mut self) -> &mut [u8] {
        let next = (self.newest + 1) % self.slots.len();
        &mut self.slots[next]
    }

    /// Make the staged buffer slot 0, dropping the oldest packet
    pub fn commit(&mut self) {
        self.newest = (self.newest + 1) % self.slots.len();
    }

    /// Slot `index` counted from the newest packet
    pub fn slot(&self, index: usize) -> &[u8] {
        let r = self.slots.len();
        &self.slots[(self.newest + r - index % r) % r]
    }

    /// Slots newest first
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.slots.len()).map(move |i| self.slot(i))
    }

    /// Scatter list for a vectored send of the whole window
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.iter().map(IoSlice::new).collect()
    }

    /// Copy the whole window into `dst`, newest first
    pub fn write_contiguous(&self, dst: &mut [u8]) -> usize {
        let mut offset = 0;
        for slot in self.iter() {
            dst[offset..offset + slot.len()].copy_from_slice(slot);
            offset += slot.len();
        }
        offset
    }
}

/// Which redundant slots may end a loss run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Use the oldest slot newer than the last delivered packet; a gap
    /// is filled only for packets no slot still carries
    #[default]
    Partial,
    /// Use redundant slots only if they reach back to the packet right
    /// after the last delivered one; otherwise fill the whole run
    Contiguous,
}

/// What to do with one received transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderDecision {
    /// Deliver slots `first_slot` down to 0, oldest first, with
    /// `gap_packets` frames of filler before the first one
    Deliver {
        first_slot: usize,
        gap_packets: u16,
        lost: u16,
        revived: u16,
    },
    /// Stale or implausible transmission; discard it
    OutOfOrder,
    /// Too many discards in a row; history was dropped
    Resync,
}

/// Receive-side sequence tracking over redundant transmissions
#[derive(Debug, Clone)]
pub struct ReorderEngine {
    last_seq: Option<u16>,
    out_of_order_run: u32,
    reset_threshold: u32,
    max_gap: u16,
    recovery: RecoveryMode,
}

impl ReorderEngine {
    /// `reset_threshold` is the number of consecutive out-of-order
    /// transmissions tolerated; one more resynchronizes.
    pub fn new(reset_threshold: u32, max_gap: u16) -> Self {
        Self {
            last_seq: None,
            out_of_order_run: 0,
            reset_threshold,
            max_gap,
            recovery: RecoveryMode::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryMode) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn recovery(&self) -> RecoveryMode {
        self.recovery
    }

    /// No packet has been accepted since creation or the last resync
    pub fn is_initial(&self) -> bool {
        self.last_seq.is_none()
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_seq
    }

    pub fn reset(&mut self) {
        self.last_seq = None;
        self.out_of_order_run = 0;
    }

    /// Classify a transmission whose slots carry `seqs`, newest first.
    ///
    /// `seqs[0]` is the sequence number of slot 0.
    pub fn process(&mut self, seqs: &[u16]) -> ReorderDecision {
        let newest = match seqs.first() {
            Some(&seq) => seq,
            None => return ReorderDecision::OutOfOrder,
        };

        let last = match self.last_seq {
            Some(last) => last,
            None => {
                self.last_seq = Some(newest);
                self.out_of_order_run = 0;
                return ReorderDecision::Deliver {
                    first_slot: 0,
                    gap_packets: 0,
                    lost: 0,
                    revived: 0,
                };
            }
        };

        let lost = match classify(last, newest, self.max_gap) {
            SequenceCheck::InOrder { lost } => lost,
            SequenceCheck::OutOfOrder => {
                self.out_of_order_run += 1;
                if self.out_of_order_run > self.reset_threshold {
                    self.reset();
                    return ReorderDecision::Resync;
                }
                return ReorderDecision::OutOfOrder;
            }
        };

        self.out_of_order_run = 0;
        self.last_seq = Some(newest);

        if lost > 0 {
            if let Some((first_slot, ahead)) = self.recovery_slot(last, lost, seqs) {
                let gap_packets = ahead - 1;
                return ReorderDecision::Deliver {
                    first_slot,
                    gap_packets,
                    lost,
                    revived: lost - gap_packets,
                };
            }
        }

        ReorderDecision::Deliver {
            first_slot: 0,
            gap_packets: lost,
            lost,
            revived: 0,
        }
    }

    /// Oldest redundant slot usable after `last`, with its distance from
    /// `last` in packets
    fn recovery_slot(&self, last: u16, lost: u16, seqs: &[u16]) -> Option<(usize, u16)> {
        seqs.iter()
            .enumerate()
            .skip(1)
            .rev()
            .map(|(slot, &seq)| (slot, seq.wrapping_sub(last)))
            .find(|&(_, ahead)| match self.recovery {
                RecoveryMode::Partial => (1..=lost).contains(&ahead),
                RecoveryMode::Contiguous => ahead == 1,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(first_slot: usize, gap_packets: u16, lost: u16, revived: u16) -> ReorderDecision {
        ReorderDecision::Deliver {
            first_slot,
            gap_packets,
            lost,
            revived,
        }
    }

    #[test]
    fn test_window_newest_first() {
        let mut window = RedundancyWindow::new(3, 1);
        for value in 1..=4u8 {
            window.stage()[0] = value;
            window.commit();
        }
        let order: Vec<u8> = window.iter().map(|s| s[0]).collect();
        assert_eq!(order, vec![4, 3, 2]);

        let mut flat = [0u8; 3];
        assert_eq!(window.write_contiguous(&mut flat), 3);
        assert_eq!(flat, [4, 3, 2]);
        assert_eq!(window.io_slices().len(), 3);
    }

    #[test]
    fn test_uncommitted_stage_keeps_window() {
        let mut window = RedundancyWindow::new(2, 1);
        window.stage()[0] = 1;
        window.commit();
        window.stage()[0] = 2;
        window.commit();

        // staged but never committed
        window.stage()[0] = 9;
        let order: Vec<u8> = window.iter().map(|s| s[0]).collect();
        assert_eq!(order[0], 2);
    }

    #[test]
    fn test_first_packet_accepted() {
        let mut engine = ReorderEngine::new(5, 1000);
        assert!(engine.is_initial());
        assert_eq!(engine.process(&[500, 499]), deliver(0, 0, 0, 0));
        assert_eq!(engine.last_sequence(), Some(500));
    }

    #[test]
    fn test_in_order_stream() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[10]);
        assert_eq!(engine.process(&[11]), deliver(0, 0, 0, 0));
        assert_eq!(engine.process(&[12]), deliver(0, 0, 0, 0));
    }

    #[test]
    fn test_single_loss_recovered_with_r2() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[10, 9]);
        // transmission [11, 10] lost
        assert_eq!(engine.process(&[12, 11]), deliver(1, 0, 1, 1));
    }

    #[test]
    fn test_double_loss_with_r2_revives_one() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[10, 9]);
        // [11, 10] and [12, 11] lost; 12 is still in slot 1
        assert_eq!(engine.process(&[13, 12]), deliver(1, 1, 2, 1));
    }

    #[test]
    fn test_contiguous_mode_exhausts_r2() {
        let mut engine = ReorderEngine::new(5, 1000).with_recovery(RecoveryMode::Contiguous);
        engine.process(&[10, 9]);
        assert_eq!(engine.process(&[13, 12]), deliver(0, 2, 2, 0));
    }

    #[test]
    fn test_r3_partial_recovery() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[10, 9, 8]);
        // 11 is gone for good, 12 and 13 are still in slots 2 and 1
        assert_eq!(engine.process(&[14, 13, 12]), deliver(2, 1, 3, 2));
        assert_eq!(engine.last_sequence(), Some(14));

        let mut strict = ReorderEngine::new(5, 1000).with_recovery(RecoveryMode::Contiguous);
        strict.process(&[10, 9, 8]);
        assert_eq!(strict.process(&[14, 13, 12]), deliver(0, 3, 3, 0));
    }

    #[test]
    fn test_r4_long_run_across_wraparound() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[65533, 65532, 65531, 65530]);
        // 65534..=1 missing from their own transmissions; 65535, 0 and 1 survive
        assert_eq!(engine.process(&[2, 1, 0, 65535]), deliver(3, 1, 4, 3));
    }

    #[test]
    fn test_stale_slots_not_revived() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[20, 19, 18]);
        // every slot except the newest predates the last delivered packet
        assert_eq!(engine.process(&[25, 19, 18]), deliver(0, 4, 4, 0));
    }

    #[test]
    fn test_r3_recovers_two() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[10, 9, 8]);
        assert_eq!(engine.process(&[13, 12, 11]), deliver(2, 0, 2, 2));
    }

    #[test]
    fn test_wraparound_loss() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[65534, 65533]);
        assert_eq!(engine.process(&[0, 65535]), deliver(1, 0, 1, 1));
        assert_eq!(engine.process(&[1, 0]), deliver(0, 0, 0, 0));
    }

    #[test]
    fn test_resync_after_threshold() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[100]);
        for _ in 0..5 {
            assert_eq!(engine.process(&[50]), ReorderDecision::OutOfOrder);
        }
        assert_eq!(engine.process(&[50]), ReorderDecision::Resync);
        assert!(engine.is_initial());
        assert_eq!(engine.process(&[51]), deliver(0, 0, 0, 0));
    }

    #[test]
    fn test_out_of_order_run_resets_on_good_packet() {
        let mut engine = ReorderEngine::new(5, 1000);
        engine.process(&[100]);
        for _ in 0..5 {
            engine.process(&[100]);
        }
        engine.process(&[101]);
        for _ in 0..5 {
            assert_eq!(engine.process(&[3000]), ReorderDecision::OutOfOrder);
        }
    }
}
