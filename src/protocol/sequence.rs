//! 16-bit sequence number arithmetic
//!
//! Sequence numbers wrap at 65536. Deltas are computed with signed 16-bit
//! subtraction so that 65535 -> 0 is a step of one.

/// Signed distance from `last` to `now`, wrapping at 65536
#[inline]
pub fn sequence_delta(last: u16, now: u16) -> i16 {
    now.wrapping_sub(last) as i16
}

/// Classification of a newly arrived sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Arrived in order, `lost` packets are missing in between
    InOrder { lost: u16 },
    /// Stale, duplicated, or an implausibly large jump
    OutOfOrder,
}

/// Classify `now` against the last accepted sequence number.
///
/// A gap outside `[0, max_gap]` is treated as out-of-order rather than
/// genuine loss.
pub fn classify(last: u16, now: u16, max_gap: u16) -> SequenceCheck {
    let lost = sequence_delta(last, now).wrapping_sub(1);
    if lost < 0 || (lost as u16) > max_gap {
        SequenceCheck::OutOfOrder
    } else {
        SequenceCheck::InOrder { lost: lost as u16 }
    }
}
