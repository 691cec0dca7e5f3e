//! Slot-based ring buffer between the network and audio threads
//!
//! The network layer never touches audio hardware. It hands whole
//! payload-sized slots to an [`AudioBridge`] and reads whole slots back.
//! [`RingBuffer`] is the in-process implementation: a bounded lock-free
//! queue of byte slots with a condition variable for the blocking read.
//! Slot storage is allocated up front and recycled through a free list,
//! so steady-state writes and reads do not allocate.

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hand-off point between a transport and the audio thread
pub trait AudioBridge: Send + Sync {
    /// Block until one slot is available and copy it into `dst`.
    ///
    /// Returns `false` if nothing arrived within `timeout`, so the caller
    /// can re-check its stop flag.
    fn read_audio_buffer(&self, dst: &mut [u8], timeout: Duration) -> bool;

    /// Queue `src` behind `gap_bytes` of synthesized audio.
    ///
    /// Never blocks. Returns `false` if `src` does not fit the locally
    /// configured slot layout; the caller treats that as fatal.
    fn write_audio_buffer(&self, src: &[u8], gap_bytes: usize, seq: u16) -> bool;
}

/// What the audio thread hears when the queue runs dry or a gap is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunPolicy {
    /// Zeroed samples
    #[default]
    Silence,
    /// Repeat the last slot that was read
    RepeatLast,
}

/// Bounded queue of equally sized audio slots
pub struct RingBuffer {
    slot_size: usize,
    queue: ArrayQueue<Vec<u8>>,
    free: ArrayQueue<Vec<u8>>,
    allocated_slots: AtomicUsize,
    policy: UnderrunPolicy,
    last_slot: Mutex<Vec<u8>>,
    ready_lock: Mutex<()>,
    ready: Condvar,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
    gap_slot_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a ring buffer of `num_slots` slots of `slot_size` bytes each
    pub fn new(slot_size: usize, num_slots: usize) -> Self {
        Self::with_policy(slot_size, num_slots, UnderrunPolicy::Silence)
    }

    pub fn with_policy(slot_size: usize, num_slots: usize, policy: UnderrunPolicy) -> Self {
        let num_slots = num_slots.max(1);
        // one spare for the slot in flight while the queue is full
        let free = ArrayQueue::new(num_slots + 1);
        for _ in 0..num_slots {
            let _ = free.push(vec![0u8; slot_size]);
        }
        Self {
            slot_size,
            queue: ArrayQueue::new(num_slots),
            free,
            allocated_slots: AtomicUsize::new(num_slots),
            policy,
            last_slot: Mutex::new(vec![0u8; slot_size]),
            ready_lock: Mutex::new(()),
            ready: Condvar::new(),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
            gap_slot_count: AtomicUsize::new(0),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Queue one slot, discarding half the backlog if the queue is full.
    ///
    /// Returns `false` only if `slot` has the wrong length.
    pub fn insert_slot(&self, slot: &[u8]) -> bool {
        if slot.len() != self.slot_size {
            return false;
        }
        let mut buf = self.take_slot();
        buf.copy_from_slice(slot);
        self.push(buf);
        self.notify();
        true
    }

    /// Copy the oldest slot into `dst`, or fill `dst` per the underrun policy
    pub fn read_slot_non_blocking(&self, dst: &mut [u8]) {
        match self.queue.pop() {
            Some(slot) => self.deliver(slot, dst),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                self.fill_underrun(dst);
            }
        }
    }

    /// Wait up to `timeout` for a slot
    pub fn read_slot_blocking(&self, dst: &mut [u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(slot) = self.queue.pop() {
                self.deliver(slot, dst);
                return true;
            }

            let mut guard = self.ready_lock.lock();
            if !self.queue.is_empty() {
                continue;
            }
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                drop(guard);
                return match self.queue.pop() {
                    Some(slot) => {
                        self.deliver(slot, dst);
                        true
                    }
                    None => false,
                };
            }
        }
    }

    fn push(&self, mut slot: Vec<u8>) {
        while let Err(rejected) = self.queue.push(slot) {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            for _ in 0..(self.queue.capacity() / 2).max(1) {
                if let Some(dropped) = self.queue.pop() {
                    self.recycle(dropped);
                }
            }
            slot = rejected;
        }
    }

    fn take_slot(&self) -> Vec<u8> {
        self.free.pop().unwrap_or_else(|| {
            self.allocated_slots.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.slot_size]
        })
    }

    fn recycle(&self, slot: Vec<u8>) {
        // a full free list means the slot was surplus
        let _ = self.free.push(slot);
    }

    fn notify(&self) {
        let _guard = self.ready_lock.lock();
        self.ready.notify_all();
    }

    fn deliver(&self, slot: Vec<u8>, dst: &mut [u8]) {
        let n = dst.len().min(slot.len());
        dst[..n].copy_from_slice(&slot[..n]);
        dst[n..].fill(0);
        let spent = match self.policy {
            UnderrunPolicy::Silence => slot,
            UnderrunPolicy::RepeatLast => std::mem::replace(&mut *self.last_slot.lock(), slot),
        };
        self.recycle(spent);
    }

    fn fill_underrun(&self, dst: &mut [u8]) {
        match self.policy {
            UnderrunPolicy::Silence => dst.fill(0),
            UnderrunPolicy::RepeatLast => {
                let last = self.last_slot.lock();
                let n = dst.len().min(last.len());
                dst[..n].copy_from_slice(&last[..n]);
                dst[n..].fill(0);
            }
        }
    }

    fn gap_slot(&self) -> Vec<u8> {
        let mut slot = self.take_slot();
        match self.policy {
            UnderrunPolicy::Silence => slot.fill(0),
            UnderrunPolicy::RepeatLast => slot.copy_from_slice(&self.last_slot.lock()),
        }
        slot
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued slots
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Slot buffers allocated over the buffer's lifetime
    pub fn allocated_slots(&self) -> usize {
        self.allocated_slots.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Slots synthesized to cover lost packets
    pub fn gap_slot_count(&self) -> usize {
        self.gap_slot_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.overflow_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.gap_slot_count.store(0, Ordering::Relaxed);
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

impl AudioBridge for RingBuffer {
    fn read_audio_buffer(&self, dst: &mut [u8], timeout: Duration) -> bool {
        self.read_slot_blocking(dst, timeout)
    }

    fn write_audio_buffer(&self, src: &[u8], gap_bytes: usize, _seq: u16) -> bool {
        if src.len() != self.slot_size {
            return false;
        }

        // More gap than the queue can hold would only be discarded again
        let gap_slots = (gap_bytes / self.slot_size.max(1)).min(self.capacity());
        for _ in 0..gap_slots {
            self.push(self.gap_slot());
        }
        self.gap_slot_count.fetch_add(gap_slots, Ordering::Relaxed);

        let mut slot = self.take_slot();
        slot.copy_from_slice(src);
        self.push(slot);
        self.notify();
        true
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(slot_size: usize, num_slots: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(slot_size, num_slots))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let buffer = RingBuffer::new(4, 4);

        assert!(buffer.insert_slot(&[1, 1, 1, 1]));
        assert!(buffer.insert_slot(&[2, 2, 2, 2]));
        assert_eq!(buffer.len(), 2);

        let mut out = [0u8; 4];
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [1, 1, 1, 1]);
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [2, 2, 2, 2]);

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_wrong_slot_size_rejected() {
        let buffer = RingBuffer::new(4, 4);
        assert!(!buffer.insert_slot(&[0; 3]));
        assert!(!buffer.write_audio_buffer(&[0; 8], 0, 0));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_drops_half() {
        let buffer = RingBuffer::new(1, 4);
        for i in 0..4u8 {
            buffer.insert_slot(&[i]);
        }
        buffer.insert_slot(&[9]);
        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(buffer.len(), 3);

        let mut out = [0u8; 1];
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [2]);
    }

    #[test]
    fn test_underrun_silence() {
        let buffer = RingBuffer::new(2, 2);
        let mut out = [7u8; 2];
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [0, 0]);
        assert_eq!(buffer.underrun_count(), 1);
    }

    #[test]
    fn test_underrun_repeat_last() {
        let buffer = RingBuffer::with_policy(2, 2, UnderrunPolicy::RepeatLast);
        buffer.insert_slot(&[5, 6]);

        let mut out = [0u8; 2];
        buffer.read_slot_non_blocking(&mut out);
        out = [0, 0];
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [5, 6]);
    }

    #[test]
    fn test_gap_inserted_before_payload() {
        let buffer = RingBuffer::new(2, 8);
        assert!(buffer.write_audio_buffer(&[3, 3], 4, 10));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.gap_slot_count(), 2);

        let mut out = [9u8; 2];
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [0, 0]);
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [0, 0]);
        buffer.read_slot_non_blocking(&mut out);
        assert_eq!(out, [3, 3]);
    }

    #[test]
    fn test_slots_recycled() {
        let buffer = RingBuffer::with_policy(8, 4, UnderrunPolicy::RepeatLast);
        assert_eq!(buffer.allocated_slots(), 4);

        let mut out = [0u8; 8];
        for i in 0..1000u32 {
            let fill = (i % 251) as u8;
            assert!(buffer.write_audio_buffer(&[fill; 8], if i % 7 == 0 { 16 } else { 0 }, 0));
            while !buffer.is_empty() {
                buffer.read_slot_non_blocking(&mut out);
            }
            assert_eq!(out, [fill; 8]);
        }
        // overflow recycles the discarded slots too
        for i in 0..100u8 {
            buffer.insert_slot(&[i; 8]);
        }
        assert!(buffer.overflow_count() > 0);
        assert!(buffer.allocated_slots() <= 5);
    }

    #[test]
    fn test_blocking_read_times_out() {
        let buffer = RingBuffer::new(2, 2);
        let mut out = [0u8; 2];
        let start = Instant::now();
        assert!(!buffer.read_audio_buffer(&mut out, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let buffer = create_shared_buffer(2, 2);
        let producer = buffer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.insert_slot(&[4, 2]);
        });

        let mut out = [0u8; 2];
        assert!(buffer.read_audio_buffer(&mut out, Duration::from_secs(2)));
        assert_eq!(out, [4, 2]);
        handle.join().unwrap();
    }
}
