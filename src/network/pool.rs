//! Lock-free pool of pre-allocated send buffers
//!
//! The audio thread must neither block nor allocate, yet the datagram API
//! keeps each send buffer until an asynchronous completion. Buffers are
//! therefore allocated once up front; each carries an `in_use` flag that
//! is claimed with a compare-and-swap and cleared when the
//! [`PooledBuffer`] handed to the session is dropped.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Slot {
    in_use: AtomicBool,
    data: UnsafeCell<Box<[u8]>>,
}

/// Fixed set of equally sized byte buffers
pub struct BufferPool {
    slots: Box<[Slot]>,
    buffer_size: usize,
    next: AtomicUsize,
    exhausted: AtomicUsize,
}

// A slot's data is only reachable through the single PooledBuffer that
// won the CAS on its in_use flag.
unsafe impl Sync for BufferPool {}
unsafe impl Send for BufferPool {}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Arc<Self> {
        let slots = (0..count.max(1))
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                data: UnsafeCell::new(vec![0u8; buffer_size].into_boxed_slice()),
            })
            .collect();
        Arc::new(Self {
            slots,
            buffer_size,
            next: AtomicUsize::new(0),
            exhausted: AtomicUsize::new(0),
        })
    }

    /// Claim a free buffer, or `None` if all are in flight
    pub fn acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        let count = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..count {
            let index = (start + i) % count;
            if self.slots[index]
                .in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PooledBuffer {
                    pool: self.clone(),
                    index,
                    len: self.buffer_size,
                });
            }
        }
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently claimed
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Relaxed))
            .count()
    }

    /// Times `acquire` found no free buffer
    pub fn exhausted_count(&self) -> usize {
        self.exhausted.load(Ordering::Relaxed)
    }

    fn release(&self, index: usize) {
        self.slots[index].in_use.store(false, Ordering::Release);
    }
}

/// Exclusive handle to one pool buffer; returns it to the pool on drop
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    index: usize,
    len: usize,
}

impl PooledBuffer {
    /// Shrink the visible length, e.g. to the bytes actually written
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.pool.buffer_size);
    }

    /// Zero-copy `Bytes` view; the buffer returns to the pool once the
    /// last clone is dropped
    pub fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from_owner(self)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: this handle holds the slot's in_use flag
        let data = unsafe { &*self.pool.slots[self.index].data.get() };
        &data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle holds the slot's in_use flag
        let data = unsafe { &mut *self.pool.slots[self.index].data.get() };
        &mut data[..self.len]
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(2, 8);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index, b.index);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.exhausted_count(), 1);
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_buffer_is_writable() {
        let pool = BufferPool::new(1, 4);
        let mut buf = pool.acquire().unwrap();
        buf.copy_from_slice(&[1, 2, 3, 4]);
        buf.truncate(2);
        assert_eq!(&buf[..], &[1, 2]);
        drop(buf);

        let buf = pool.acquire().unwrap();
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_bytes_view_releases_on_drop() {
        let pool = BufferPool::new(1, 3);
        let mut buf = pool.acquire().unwrap();
        buf.copy_from_slice(&[7, 8, 9]);

        let bytes = buf.into_bytes();
        let clone = bytes.clone();
        assert_eq!(&clone[..], &[7, 8, 9]);
        drop(bytes);
        assert!(pool.acquire().is_none());
        drop(clone);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let pool = BufferPool::new(4, 1);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(mut buf) = pool.acquire() {
                            buf[0] = buf[0].wrapping_add(1);
                            assert!(pool.in_use() <= 4);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
