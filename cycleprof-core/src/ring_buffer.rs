//! Lock-free single-producer/single-consumer byte ring.
//!
//! The storage is a fixed power-of-two array allocated once. Two free-running
//! `u32` cursors coordinate the halves; a byte position is `index & mask`.
//! At every consistent observation `write_index - read_index` (wrapping) lies
//! in `0..=capacity`.
//!
//! - The producer copies the payload, then publishes `write_index` (Release).
//! - The consumer loads `write_index` (Acquire), copies the payload out, then
//!   publishes `read_index` (Release).
//!
//! Writes are all-or-nothing: a record that does not fit is rejected and
//! leaves both the cursor and the contents untouched.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Largest supported capacity. Keeps the fill level representable in `u32`.
pub const MAX_CAPACITY: usize = 1 << 31;

/// Error returned by [`RingProducer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free space for the whole record.
    Full { filled: u32, needed: usize },
    /// The cursors are inconsistent (more bytes queued than capacity).
    Xrun { filled: u32 },
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { filled, needed } => {
                write!(f, "queue full: {} bytes queued, {} needed", filled, needed)
            }
            Self::Xrun { filled } => write!(f, "queue xrun: {} bytes queued", filled),
        }
    }
}

impl std::error::Error for RingError {}

/// Shared storage and cursors.
struct RingShared {
    data: Box<[UnsafeCell<u8>]>,
    mask: u32,
    write_index: CachePadded<AtomicU32>,
    read_index: CachePadded<AtomicU32>,
}

// Safety: the producer only writes the free region and the consumer only reads
// the filled region; the cursor protocol keeps the two disjoint. Each half is
// owned by exactly one handle, so there is one writer and one reader.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn capacity(&self) -> u32 {
        self.mask.wrapping_add(1)
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    /// Copy `src` into storage starting at cursor `index`, splitting at the end.
    ///
    /// # Safety
    /// The region `index..index + src.len()` must be free and owned by the caller.
    unsafe fn copy_in(&self, index: u32, src: &[u8]) {
        let cap = self.capacity() as usize;
        let offset = (index & self.mask) as usize;
        let first = src.len().min(cap - offset);
        let base = self.base();
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), first);
        if first < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Copy from storage starting at cursor `index` into `dst`, splitting at the end.
    ///
    /// # Safety
    /// The region `index..index + dst.len()` must be filled and owned by the caller.
    unsafe fn copy_out(&self, index: u32, dst: &mut [u8]) {
        let cap = self.capacity() as usize;
        let offset = (index & self.mask) as usize;
        let first = dst.len().min(cap - offset);
        let base = self.base() as *const u8;
        ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), first);
        if first < dst.len() {
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// Create a ring of `capacity` bytes, returning the producer and consumer halves.
///
/// Panics if `capacity` is not a power of two in `1..=MAX_CAPACITY`.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(
        capacity.is_power_of_two() && capacity <= MAX_CAPACITY,
        "ring capacity must be a power of two up to {}",
        MAX_CAPACITY
    );
    let data: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(RingShared {
        data,
        mask: (capacity - 1) as u32,
        write_index: CachePadded::new(AtomicU32::new(0)),
        read_index: CachePadded::new(AtomicU32::new(0)),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Writing half. Lives on the real-time thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity() as usize
    }

    /// Bytes currently queued, as seen by the producer.
    pub fn filled(&self) -> u32 {
        let write = self.shared.write_index.load(Ordering::Relaxed);
        let read = self.shared.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Append `bytes` as one unit.
    ///
    /// Returns the fill level before the write. Constant time, never blocks,
    /// never allocates.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) -> Result<u32, RingError> {
        let shared = &*self.shared;
        let write = shared.write_index.load(Ordering::Relaxed);
        let read = shared.read_index.load(Ordering::Acquire);
        let filled = write.wrapping_sub(read);
        let capacity = shared.capacity();
        if filled > capacity {
            return Err(RingError::Xrun { filled });
        }
        if ((capacity - filled) as usize) < bytes.len() {
            return Err(RingError::Full {
                filled,
                needed: bytes.len(),
            });
        }
        // Safety: the free region starts at `write` and holds at least
        // `bytes.len()` bytes; the consumer does not touch it until published.
        unsafe { shared.copy_in(write, bytes) };
        shared
            .write_index
            .store(write.wrapping_add(bytes.len() as u32), Ordering::Release);
        Ok(filled)
    }
}

/// Reading half. Lives on the consumer loop.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity() as usize
    }

    /// Bytes readable right now.
    pub fn read_available(&self) -> usize {
        let write = self.shared.write_index.load(Ordering::Acquire);
        let read = self.shared.read_index.load(Ordering::Relaxed);
        write.wrapping_sub(read) as usize
    }

    /// Copy up to `dst.len()` queued bytes into `dst` and consume them.
    ///
    /// Returns the number of bytes copied.
    pub fn drain(&mut self, dst: &mut [u8]) -> usize {
        let shared = &*self.shared;
        let write = shared.write_index.load(Ordering::Acquire);
        let read = shared.read_index.load(Ordering::Relaxed);
        let avail = (write.wrapping_sub(read) as usize).min(shared.capacity() as usize);
        let n = avail.min(dst.len());
        if n == 0 {
            return 0;
        }
        // Safety: `read..read + n` was published by the producer and stays
        // ours until `read_index` moves past it.
        unsafe { shared.copy_out(read, &mut dst[..n]) };
        shared
            .read_index
            .store(read.wrapping_add(n as u32), Ordering::Release);
        n
    }

    /// Drop everything queued without copying it. Returns the bytes dropped.
    pub fn discard(&mut self) -> usize {
        let shared = &*self.shared;
        let write = shared.write_index.load(Ordering::Acquire);
        let read = shared.read_index.load(Ordering::Relaxed);
        shared.read_index.store(write, Ordering::Release);
        write.wrapping_sub(read) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_then_drain() {
        let (mut tx, mut rx) = ring_buffer(64);
        assert_eq!(tx.write(b"hello").unwrap(), 0);
        assert_eq!(rx.read_available(), 5);

        let mut out = [0u8; 16];
        assert_eq!(rx.drain(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(rx.read_available(), 0);
    }

    #[test]
    fn test_wraparound_40_40_40() {
        let (mut tx, mut rx) = ring_buffer(64);
        let a = pattern(40, 0);
        let b = pattern(40, 100);
        let c = pattern(40, 200);

        tx.write(&a).unwrap();
        assert_eq!(
            tx.write(&b),
            Err(RingError::Full { filled: 40, needed: 40 })
        );
        assert_eq!(rx.read_available(), 40);

        let mut out = vec![0u8; 64];
        assert_eq!(rx.drain(&mut out), 40);
        assert_eq!(&out[..40], &a[..]);

        // Starts at offset 40 and wraps past the end of the array.
        assert_eq!(tx.write(&c).unwrap(), 0);
        assert_eq!(rx.read_available(), 40);
        assert_eq!(rx.drain(&mut out), 40);
        assert_eq!(&out[..40], &c[..]);
    }

    #[test]
    fn test_interleaved_40s_match_reference() {
        let (mut tx, mut rx) = ring_buffer(64);
        let mut reference = Vec::new();
        let mut received = Vec::new();
        let mut out = vec![0u8; 64];

        let a = pattern(40, 1);
        tx.write(&a).unwrap();
        reference.extend_from_slice(&a);
        let n = rx.drain(&mut out);
        received.extend_from_slice(&out[..n]);

        // Cursor at 40: this one is split 24 + 16.
        let b = pattern(40, 50);
        tx.write(&b).unwrap();
        reference.extend_from_slice(&b);
        assert!(tx.write(&pattern(40, 90)).is_err());

        let n = rx.drain(&mut out);
        received.extend_from_slice(&out[..n]);

        let d = pattern(40, 130);
        tx.write(&d).unwrap();
        reference.extend_from_slice(&d);
        let n = rx.drain(&mut out);
        received.extend_from_slice(&out[..n]);

        assert_eq!(received, reference);
    }

    #[test]
    fn test_rejected_write_leaves_contents() {
        let (mut tx, mut rx) = ring_buffer(64);
        let a = pattern(40, 7);
        tx.write(&a).unwrap();
        let before = tx.filled();
        assert!(tx.write(&pattern(25, 1)).is_err());
        assert_eq!(tx.filled(), before);

        let mut out = vec![0u8; 64];
        assert_eq!(rx.drain(&mut out), 40);
        assert_eq!(&out[..40], &a[..]);
    }

    #[test]
    fn test_exact_fill_is_allowed() {
        let (mut tx, mut rx) = ring_buffer(64);
        tx.write(&pattern(64, 3)).unwrap();
        assert_eq!(rx.read_available(), 64);
        assert!(tx.write(&[0]).is_err());
    }

    #[test]
    fn test_conservation_against_reference() {
        // Uneven sizes so writes straddle the boundary at many offsets.
        let (mut tx, mut rx) = ring_buffer(64);
        let mut reference = Vec::new();
        let mut received = Vec::new();
        let mut out = vec![0u8; 64];
        let sizes = [13usize, 29, 7, 41, 3, 64, 17, 50, 1, 33];

        for round in 0..20u8 {
            for (i, &len) in sizes.iter().enumerate() {
                let chunk = pattern(len, round.wrapping_mul(31).wrapping_add(i as u8));
                if tx.write(&chunk).is_ok() {
                    reference.extend_from_slice(&chunk);
                }
                let filled = tx.filled() as usize;
                assert!(filled <= 64);
                if i % 3 == 0 {
                    let n = rx.drain(&mut out[..(len % 48) + 1]);
                    received.extend_from_slice(&out[..n]);
                }
            }
            let n = rx.drain(&mut out);
            received.extend_from_slice(&out[..n]);
        }
        assert_eq!(received, reference);
    }

    #[test]
    fn test_drain_stops_at_available() {
        let (mut tx, mut rx) = ring_buffer(16);
        tx.write(&[1, 2, 3]).unwrap();
        let mut four = [0u8; 4];
        assert_eq!(rx.drain(&mut four), 3);
        assert_eq!(&four[..3], &[1, 2, 3]);
        assert_eq!(rx.read_available(), 0);
    }

    #[test]
    fn test_discard() {
        let (mut tx, mut rx) = ring_buffer(16);
        tx.write(&[9; 10]).unwrap();
        assert_eq!(rx.discard(), 10);
        assert_eq!(rx.read_available(), 0);
        assert_eq!(tx.filled(), 0);
    }

    #[test]
    fn test_cursor_wrap_of_u32() {
        let (mut tx, mut rx) = ring_buffer(16);
        tx.shared.write_index.store(u32::MAX - 4, Ordering::Relaxed);
        tx.shared.read_index.store(u32::MAX - 4, Ordering::Relaxed);
        tx.write(&pattern(12, 0)).unwrap();
        assert_eq!(rx.read_available(), 12);
        let mut out = [0u8; 12];
        assert_eq!(rx.drain(&mut out), 12);
        assert_eq!(out.to_vec(), pattern(12, 0));
    }

    #[test]
    fn test_threaded_stream() {
        let (mut tx, mut rx) = ring_buffer(256);
        const TOTAL: usize = 100_000;

        let writer = std::thread::spawn(move || {
            let mut sent = 0usize;
            while sent < TOTAL {
                let len = (sent % 37 + 1).min(TOTAL - sent);
                let chunk: Vec<u8> = (sent..sent + len).map(|i| i as u8).collect();
                if tx.write(&chunk).is_ok() {
                    sent += len;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut got = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 256];
        while got.len() < TOTAL {
            let n = rx.drain(&mut buf);
            if n == 0 {
                std::thread::yield_now();
            }
            got.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();

        for (i, b) in got.iter().enumerate() {
            assert_eq!(*b, i as u8, "mismatch at {}", i);
        }
    }
}
