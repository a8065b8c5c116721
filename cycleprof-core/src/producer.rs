//! Real-time side of the profiler.
//!
//! `CycleProducer` is registered with the engine and runs on its thread once
//! per notification. Everything it shares with the consumer is either the
//! ring or an atomic in `ProducerShared`; it never logs, blocks or allocates.

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use cycleprof_types::DriverCycle;

use crate::host::DriverListener;
use crate::record_builder::RecordBuilder;
use crate::ring_buffer::{RingError, RingProducer};

/// State published across the real-time boundary.
#[derive(Debug, Default)]
pub struct ProducerShared {
    /// Next cycle counter value; advanced by the producer only.
    cycles: AtomicI64,
    /// Mirror of the scheduler's `flushing` flag; written by the consumer only.
    flushing: AtomicBool,
    dropped_too_large: AtomicU64,
    dropped_overflow: AtomicU64,
    /// Fill level seen by the most recent overflow
    last_overflow_fill: AtomicU32,
    /// Size of the record the most recent overflow rejected
    last_overflow_needed: AtomicU32,
    /// Size of the most recent oversized record
    last_too_large_size: AtomicU32,
}

impl ProducerShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycles counted so far (the counter the next record will carry).
    pub fn cycles(&self) -> i64 {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    pub fn drop_counts(&self) -> DropCounts {
        DropCounts {
            too_large: self.dropped_too_large.load(Ordering::Relaxed),
            overflow: self.dropped_overflow.load(Ordering::Relaxed),
            last_overflow_fill: self.last_overflow_fill.load(Ordering::Relaxed),
            last_overflow_needed: self.last_overflow_needed.load(Ordering::Relaxed),
            last_too_large_size: self.last_too_large_size.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the producer's drop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub too_large: u64,
    pub overflow: u64,
    pub last_overflow_fill: u32,
    pub last_overflow_needed: u32,
    pub last_too_large_size: u32,
}

/// What happened to one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Freewheel cycle, nothing recorded.
    Skipped,
    Written { len: usize, filled: u32 },
    TooLarge { size: usize },
    Overflow(RingError),
}

pub struct CycleProducer {
    builder: RecordBuilder,
    ring: RingProducer,
    shared: Arc<ProducerShared>,
    doorbell: Sender<()>,
    flush_threshold: usize,
    count: i64,
}

impl CycleProducer {
    pub fn new(
        builder: RecordBuilder,
        ring: RingProducer,
        shared: Arc<ProducerShared>,
        doorbell: Sender<()>,
        flush_threshold: usize,
    ) -> Self {
        let count = shared.cycles();
        Self {
            builder,
            ring,
            shared,
            doorbell,
            flush_threshold,
            count,
        }
    }

    /// Record one cycle.
    pub fn profile(&mut self, cycle: &DriverCycle<'_>) -> CycleOutcome {
        if cycle.clock.is_freewheel() {
            return CycleOutcome::Skipped;
        }
        let outcome = self.append(cycle);
        self.count += 1;
        self.shared.cycles.store(self.count, Ordering::Release);
        outcome
    }

    fn append(&mut self, cycle: &DriverCycle<'_>) -> CycleOutcome {
        let record = match self.builder.build(self.count, cycle) {
            Ok(record) => record,
            Err(e) => {
                self.shared.dropped_too_large.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_too_large_size
                    .store(e.size.min(u32::MAX as usize) as u32, Ordering::Relaxed);
                return CycleOutcome::TooLarge { size: e.size };
            }
        };
        let len = record.len();
        match self.ring.write(record) {
            Ok(filled) => {
                // Either this sees `flushing` cleared or the idle disarm sees the record.
                fence(Ordering::SeqCst);
                if !self.shared.is_flushing() || filled as usize + len > self.flush_threshold {
                    // One slot: a pending request already covers this one.
                    let _ = self.doorbell.try_send(());
                }
                CycleOutcome::Written { len, filled }
            }
            Err(e) => {
                let filled = match e {
                    RingError::Full { filled, .. } | RingError::Xrun { filled } => filled,
                };
                self.shared.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                self.shared.last_overflow_fill.store(filled, Ordering::Relaxed);
                self.shared
                    .last_overflow_needed
                    .store(len.min(u32::MAX as usize) as u32, Ordering::Relaxed);
                CycleOutcome::Overflow(e)
            }
        }
    }
}

impl DriverListener for CycleProducer {
    fn incomplete(&mut self, cycle: &DriverCycle<'_>) {
        self.profile(cycle);
    }

    fn complete(&mut self, cycle: &DriverCycle<'_>) {
        self.profile(cycle);
    }
}
