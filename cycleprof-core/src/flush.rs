//! Timer-driven drain of the ring into broadcast batches.
//!
//! Idle: timer disarmed. Armed: first fire right away, then every `interval`.
//! A fire with nothing queued counts as idle; `idle_threshold` idle fires in a
//! row disarm the timer. A fire with data drains everything queued into one
//! batch: a Struct POD header followed by the raw records.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace};

use cycleprof_types::pod::{POD_HEADER_SIZE, TYPE_STRUCT};

use crate::producer::ProducerShared;
use crate::ring_buffer::RingConsumer;
use crate::timer::FlushTimer;

/// Delay before the first fire after arming.
const FIRST_FIRE: Duration = Duration::ZERO;

/// Result of one timer fire.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushFire<'a> {
    /// Nothing queued; the idle count after this fire.
    Idle { idle_count: u32, disarmed: bool },
    /// A batch ready for delivery.
    Batch(&'a [u8]),
    /// Queued bytes could not be drained; they stay queued.
    DrainFailed { available: usize },
}

pub struct FlushScheduler {
    flushing: bool,
    idle_count: u32,
    idle_threshold: u32,
    interval: Duration,
    timer: FlushTimer,
    /// Batch header plus room for a full ring
    flush: Box<[u8]>,
    shared: Arc<ProducerShared>,
}

impl FlushScheduler {
    pub fn new(
        capacity: usize,
        interval: Duration,
        idle_threshold: u32,
        shared: Arc<ProducerShared>,
    ) -> Self {
        shared.set_flushing(false);
        Self {
            flushing: false,
            idle_count: 0,
            idle_threshold,
            interval,
            timer: FlushTimer::new(),
            flush: vec![0u8; capacity + POD_HEADER_SIZE].into_boxed_slice(),
            shared,
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.next_deadline()
    }

    /// Arm the timer. When already armed this pulls the next fire forward.
    pub fn start(&mut self, now: Instant) {
        self.timer.arm(now, FIRST_FIRE, self.interval);
        self.flushing = true;
        self.shared.set_flushing(true);
    }

    pub fn stop(&mut self) {
        if !self.flushing {
            return;
        }
        self.timer.disarm();
        self.flushing = false;
        self.idle_count = 0;
        self.shared.set_flushing(false);
    }

    /// Run the timer at `now`. Returns `None` when no fire was due.
    pub fn poll(&mut self, now: Instant, ring: &mut RingConsumer) -> Option<FlushFire<'_>> {
        let expirations = self.timer.expirations(now);
        if expirations == 0 {
            return None;
        }
        Some(self.fire(now, ring))
    }

    /// One timer fire.
    pub fn fire(&mut self, now: Instant, ring: &mut RingConsumer) -> FlushFire<'_> {
        let available = ring.read_available();
        trace!(target: "profiler::flush", "avail {}", available);

        if available == 0 {
            self.idle_count += 1;
            let idle_count = self.idle_count;
            let disarmed = idle_count >= self.idle_threshold && self.disarm_idle(now, ring);
            return FlushFire::Idle { idle_count, disarmed };
        }
        self.idle_count = 0;

        let room = self.flush.len() - POD_HEADER_SIZE;
        if available > room {
            error!(
                target: "profiler::flush",
                "cannot flush {} bytes into a {} byte buffer", available, room
            );
            return FlushFire::DrainFailed { available };
        }

        let n = ring.drain(&mut self.flush[POD_HEADER_SIZE..POD_HEADER_SIZE + available]);
        if n != available {
            error!(
                target: "profiler::flush",
                "short drain: {} of {} bytes", n, available
            );
        }
        self.flush[..4].copy_from_slice(&(n as u32).to_le_bytes());
        self.flush[4..8].copy_from_slice(&TYPE_STRUCT.to_le_bytes());
        FlushFire::Batch(&self.flush[..POD_HEADER_SIZE + n])
    }

    /// Stop after the idle run. Returns false when the timer stayed armed.
    ///
    /// A record published before the producer saw `flushing` cleared did not
    /// ring the doorbell, so it is picked up here instead.
    fn disarm_idle(&mut self, now: Instant, ring: &RingConsumer) -> bool {
        self.stop();
        // Pairs with the fence in the producer after its ring write.
        fence(Ordering::SeqCst);
        let available = ring.read_available();
        if available == 0 {
            return true;
        }
        trace!(target: "profiler::flush", "{} bytes queued during disarm, re-arming", available);
        self.start(now);
        false
    }
}
