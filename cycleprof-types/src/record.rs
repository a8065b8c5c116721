//! Decoded profile records, as reconstructed by observers.

use serde::{Deserialize, Serialize};

use crate::graph::Fraction;

/// Global information about one cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InfoSection {
    /// Cycle counter. Gaps mean records were dropped.
    pub counter: i64,
    pub cpu_load: [f32; 3],
    pub xrun_count: i32,
}

/// Driver clock at the time of the cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockSection {
    pub flags: u32,
    pub id: u32,
    pub name: String,
    pub nsec: i64,
    pub rate: Fraction,
    pub position: i64,
    pub duration: i64,
    pub delay: i64,
    pub rate_diff: f64,
    pub next_nsec: i64,
}

/// Timing of one node in the cycle, used for the driver and for followers.
///
/// For followers `prev_signal_time` holds the driver's signal time, so that
/// the follower's scheduling delay can be computed from the block alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub id: u32,
    pub name: String,
    pub prev_signal_time: i64,
    pub signal_time: i64,
    pub awake_time: i64,
    pub finish_time: i64,
    pub status: i32,
    pub latency: Fraction,
    pub xrun_count: i32,
}

impl Block {
    /// Nanoseconds between being signaled and waking up.
    pub fn wakeup_delay(&self) -> i64 {
        self.awake_time.saturating_sub(self.signal_time)
    }

    /// Nanoseconds spent processing.
    pub fn busy_time(&self) -> i64 {
        self.finish_time.saturating_sub(self.awake_time)
    }
}

/// One cycle as captured by the profiler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub info: InfoSection,
    pub clock: ClockSection,
    pub driver: Block,
    pub followers: Vec<Block>,
}

impl ProfileRecord {
    /// Number of cycles missing between `self` and a later record.
    pub fn gap_to(&self, next: &ProfileRecord) -> i64 {
        next
            .info
            .counter
            .saturating_sub(self.info.counter)
            .saturating_sub(1)
            .max(0)
    }
}
