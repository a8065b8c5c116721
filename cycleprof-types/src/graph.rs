//! Graph-engine state as seen by the profiler on each cycle.
//!
//! The engine owns all of this; the profiler only borrows it for the duration
//! of one notification and never keeps references past the callback.

use serde::{Deserialize, Serialize};

/// Maximum encoded clock name length in bytes (excluding the terminator).
pub const CLOCK_NAME_MAX: usize = 63;

/// A rational number, used for rates and latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction { num: 0, denom: 0 };

    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    /// Value in seconds, or 0.0 for a zero denominator.
    pub fn as_secs_f64(self) -> f64 {
        if self.denom == 0 {
            0.0
        } else {
            self.num as f64 / self.denom as f64
        }
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

/// Clock flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockFlags(u32);

impl ClockFlags {
    /// The graph is running as fast as possible, not paced by a device.
    pub const FREEWHEEL: ClockFlags = ClockFlags(1 << 0);
    pub const XRUN_RECOVER: ClockFlags = ClockFlags(1 << 1);
    pub const LAZY: ClockFlags = ClockFlags(1 << 2);
    pub const NO_RATE: ClockFlags = ClockFlags(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ClockFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ClockFlags {
    type Output = ClockFlags;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Clock state of the driver for the current cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockInfo {
    pub flags: ClockFlags,
    pub id: u32,
    pub name: String,
    /// Time of the cycle start in nanoseconds (monotonic clock)
    pub nsec: u64,
    pub rate: Fraction,
    /// Position in samples
    pub position: u64,
    /// Cycle length in samples
    pub duration: u64,
    pub delay: i64,
    /// Measured rate correction of the driver
    pub rate_diff: f64,
    /// Estimated start of the next cycle in nanoseconds
    pub next_nsec: u64,
}

impl ClockInfo {
    pub fn is_freewheel(&self) -> bool {
        self.flags.contains(ClockFlags::FREEWHEEL)
    }
}

/// Scheduling status of a node activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ActivationStatus {
    #[default]
    NotTriggered = 0,
    Triggered = 1,
    Awake = 2,
    Finished = 3,
    Inactive = 4,
}

impl ActivationStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::NotTriggered),
            1 => Some(Self::Triggered),
            2 => Some(Self::Awake),
            3 => Some(Self::Finished),
            4 => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Per-node activation record, written by the engine as the cycle progresses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Activation {
    pub status: ActivationStatus,
    pub prev_signal_time: u64,
    pub signal_time: u64,
    pub awake_time: u64,
    pub finish_time: u64,
    /// Short, medium and long window DSP load
    pub cpu_load: [f32; 3],
    pub xrun_count: u32,
}

/// Scheduling properties of a live node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Latency the node negotiated with the graph
    pub latency: Fraction,
    /// Forced quantum, 0 when not forced
    pub force_quantum: u32,
    /// Forced rate, 0 when not forced
    pub force_rate: u32,
    pub rate: Fraction,
}

impl NodeInfo {
    /// Latency to report for a follower.
    ///
    /// A forced quantum replaces the numerator. A forced rate replaces the
    /// denominator, otherwise the node's own rate does when it is known.
    pub fn effective_latency(&self) -> Fraction {
        let mut latency = self.latency;
        if self.force_quantum != 0 {
            latency.num = self.force_quantum;
        }
        if self.force_rate != 0 {
            latency.denom = self.force_rate;
        } else if self.rate.denom != 0 {
            latency.denom = self.rate.denom;
        }
        latency
    }
}

/// Target flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetFlags(u32);

impl TargetFlags {
    /// Target is a peer that is woken but not scheduled by this driver.
    pub const PEER: TargetFlags = TargetFlags(1 << 0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TargetFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One entry of the driver's target list.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub id: u32,
    pub name: &'a str,
    pub flags: TargetFlags,
    pub activation: &'a Activation,
    /// `None` when the node was torn down while the cycle was running.
    pub node: Option<&'a NodeInfo>,
}

impl Target<'_> {
    pub fn latency(&self) -> Fraction {
        self.node.map(NodeInfo::effective_latency).unwrap_or(Fraction::ZERO)
    }
}

/// Everything the profiler may read about one driver cycle.
#[derive(Debug, Clone, Copy)]
pub struct DriverCycle<'a> {
    pub id: u32,
    pub name: &'a str,
    pub activation: &'a Activation,
    pub clock: &'a ClockInfo,
    pub latency: Fraction,
    /// Targets in scheduling order. Contains the driver itself.
    pub targets: &'a [Target<'a>],
}

impl<'a> DriverCycle<'a> {
    /// Targets that are scheduled followers of this driver.
    pub fn followers(&self) -> impl Iterator<Item = &'a Target<'a>> + 'a {
        let id = self.id;
        self.targets
            .iter()
            .filter(move |t| t.id != id && !t.flags.contains(TargetFlags::PEER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_prefers_forced_quantum_and_rate() {
        let node = NodeInfo {
            latency: Fraction::new(256, 48000),
            force_quantum: 128,
            force_rate: 44100,
            rate: Fraction::new(1, 96000),
        };
        assert_eq!(node.effective_latency(), Fraction::new(128, 44100));
    }

    #[test]
    fn latency_uses_node_rate_without_forced_rate() {
        let node = NodeInfo {
            latency: Fraction::new(256, 48000),
            force_quantum: 0,
            force_rate: 0,
            rate: Fraction::new(1, 96000),
        };
        assert_eq!(node.effective_latency(), Fraction::new(256, 96000));
    }

    #[test]
    fn latency_keeps_negotiated_value_without_overrides() {
        let node = NodeInfo {
            latency: Fraction::new(1024, 48000),
            ..Default::default()
        };
        assert_eq!(node.effective_latency(), Fraction::new(1024, 48000));
    }

    #[test]
    fn torn_down_target_has_zero_latency() {
        let activation = Activation::default();
        let target = Target {
            id: 7,
            name: "gone",
            flags: TargetFlags::empty(),
            activation: &activation,
            node: None,
        };
        assert_eq!(target.latency(), Fraction::ZERO);
    }

    #[test]
    fn followers_skip_driver_and_peers() {
        let activation = Activation::default();
        let node = NodeInfo::default();
        let targets = [
            Target { id: 1, name: "driver", flags: TargetFlags::empty(), activation: &activation, node: Some(&node) },
            Target { id: 2, name: "a", flags: TargetFlags::empty(), activation: &activation, node: Some(&node) },
            Target { id: 3, name: "peer", flags: TargetFlags::PEER, activation: &activation, node: Some(&node) },
            Target { id: 4, name: "b", flags: TargetFlags::empty(), activation: &activation, node: None },
        ];
        let clock = ClockInfo::default();
        let cycle = DriverCycle {
            id: 1,
            name: "driver",
            activation: &activation,
            clock: &clock,
            latency: Fraction::ZERO,
            targets: &targets,
        };
        let ids: Vec<u32> = cycle.followers().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn freewheel_flag_detected() {
        let clock = ClockInfo {
            flags: ClockFlags::FREEWHEEL | ClockFlags::LAZY,
            ..Default::default()
        };
        assert!(clock.is_freewheel());
        assert!(!ClockInfo::default().is_freewheel());
    }
}
