//! # cycleprof-types
//!
//! Shared type definitions for the cycleprof workspace.
//! The graph-engine state handed to the profiler on every cycle, the
//! identifiers used by the resource layer, and the profile record format
//! (constants plus an observer-side parser).

pub mod graph;
pub mod pod;
pub mod record;

pub use graph::{
    Activation, ActivationStatus, ClockFlags, ClockInfo, DriverCycle, Fraction, NodeInfo, Target,
    TargetFlags, CLOCK_NAME_MAX,
};
pub use pod::{parse_batch, parse_records, PodError};
pub use record::{Block, ClockSection, InfoSection, ProfileRecord};

/// Identifier the resource host assigns to a connected (not yet bound) client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handle of a bound profiler resource. One per subscribed client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SubscriberHandle(u64);

impl SubscriberHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Description of the profiler service as advertised to binding clients.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub global_id: u32,
}

/// Interface version of the profiler service.
pub const PROFILER_VERSION: u32 = 3;

impl ServiceInfo {
    pub fn profiler(global_id: u32) -> Self {
        Self {
            name: "profiler".to_string(),
            version: PROFILER_VERSION,
            description: "Generate profiling data".to_string(),
            global_id,
        }
    }
}
