//! # cycleprof-core
//!
//! The profiler: a real-time producer that records one profile per driver
//! cycle into a lock-free ring, and a consumer that drains the ring on a
//! timer and broadcasts batches to bound subscribers.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod flush;
pub mod host;
pub mod pod_builder;
pub mod producer;
pub mod profiler;
pub mod record_builder;
pub mod ring_buffer;
pub mod simulate;
pub mod subscription;
pub mod timer;

pub use config::{Config, ProfilerConfig};
pub use error::{ProfilerError, ProfilerResult};
pub use event_loop::{LoopCommand, ProfilerLoop};
pub use host::{
    Delivery, DriverListener, HostEvent, ListenerId, ModuleLifecycle, NotificationSource,
    ResourceHost,
};
pub use producer::{CycleOutcome, CycleProducer, DropCounts, ProducerShared};
pub use profiler::{Dispatched, Profiler};
pub use ring_buffer::{ring_buffer, RingConsumer, RingError, RingProducer};
pub use simulate::{LocalNotifier, SimConfig, SimHandle, SimulatedGraph};
