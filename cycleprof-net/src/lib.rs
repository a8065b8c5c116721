//! Network resource host for the cycleprof profiler.
//!
//! Observers connect over TCP, bind the profiler service with a `Hello` and
//! receive every flushed batch until they say `Goodbye` or disconnect.

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;

pub use client::{PendingClient, ProfilerClient};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::NetHost;
