//! Messages exchanged between the profiler host and observers.

use serde::{Deserialize, Serialize};

use cycleprof_types::{ServiceInfo, SubscriberHandle};

/// Messages from an observer to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Bind the profiler service.
    Hello { client_name: String },
    /// Unbind and disconnect.
    Goodbye,
}

/// Messages from the host to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The bind succeeded.
    Welcome {
        subscriber: SubscriberHandle,
        service: ServiceInfo,
    },
    /// The bind failed; the connection is closed after this.
    Rejected { reason: String },
    /// One flush batch: a Struct POD of profile records.
    Profile { batch: Vec<u8> },
    /// The profiler is going away.
    Shutdown,
}
