//! Seams to the collaborators around the profiler.
//!
//! `NotificationSource` is the graph engine's driver notification hook and
//! `ResourceHost` the resource layer that owns client connections. The
//! profiler itself is driven through `ModuleLifecycle`.

use cycleprof_types::{ClientId, DriverCycle, ServiceInfo, SubscriberHandle};

use crate::error::ProfilerResult;

/// Receives driver cycle notifications on the engine's real-time thread.
///
/// Implementations must not block, allocate or take locks.
pub trait DriverListener: Send {
    /// The cycle ended before every node finished.
    fn incomplete(&mut self, cycle: &DriverCycle<'_>);
    /// The cycle ended with every node finished.
    fn complete(&mut self, cycle: &DriverCycle<'_>);
}

/// Registration token for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The engine's driver notification source.
pub trait NotificationSource: Send + Sync {
    /// Start delivering notifications to `listener`, from the next cycle on.
    fn add_listener(&self, listener: Box<dyn DriverListener>) -> ListenerId;

    /// Stop delivering to `id` and hand the listener back.
    ///
    /// When this returns the listener is not running and will not run again.
    /// Removing an unknown id returns `None`.
    fn remove_listener(&self, id: ListenerId) -> Option<Box<dyn DriverListener>>;
}

/// Something the resource layer reports to the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A client asked to bind the profiler service.
    Bind(ClientId),
    /// A bound resource went away.
    Destroy(SubscriberHandle),
}

/// Outcome of delivering one batch to every bound resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Resources that could not take the batch. The host has already
    /// released them.
    pub dropped: Vec<SubscriberHandle>,
}

/// The resource layer: owns client connections and bound resources.
pub trait ResourceHost {
    /// Collect pending binds and resource destructions.
    fn poll_events(&mut self) -> Vec<HostEvent>;

    /// Create a resource for `client` and announce `service` to it.
    fn allocate(
        &mut self,
        client: ClientId,
        service: &ServiceInfo,
    ) -> Result<SubscriberHandle, String>;

    /// Destroy a resource. Unknown handles are ignored.
    fn release(&mut self, handle: SubscriberHandle);

    /// Send `batch` to every bound resource. A failing resource must not
    /// prevent delivery to the others.
    fn deliver_all(&mut self, batch: &[u8]) -> Delivery;

    /// The service is going away; close every resource.
    fn shutdown(&mut self) {}
}

/// Lifecycle events dispatched to the profiler by its owner.
pub trait ModuleLifecycle {
    fn on_bind(&mut self, client: ClientId) -> ProfilerResult<SubscriberHandle>;
    fn on_unbind(&mut self, handle: SubscriberHandle);
    fn on_shutdown(&mut self);
}
