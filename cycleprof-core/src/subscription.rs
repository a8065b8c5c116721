//! Reference-counted capture gating.
//!
//! The producer is registered with the engine only while at least one
//! subscriber is bound. While unregistered the registry holds on to it, so
//! the next first subscriber can hand the very same producer back.

use std::sync::Arc;

use log::{error, info, warn};

use crate::host::{DriverListener, ListenerId, NotificationSource};

enum ListenerSlot {
    /// Not registered; the producer is parked here.
    Parked(Box<dyn DriverListener>),
    Registered(ListenerId),
    /// The engine did not give the producer back.
    Lost,
}

/// What a bind or unbind did to the engine registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Stopped,
    Unchanged,
}

pub struct SubscriptionRegistry {
    busy: u32,
    slot: ListenerSlot,
    engine: Arc<dyn NotificationSource>,
}

impl SubscriptionRegistry {
    pub fn new(engine: Arc<dyn NotificationSource>, producer: Box<dyn DriverListener>) -> Self {
        Self {
            busy: 0,
            slot: ListenerSlot::Parked(producer),
            engine,
        }
    }

    pub fn busy(&self) -> u32 {
        self.busy
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.slot, ListenerSlot::Registered(_))
    }

    /// Count a new subscriber. Call only after its resource was allocated.
    pub fn bind(&mut self) -> Transition {
        self.busy += 1;
        if self.busy == 1 {
            info!(target: "profiler", "starting profiler");
            self.start_listener()
        } else {
            Transition::Unchanged
        }
    }

    /// Drop a subscriber.
    pub fn unbind(&mut self) -> Transition {
        if self.busy == 0 {
            warn!(target: "profiler", "unbind without subscribers");
            return Transition::Unchanged;
        }
        self.busy -= 1;
        if self.busy == 0 {
            info!(target: "profiler", "stopping profiler");
            self.stop_listener()
        } else {
            Transition::Unchanged
        }
    }

    /// Deregister regardless of the subscriber count.
    pub fn shutdown(&mut self) {
        self.busy = 0;
        self.stop_listener();
    }

    fn start_listener(&mut self) -> Transition {
        match std::mem::replace(&mut self.slot, ListenerSlot::Lost) {
            ListenerSlot::Parked(producer) => {
                self.slot = ListenerSlot::Registered(self.engine.add_listener(producer));
                Transition::Started
            }
            ListenerSlot::Registered(id) => {
                self.slot = ListenerSlot::Registered(id);
                Transition::Unchanged
            }
            ListenerSlot::Lost => {
                error!(target: "profiler", "producer lost, cannot start capture");
                Transition::Unchanged
            }
        }
    }

    fn stop_listener(&mut self) -> Transition {
        match std::mem::replace(&mut self.slot, ListenerSlot::Lost) {
            ListenerSlot::Registered(id) => {
                match self.engine.remove_listener(id) {
                    Some(producer) => self.slot = ListenerSlot::Parked(producer),
                    None => error!(target: "profiler", "engine did not return listener {:?}", id),
                }
                Transition::Stopped
            }
            other => {
                self.slot = other;
                Transition::Unchanged
            }
        }
    }
}
