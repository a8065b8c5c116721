//! The profiler component.
//!
//! Owns everything on the consumer side: the subscription registry, the flush
//! scheduler, the read end of the ring and the resource host. All of it runs
//! in one context (the `ProfilerLoop` thread or a test), so none of it is
//! shared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use cycleprof_types::{ClientId, ServiceInfo, SubscriberHandle};

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, ProfilerResult};
use crate::flush::{FlushFire, FlushScheduler};
use crate::host::{HostEvent, ModuleLifecycle, NotificationSource, ResourceHost};
use crate::producer::{CycleProducer, DropCounts, ProducerShared};
use crate::record_builder::RecordBuilder;
use crate::ring_buffer::{ring_buffer, RingConsumer};
use crate::subscription::{SubscriptionRegistry, Transition};

/// What one `dispatch` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// No timer fire was due.
    Nothing,
    Idle { idle_count: u32, disarmed: bool },
    Delivered { bytes: usize, delivered: usize, dropped: usize },
    DrainFailed { available: usize },
}

pub struct Profiler<H: ResourceHost> {
    config: ProfilerConfig,
    registry: SubscriptionRegistry,
    scheduler: FlushScheduler,
    ring: RingConsumer,
    shared: Arc<ProducerShared>,
    doorbell: Receiver<()>,
    host: H,
    service: ServiceInfo,
    bound: HashSet<SubscriberHandle>,
    /// Drop counters already logged
    reported: DropCounts,
    shut_down: bool,
}

impl<H: ResourceHost> Profiler<H> {
    /// Allocate the ring, scratch and flush buffers and park the producer.
    ///
    /// Nothing is registered with `engine` until the first subscriber binds.
    pub fn new(
        config: ProfilerConfig,
        engine: Arc<dyn NotificationSource>,
        host: H,
    ) -> ProfilerResult<Self> {
        config.validate()?;

        let (ring_tx, ring_rx) = ring_buffer(config.buffer_capacity);
        let shared = Arc::new(ProducerShared::new());
        let (bell_tx, bell_rx) = crossbeam_channel::bounded(1);
        let producer = CycleProducer::new(
            RecordBuilder::new(config.scratch_size),
            ring_tx,
            Arc::clone(&shared),
            bell_tx,
            config.flush_threshold,
        );
        let registry = SubscriptionRegistry::new(engine, Box::new(producer));
        let scheduler = FlushScheduler::new(
            config.buffer_capacity,
            config.interval,
            config.idle_threshold,
            Arc::clone(&shared),
        );
        debug!(
            target: "profiler",
            "profiler ready: {} byte queue, {} byte records, flush every {:?}",
            config.buffer_capacity, config.scratch_size, config.interval
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            ring: ring_rx,
            shared,
            doorbell: bell_rx,
            host,
            service: ServiceInfo::profiler(0),
            bound: HashSet::new(),
            reported: DropCounts::default(),
            shut_down: false,
        })
    }

    /// Set the global id advertised to binding clients.
    pub fn with_global_id(mut self, global_id: u32) -> Self {
        self.service.global_id = global_id;
        self
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Number of bound subscribers.
    pub fn busy(&self) -> u32 {
        self.registry.busy()
    }

    pub fn is_listening(&self) -> bool {
        self.registry.is_listening()
    }

    pub fn is_flushing(&self) -> bool {
        self.scheduler.is_flushing()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Cycles the producer has counted.
    pub fn cycles(&self) -> i64 {
        self.shared.cycles()
    }

    /// Records the producer dropped so far.
    pub fn drop_counts(&self) -> DropCounts {
        self.shared.drop_counts()
    }

    pub fn queued(&self) -> usize {
        self.ring.read_available()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Flush requests from the producer.
    pub fn doorbell(&self) -> &Receiver<()> {
        &self.doorbell
    }

    /// Arm the flush timer, first fire at `now`.
    pub fn start_flush(&mut self, now: Instant) {
        if !self.registry.is_listening() {
            return;
        }
        self.scheduler.start(now);
    }

    /// Handle a producer flush request.
    pub fn on_doorbell(&mut self, now: Instant) {
        self.start_flush(now);
    }

    /// Feed host events into the lifecycle.
    pub fn poll_host(&mut self) {
        for event in self.host.poll_events() {
            match event {
                HostEvent::Bind(client) => {
                    if let Err(e) = self.on_bind(client) {
                        warn!(target: "profiler", "bind of {} failed: {}", client, e);
                    }
                }
                HostEvent::Destroy(handle) => self.on_unbind(handle),
            }
        }
    }

    /// Take pending flush requests, run the timer and deliver what it drained.
    pub fn dispatch(&mut self, now: Instant) -> Dispatched {
        while self.doorbell.try_recv().is_ok() {
            self.on_doorbell(now);
        }
        self.report_drops();

        let Some(fire) = self.scheduler.poll(now, &mut self.ring) else {
            return Dispatched::Nothing;
        };
        let (bytes, delivery) = match fire {
            FlushFire::Idle { idle_count, disarmed } => {
                if disarmed {
                    debug!(target: "profiler::flush", "idle, flush timer disarmed");
                }
                return Dispatched::Idle { idle_count, disarmed };
            }
            FlushFire::DrainFailed { available } => return Dispatched::DrainFailed { available },
            FlushFire::Batch(batch) => (batch.len(), self.host.deliver_all(batch)),
        };

        let dropped = delivery.dropped.len();
        if dropped > 0 {
            let e = ProfilerError::FlushDeliveryFailure {
                failed: dropped,
                delivered: delivery.delivered,
            };
            warn!(target: "profiler::flush", "{}", e);
            for handle in delivery.dropped {
                self.forget(handle);
            }
        }
        Dispatched::Delivered {
            bytes,
            delivered: delivery.delivered,
            dropped,
        }
    }

    fn report_drops(&mut self) {
        let counts = self.shared.drop_counts();
        if counts.too_large > self.reported.too_large {
            let e = ProfilerError::RecordTooLarge {
                size: counts.last_too_large_size as usize,
                limit: self.config.scratch_size,
            };
            warn!(
                target: "profiler",
                "{} ({} record(s) dropped)",
                e,
                counts.too_large - self.reported.too_large
            );
        }
        if counts.overflow > self.reported.overflow {
            let e = overflow_error(&counts);
            warn!(
                target: "profiler",
                "{} ({} record(s) dropped)",
                e,
                counts.overflow - self.reported.overflow
            );
        }
        self.reported = counts;
    }

    /// Unbind a handle the host already released.
    fn forget(&mut self, handle: SubscriberHandle) {
        if !self.bound.remove(&handle) {
            return;
        }
        debug!(target: "profiler", "subscriber {} gone", handle);
        if self.registry.unbind() == Transition::Stopped {
            self.go_idle();
        }
    }

    fn go_idle(&mut self) {
        self.scheduler.stop();
        while self.doorbell.try_recv().is_ok() {}
        let discarded = self.ring.discard();
        if discarded > 0 {
            debug!(target: "profiler", "discarded {} queued bytes", discarded);
        }
    }
}

/// The most recent overflow as an error.
fn overflow_error(counts: &DropCounts) -> ProfilerError {
    ProfilerError::RingOverflow {
        filled: counts.last_overflow_fill,
        needed: counts.last_overflow_needed as usize,
    }
}

impl<H: ResourceHost> ModuleLifecycle for Profiler<H> {
    fn on_bind(&mut self, client: ClientId) -> ProfilerResult<SubscriberHandle> {
        if self.shut_down {
            return Err(ProfilerError::ShutDown);
        }
        let handle = self
            .host
            .allocate(client, &self.service)
            .map_err(ProfilerError::ResourceAllocationFailed)?;
        self.bound.insert(handle);
        self.registry.bind();
        info!(
            target: "profiler",
            "{} bound as {} ({} subscriber(s))",
            client,
            handle,
            self.registry.busy()
        );
        Ok(handle)
    }

    fn on_unbind(&mut self, handle: SubscriberHandle) {
        self.host.release(handle);
        self.forget(handle);
    }

    fn on_shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.registry.shutdown();
        self.go_idle();
        self.bound.clear();
        self.host.shutdown();
        info!(target: "profiler", "profiler shut down after {} cycles", self.cycles());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Delivery;
    use crate::simulate::{LocalNotifier, SimConfig, SimulatedGraph};
    use std::time::Duration;

    #[derive(Default)]
    struct TestHost {
        next: u64,
        live: Vec<SubscriberHandle>,
        batches: Vec<Vec<u8>>,
        refuse: bool,
        closed: bool,
    }

    impl ResourceHost for TestHost {
        fn poll_events(&mut self) -> Vec<HostEvent> {
            Vec::new()
        }
        fn allocate(
            &mut self,
            _client: ClientId,
            _service: &ServiceInfo,
        ) -> Result<SubscriberHandle, String> {
            if self.refuse {
                return Err("out of memory".into());
            }
            self.next += 1;
            let h = SubscriberHandle::new(self.next);
            self.live.push(h);
            Ok(h)
        }
        fn release(&mut self, handle: SubscriberHandle) {
            self.live.retain(|h| *h != handle);
        }
        fn deliver_all(&mut self, batch: &[u8]) -> Delivery {
            self.batches.push(batch.to_vec());
            Delivery {
                delivered: self.live.len(),
                dropped: Vec::new(),
            }
        }
        fn shutdown(&mut self) {
            self.live.clear();
            self.closed = true;
        }
    }

    fn profiler() -> (Profiler<TestHost>, Arc<LocalNotifier>) {
        let engine = Arc::new(LocalNotifier::new());
        let config = ProfilerConfig {
            buffer_capacity: 64 * 1024,
            ..Default::default()
        };
        let p = Profiler::new(config, engine.clone(), TestHost::default()).unwrap();
        (p, engine)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let engine = Arc::new(LocalNotifier::new());
        let config = ProfilerConfig {
            buffer_capacity: 1000,
            ..Default::default()
        };
        assert!(matches!(
            Profiler::new(config, engine, TestHost::default()),
            Err(ProfilerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn failed_allocation_leaves_registry_alone() {
        let (mut p, engine) = profiler();
        p.host_mut().refuse = true;
        assert!(matches!(
            p.on_bind(ClientId::new(1)),
            Err(ProfilerError::ResourceAllocationFailed(_))
        ));
        assert_eq!(p.busy(), 0);
        assert!(!p.is_listening());
        assert_eq!(engine.listener_count(), 0);
    }

    #[test]
    fn cycles_flow_to_host_after_doorbell() {
        let (mut p, engine) = profiler();
        p.on_bind(ClientId::new(1)).unwrap();
        let mut graph = SimulatedGraph::new(SimConfig::default());
        graph.run_cycle(&engine, 1_000);
        graph.run_cycle(&engine, 22_000_000);

        let now = Instant::now();
        let result = p.dispatch(now);
        assert!(matches!(result, Dispatched::Delivered { delivered: 1, .. }));
        let batches = &p.host().batches;
        assert_eq!(batches.len(), 1);
        let records = cycleprof_types::parse_batch(&batches[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].info.counter, 1);
    }

    #[test]
    fn last_unbind_discards_queue_and_stops_timer() {
        let (mut p, engine) = profiler();
        let h = p.on_bind(ClientId::new(1)).unwrap();
        let mut graph = SimulatedGraph::new(SimConfig::default());
        graph.run_cycle(&engine, 1_000);
        assert!(p.queued() > 0);
        p.start_flush(Instant::now());

        p.on_unbind(h);
        assert!(!p.is_listening());
        assert!(!p.is_flushing());
        assert_eq!(p.queued(), 0);
        assert_eq!(engine.listener_count(), 0);
        assert_eq!(p.dispatch(Instant::now() + Duration::from_secs(5)), Dispatched::Nothing);
    }

    #[test]
    fn shutdown_rejects_later_binds() {
        let (mut p, engine) = profiler();
        p.on_bind(ClientId::new(1)).unwrap();
        p.on_shutdown();
        assert!(p.host().closed);
        assert_eq!(engine.listener_count(), 0);
        assert!(matches!(p.on_bind(ClientId::new(2)), Err(ProfilerError::ShutDown)));
    }

    #[test]
    fn service_info_carries_global_id() {
        let (p, _engine) = profiler();
        let p = p.with_global_id(42);
        assert_eq!(p.service().global_id, 42);
        assert_eq!(p.service().name, "profiler");
    }

    #[test]
    fn overflow_reports_the_rejected_record_size() {
        let engine = Arc::new(LocalNotifier::new());
        let config = ProfilerConfig {
            buffer_capacity: 4096,
            scratch_size: 2048,
            ..Default::default()
        };
        let mut p = Profiler::new(config, engine.clone(), TestHost::default()).unwrap();
        p.on_bind(ClientId::new(1)).unwrap();
        let mut graph = SimulatedGraph::new(SimConfig::default());
        for i in 0..20u64 {
            graph.run_cycle(&engine, 1_000 + i * 21_333_333);
        }
        let counts = p.drop_counts();
        assert!(counts.overflow > 0);
        assert_eq!(counts.last_overflow_fill as usize, p.queued());

        p.dispatch(Instant::now());
        let batch = &p.host().batches[0];
        let records = cycleprof_types::parse_batch(batch).unwrap();
        let record_len = (batch.len() - 8) / records.len();
        assert_eq!(counts.last_overflow_needed as usize, record_len);
        assert_eq!(
            overflow_error(&counts).to_string(),
            format!("queue full: {} bytes queued, {} needed", counts.last_overflow_fill, record_len)
        );
    }
}
