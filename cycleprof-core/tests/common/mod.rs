#![allow(dead_code)]
//! Test harness utilities for cycleprof-core integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cycleprof_core::{
    Delivery, HostEvent, LocalNotifier, Profiler, ProfilerConfig, ResourceHost, SimConfig,
    SimulatedGraph,
};
use cycleprof_types::{parse_batch, ClientId, ProfileRecord, ServiceInfo, SubscriberHandle};

/// Everything a `MemoryHost` saw, shared with the test.
#[derive(Default)]
pub struct MemoryState {
    pub events: VecDeque<HostEvent>,
    pub next_handle: u64,
    pub live: Vec<SubscriberHandle>,
    pub welcomed: Vec<(ClientId, SubscriberHandle, ServiceInfo)>,
    pub batches: Vec<Vec<u8>>,
    /// Handles whose next delivery fails
    pub failing: Vec<SubscriberHandle>,
    pub max_subscribers: Option<usize>,
    pub shut_down: bool,
}

/// In-memory resource host.
#[derive(Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn push_event(&self, event: HostEvent) {
        self.state().events.push_back(event);
    }

    pub fn batches(&self) -> Vec<Vec<u8>> {
        self.state().batches.clone()
    }

    pub fn records(&self) -> Vec<ProfileRecord> {
        self.batches()
            .iter()
            .flat_map(|b| parse_batch(b).expect("malformed batch"))
            .collect()
    }
}

impl ResourceHost for MemoryHost {
    fn poll_events(&mut self) -> Vec<HostEvent> {
        self.state().events.drain(..).collect()
    }

    fn allocate(
        &mut self,
        client: ClientId,
        service: &ServiceInfo,
    ) -> Result<SubscriberHandle, String> {
        let mut state = self.state();
        if state.shut_down {
            return Err("host closed".into());
        }
        if let Some(max) = state.max_subscribers {
            if state.live.len() >= max {
                return Err(format!("subscriber limit {} reached", max));
            }
        }
        state.next_handle += 1;
        let handle = SubscriberHandle::new(state.next_handle);
        state.live.push(handle);
        state.welcomed.push((client, handle, service.clone()));
        Ok(handle)
    }

    fn release(&mut self, handle: SubscriberHandle) {
        self.state().live.retain(|h| *h != handle);
    }

    fn deliver_all(&mut self, batch: &[u8]) -> Delivery {
        let mut state = self.state();
        let failing = std::mem::take(&mut state.failing);
        let (dropped, ok): (Vec<_>, Vec<_>) =
            state.live.iter().copied().partition(|h| failing.contains(h));
        state.live = ok;
        state.batches.push(batch.to_vec());
        Delivery {
            delivered: state.live.len(),
            dropped,
        }
    }

    fn shutdown(&mut self) {
        let mut state = self.state();
        state.live.clear();
        state.shut_down = true;
    }
}

pub fn profiler_with(
    config: ProfilerConfig,
) -> (Profiler<MemoryHost>, Arc<LocalNotifier>, MemoryHost) {
    let engine = Arc::new(LocalNotifier::new());
    let host = MemoryHost::new();
    let profiler = Profiler::new(config, engine.clone(), host.clone()).unwrap();
    (profiler, engine, host)
}

pub fn small_graph(followers: usize) -> SimulatedGraph {
    SimulatedGraph::new(SimConfig {
        followers,
        ..Default::default()
    })
}

/// Run `n` cycles, 1024 samples at 48 kHz apart, starting at cycle `start`.
pub fn run_cycles(graph: &mut SimulatedGraph, engine: &LocalNotifier, start: u64, n: u64) {
    for i in start..start + n {
        graph.run_cycle(engine, 1_000 + i * 21_333_333);
    }
}

/// Poll `f` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}
