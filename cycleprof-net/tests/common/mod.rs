#![allow(dead_code)]
//! Test harness utilities for cycleprof-net integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cycleprof_core::{LocalNotifier, Profiler, ProfilerConfig, SimConfig, SimulatedGraph};
use cycleprof_net::{NetHost, ProfilerClient};

pub struct Harness {
    pub profiler: Profiler<NetHost>,
    pub engine: Arc<LocalNotifier>,
    pub graph: SimulatedGraph,
    pub addr: String,
    cycle: u64,
}

impl Harness {
    pub fn start(max_subscribers: Option<usize>) -> Self {
        let host = NetHost::bind("127.0.0.1:0")
            .unwrap()
            .with_max_subscribers(max_subscribers);
        let addr = host.local_addr().unwrap().to_string();
        let engine = Arc::new(LocalNotifier::new());
        let config = ProfilerConfig {
            buffer_capacity: 256 * 1024,
            ..Default::default()
        };
        let profiler = Profiler::new(config, engine.clone(), host).unwrap();
        let graph = SimulatedGraph::new(SimConfig {
            followers: 2,
            ..Default::default()
        });
        Self {
            profiler,
            engine,
            graph,
            addr,
            cycle: 0,
        }
    }

    /// Poll the host until `f` holds, or panic after two seconds.
    pub fn drive_until(&mut self, what: &str, f: impl Fn(&Profiler<NetHost>) -> bool) {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            self.profiler.poll_host();
            if f(&self.profiler) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    /// Connect an observer and drive the handshake to completion.
    pub fn bind_client(&mut self, name: &str) -> ProfilerClient {
        let before = self.profiler.busy();
        let pending = ProfilerClient::hello(&self.addr, name).unwrap();
        self.drive_until("bind", |p| p.busy() == before + 1);
        let client = pending.welcome().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
    }

    /// Run `n` graph cycles through the engine.
    pub fn run_cycles(&mut self, n: u64) {
        for _ in 0..n {
            self.graph
                .run_cycle(&self.engine, 1_000 + self.cycle * 21_333_333);
            self.cycle += 1;
        }
    }
}
