//! A stand-in graph engine.
//!
//! `LocalNotifier` implements the engine's driver notification hook and
//! `SimulatedGraph` produces plausible driver/follower timings for it. Used by
//! the `cycleprof serve` demo and by tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::info;

use cycleprof_types::{
    Activation, ActivationStatus, ClockFlags, ClockInfo, DriverCycle, Fraction, NodeInfo, Target,
    TargetFlags,
};

use crate::host::{DriverListener, ListenerId, NotificationSource};

type ListenerList = Vec<(ListenerId, Box<dyn DriverListener>)>;

/// Driver notification hook of the simulated engine.
///
/// The engine thread only ever `try_lock`s the listener list: when
/// registration is in progress the notification for that cycle is skipped
/// instead of waiting.
#[derive(Default)]
pub struct LocalNotifier {
    listeners: Mutex<ListenerList>,
    next_id: AtomicU64,
    skipped: AtomicU64,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ListenerList> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Notifications skipped because registration held the list.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Deliver one cycle to every listener. Returns false if skipped.
    pub fn notify(&self, cycle: &DriverCycle<'_>, complete: bool) -> bool {
        let mut listeners = match self.listeners.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        for (_, listener) in listeners.iter_mut() {
            if complete {
                listener.complete(cycle);
            } else {
                listener.incomplete(cycle);
            }
        }
        true
    }
}

impl NotificationSource for LocalNotifier {
    fn add_listener(&self, listener: Box<dyn DriverListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> Option<Box<dyn DriverListener>> {
        let mut listeners = self.lock();
        let pos = listeners.iter().position(|(l, _)| *l == id)?;
        Some(listeners.remove(pos).1)
    }
}

/// Shape of the simulated graph.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub driver_id: u32,
    pub driver_name: String,
    pub clock_name: String,
    pub quantum: u32,
    pub rate: u32,
    pub followers: usize,
    /// Add a peer target that must not show up in records
    pub with_peer: bool,
    /// Every n-th cycle overruns and is reported incomplete
    pub xrun_every: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            driver_id: 30,
            driver_name: "alsa_output.pci-0000_00_1f.3.analog-stereo".to_string(),
            clock_name: "api.alsa.p-0".to_string(),
            quantum: 1024,
            rate: 48000,
            followers: 3,
            with_peer: true,
            xrun_every: None,
        }
    }
}

impl SimConfig {
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.quantum as u64 * 1_000_000_000 / self.rate.max(1) as u64)
    }
}

struct SimNode {
    id: u32,
    name: String,
    flags: TargetFlags,
    activation: Activation,
    info: Option<NodeInfo>,
}

pub struct SimulatedGraph {
    config: SimConfig,
    driver: Activation,
    clock: ClockInfo,
    nodes: Vec<SimNode>,
    cycle: u64,
    rng_state: u64,
}

impl SimulatedGraph {
    pub fn new(config: SimConfig) -> Self {
        let rate = Fraction::new(1, config.rate);
        let mut nodes = Vec::with_capacity(config.followers + 2);
        nodes.push(SimNode {
            id: config.driver_id,
            name: config.driver_name.clone(),
            flags: TargetFlags::empty(),
            activation: Activation::default(),
            info: Some(NodeInfo {
                latency: Fraction::new(config.quantum, config.rate),
                rate,
                ..Default::default()
            }),
        });
        for i in 0..config.followers {
            nodes.push(SimNode {
                id: config.driver_id + 10 + i as u32,
                name: format!("follower-{}", i),
                flags: TargetFlags::empty(),
                activation: Activation::default(),
                info: Some(NodeInfo {
                    latency: Fraction::new(config.quantum, config.rate),
                    // The first follower forces a smaller quantum.
                    force_quantum: if i == 0 { config.quantum / 2 } else { 0 },
                    force_rate: 0,
                    rate,
                }),
            });
        }
        if config.with_peer {
            nodes.push(SimNode {
                id: config.driver_id + 1,
                name: "peer-driver".to_string(),
                flags: TargetFlags::PEER,
                activation: Activation::default(),
                info: None,
            });
        }
        let clock = ClockInfo {
            flags: ClockFlags::empty(),
            id: config.driver_id,
            name: config.clock_name.clone(),
            rate,
            duration: config.quantum as u64,
            rate_diff: 1.0,
            ..Default::default()
        };
        Self {
            config,
            driver: Activation::default(),
            clock,
            nodes,
            cycle: 0,
            rng_state: 0x2545_f491_4f6c_dd1d,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn set_freewheel(&mut self, freewheel: bool) {
        self.clock.flags = if freewheel {
            ClockFlags::FREEWHEEL
        } else {
            ClockFlags::empty()
        };
    }

    /// Simulate the teardown of follower `index` mid-cycle.
    pub fn tear_down_follower(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index + 1) {
            node.info = None;
        }
    }

    fn jitter(&mut self, max_ns: u64) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x % max_ns.max(1)
    }

    /// Compute the next cycle starting at `now_ns`. Returns whether it completed.
    pub fn advance(&mut self, now_ns: u64) -> bool {
        let period = self.config.period().as_nanos() as u64;
        let overrun = self
            .config
            .xrun_every
            .is_some_and(|n| n > 0 && (self.cycle + 1) % n == 0);

        self.driver.prev_signal_time = self.driver.signal_time;
        self.driver.signal_time = now_ns;
        self.driver.awake_time = now_ns + 2_000 + self.jitter(3_000);

        let mut t = self.driver.awake_time;
        let budget = period / (self.nodes.len() as u64 + 2);
        for i in 1..self.nodes.len() {
            let wake = self.jitter(4_000) + 1_000;
            let busy = self.jitter(budget.max(2)) + budget / 2;
            let node = &mut self.nodes[i];
            node.activation.prev_signal_time = node.activation.signal_time;
            node.activation.signal_time = t;
            node.activation.awake_time = t + wake;
            node.activation.finish_time = if overrun && i == 1 {
                t + period
            } else {
                t + wake + busy
            };
            node.activation.status = if overrun && i == 1 {
                ActivationStatus::Awake
            } else {
                ActivationStatus::Finished
            };
            if overrun && i == 1 {
                node.activation.xrun_count += 1;
            }
            t = node.activation.finish_time;
        }
        self.driver.finish_time = t + 1_000;
        self.driver.status = ActivationStatus::Finished;

        let load = (self.driver.finish_time - now_ns) as f32 / period.max(1) as f32;
        self.driver.cpu_load[0] = load;
        self.driver.cpu_load[1] = self.driver.cpu_load[1] * 0.9 + load * 0.1;
        self.driver.cpu_load[2] = self.driver.cpu_load[2] * 0.99 + load * 0.01;
        if overrun {
            self.driver.xrun_count += 1;
        }

        self.clock.nsec = now_ns;
        self.clock.position = self.cycle * self.config.quantum as u64;
        self.clock.next_nsec = now_ns + period;
        self.clock.delay = self.jitter(64) as i64 - 32;
        self.clock.rate_diff = 1.0 + (self.jitter(200) as f64 - 100.0) * 1e-6;
        self.cycle += 1;
        !overrun
    }

    /// Hand the current cycle to `f`.
    pub fn with_cycle<R>(&self, f: impl FnOnce(&DriverCycle<'_>) -> R) -> R {
        let targets: Vec<Target<'_>> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| Target {
                id: n.id,
                name: &n.name,
                flags: n.flags,
                activation: if i == 0 { &self.driver } else { &n.activation },
                node: n.info.as_ref(),
            })
            .collect();
        let latency = self.nodes[0]
            .info
            .map(|info| info.latency)
            .unwrap_or(Fraction::ZERO);
        let cycle = DriverCycle {
            id: self.config.driver_id,
            name: &self.config.driver_name,
            activation: &self.driver,
            clock: &self.clock,
            latency,
            targets: &targets,
        };
        f(&cycle)
    }

    /// Advance one cycle and notify listeners.
    pub fn run_cycle(&mut self, notifier: &LocalNotifier, now_ns: u64) -> bool {
        let complete = self.advance(now_ns);
        self.with_cycle(|cycle| notifier.notify(cycle, complete))
    }

    /// Run the graph on its own thread, one cycle per period.
    pub fn spawn(mut self, notifier: Arc<LocalNotifier>) -> io::Result<SimHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let period = self.config.period();
        let join = thread::Builder::new()
            .name("cycleprof-graph".into())
            .spawn(move || {
                info!(target: "profiler::sim", "graph running, period {:?}", period);
                let epoch = Instant::now();
                let mut next = epoch;
                while !stop_flag.load(Ordering::Relaxed) {
                    let now_ns = epoch.elapsed().as_nanos() as u64;
                    self.run_cycle(&notifier, now_ns);
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                info!(target: "profiler::sim", "graph stopped after {} cycles", self.cycles());
            })?;
        Ok(SimHandle {
            stop,
            join: Some(join),
        })
    }
}

/// Running simulated graph. Stops on drop.
pub struct SimHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SimHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
