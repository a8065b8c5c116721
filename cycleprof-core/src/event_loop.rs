//! Consumer thread running the profiler.
//!
//! Wakes on a producer doorbell, a control command, the flush deadline or the
//! host poll interval, whichever comes first.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};

use crate::error::{ProfilerError, ProfilerResult};
use crate::host::{ModuleLifecycle, ResourceHost};
use crate::profiler::Profiler;

/// Upper bound on how long host events can wait.
const HOST_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    Shutdown,
}

pub struct ProfilerLoop {
    control: Sender<LoopCommand>,
    join: Option<JoinHandle<()>>,
}

impl ProfilerLoop {
    /// Move `profiler` onto its own thread.
    pub fn spawn<H>(profiler: Profiler<H>) -> ProfilerResult<Self>
    where
        H: ResourceHost + Send + 'static,
    {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let join = thread::Builder::new()
            .name("cycleprof-flush".into())
            .spawn(move || run(profiler, control_rx))
            .map_err(ProfilerError::TimerResourceUnavailable)?;
        Ok(Self {
            control: control_tx,
            join: Some(join),
        })
    }

    /// Shut the profiler down and wait for the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.control.send(LoopCommand::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(target: "profiler", "flush thread panicked");
            }
        }
    }
}

impl Drop for ProfilerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<H: ResourceHost>(mut profiler: Profiler<H>, control: Receiver<LoopCommand>) {
    info!(target: "profiler", "flush loop started");
    let mut doorbell = profiler.doorbell().clone();
    loop {
        let mut bell_gone = false;
        let now = Instant::now();
        let timeout = profiler
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(HOST_POLL)
            .min(HOST_POLL);

        crossbeam_channel::select! {
            recv(doorbell) -> msg => {
                match msg {
                    Ok(()) => profiler.on_doorbell(Instant::now()),
                    // The producer is gone; timers and host events still run.
                    Err(_) => bell_gone = true,
                }
            }
            recv(control) -> cmd => {
                match cmd {
                    Ok(LoopCommand::Shutdown) | Err(_) => break,
                }
            }
            default(timeout) => {}
        }
        if bell_gone {
            doorbell = crossbeam_channel::never();
        }

        profiler.poll_host();
        profiler.dispatch(Instant::now());
    }
    debug!(target: "profiler", "flush loop stopping");
    profiler.on_shutdown();
}
