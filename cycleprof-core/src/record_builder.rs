//! Serializes one driver cycle into a profile record.

use cycleprof_types::pod::{
    OBJECT_PROFILER, PROFILER_CLOCK, PROFILER_DRIVER_BLOCK, PROFILER_FOLLOWER_BLOCK,
    PROFILER_INFO,
};
use cycleprof_types::{Activation, DriverCycle, Fraction, CLOCK_NAME_MAX};

use crate::pod_builder::PodBuilder;

/// The assembled record would not fit the scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTooLarge {
    pub size: usize,
    pub limit: usize,
}

/// Builds records into a scratch buffer allocated once up front.
pub struct RecordBuilder {
    scratch: Box<[u8]>,
}

impl RecordBuilder {
    pub fn new(scratch_size: usize) -> Self {
        Self {
            scratch: vec![0u8; scratch_size].into_boxed_slice(),
        }
    }

    pub fn scratch_size(&self) -> usize {
        self.scratch.len()
    }

    /// Encode `cycle` with the given counter value.
    ///
    /// Never allocates. A record that does not fit is rejected whole.
    pub fn build(&mut self, counter: i64, cycle: &DriverCycle<'_>) -> Result<&[u8], RecordTooLarge> {
        let limit = self.scratch.len();
        let mut b = PodBuilder::new(&mut self.scratch);
        let a = cycle.activation;
        let clock = cycle.clock;

        let object = b.push_object(OBJECT_PROFILER, 0);

        b.prop(PROFILER_INFO, 0);
        let f = b.push_struct();
        b.long(counter);
        b.float(a.cpu_load[0]);
        b.float(a.cpu_load[1]);
        b.float(a.cpu_load[2]);
        b.int(a.xrun_count as i32);
        b.pop(f);

        b.prop(PROFILER_CLOCK, 0);
        let f = b.push_struct();
        b.int(clock.flags.bits() as i32);
        b.int(clock.id as i32);
        b.string_truncated(&clock.name, CLOCK_NAME_MAX);
        b.long(clock.nsec as i64);
        b.fraction(clock.rate);
        b.long(clock.position as i64);
        b.long(clock.duration as i64);
        b.long(clock.delay);
        b.double(clock.rate_diff);
        b.long(clock.next_nsec as i64);
        b.pop(f);

        b.prop(PROFILER_DRIVER_BLOCK, 0);
        write_block(
            &mut b,
            cycle.id,
            cycle.name,
            a.prev_signal_time,
            a,
            cycle.latency,
        );

        for target in cycle.followers() {
            b.prop(PROFILER_FOLLOWER_BLOCK, 0);
            write_block(
                &mut b,
                target.id,
                target.name,
                a.signal_time,
                target.activation,
                target.latency(),
            );
        }

        b.pop(object);
        b.finish().map_err(|size| RecordTooLarge { size, limit })
    }
}

fn write_block(
    b: &mut PodBuilder<'_>,
    id: u32,
    name: &str,
    prev_signal_time: u64,
    activation: &Activation,
    latency: Fraction,
) {
    let f = b.push_struct();
    b.int(id as i32);
    b.string(name);
    b.long(prev_signal_time as i64);
    b.long(activation.signal_time as i64);
    b.long(activation.awake_time as i64);
    b.long(activation.finish_time as i64);
    b.int(activation.status.code());
    b.fraction(latency);
    b.int(activation.xrun_count as i32);
    b.pop(f);
}
