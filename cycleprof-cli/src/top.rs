//! Observer output.

use cycleprof_types::{Block, ProfileRecord};

fn micros(ns: i64) -> f64 {
    ns as f64 / 1000.0
}

fn block_summary(block: &Block) -> String {
    format!(
        "{}:{:.1}/{:.1}us",
        block.name,
        micros(block.wakeup_delay()),
        micros(block.busy_time())
    )
}

/// One human readable line per record.
pub fn format_record(record: &ProfileRecord, gap: i64) -> String {
    let period = record.clock.next_nsec.saturating_sub(record.clock.nsec);
    let mut line = format!(
        "#{:<8} {} load {:.2}/{:.2}/{:.2} xrun {} quantum {} @ {} period {:.0}us",
        record.info.counter,
        record.driver.name,
        record.info.cpu_load[0],
        record.info.cpu_load[1],
        record.info.cpu_load[2],
        record.info.xrun_count,
        record.clock.duration,
        record.clock.rate,
        micros(period),
    );
    for follower in &record.followers {
        line.push(' ');
        line.push_str(&block_summary(follower));
    }
    if gap > 0 {
        line.push_str(&format!(" ({} dropped)", gap));
    }
    line
}

/// Tracks counters across batches to report drops.
#[derive(Debug, Default)]
pub struct GapTracker {
    last: Option<i64>,
}

impl GapTracker {
    pub fn gap(&mut self, record: &ProfileRecord) -> i64 {
        let gap = match self.last {
            Some(last) => record
                .info
                .counter
                .saturating_sub(last)
                .saturating_sub(1)
                .max(0),
            None => 0,
        };
        self.last = Some(record.info.counter);
        gap
    }
}
