//! Instruction and timer pacing.
use std::time::Duration;

/// Cadence of the delay and sound timers, fixed by the platform.
pub const TIMER_HZ: u64 = 60;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Converts irregular wall-clock samples into a stream of fixed-rate ticks.
///
/// Elapsed time accumulates as credit against a fixed period; whatever is
/// left after paying out whole ticks carries over to the next call, so the
/// average tick rate converges on the configured frequency no matter how
/// unevenly the caller samples time.
pub struct RateGate {
    period: u64,
    credit: u64,
}

impl RateGate {
    pub fn new(hz: u64) -> Self {
        RateGate {
            period: NANOS_PER_SECOND / hz.max(1),
            credit: 0,
        }
    }

    /// Number of ticks that became due after `elapsed` more wall-clock time.
    pub fn advance(&mut self, elapsed: Duration) -> u64 {
        self.credit += elapsed.as_nanos() as u64;
        let due = self.credit / self.period;
        self.credit %= self.period;
        due
    }
}
