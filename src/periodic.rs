//! Fixed-cadence tick helper used by the CAN receive loop (and anywhere else
//! a loop needs to run at a steady rate against the system monotonic clock).

use std::time::{Duration, Instant};

/// Drives a `next += period` loop with rebase-on-overrun, the way the
/// CAN receive loop's 100 Hz cadence is specified: a missed deadline is
/// logged (by the caller, since only it knows whether `ignition` gates the
/// warning) and `next` is rebased to now rather than allowed to free-run
/// behind.
pub struct Ticker {
    period: Duration,
    next: Instant,
}

/// Outcome of one `Ticker::tick()` call.
pub enum TickOutcome {
    /// Woke up on schedule.
    OnTime,
    /// The deadline had already passed; `next` was rebased to now.
    Overrun { behind_by: Duration },
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Sleep until the next tick is due, then return whether it was on time.
    pub fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.period;
            TickOutcome::OnTime
        } else {
            let behind_by = now - self.next;
            self.next = now + self.period;
            TickOutcome::Overrun { behind_by }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_by_period() {
        let mut ticker = Ticker::new(Duration::from_millis(5));
        let first = Instant::now();
        matches!(ticker.tick(), TickOutcome::OnTime);
        assert!(first.elapsed() >= Duration::from_millis(4));
    }
}
