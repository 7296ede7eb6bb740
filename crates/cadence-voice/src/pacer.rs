//! Fixed-period scheduling for the audio send loop.

use std::time::Duration;
use tokio::time::Instant;

/// Logical frame period.
pub const FRAME_PERIOD: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacerStats {
    pub ticks: u64,
    pub reanchors: u64,
    total_cost: Duration,
    total_interval: Duration,
    intervals: u64,
}

impl PacerStats {
    /// Mean work time per tick.
    pub fn mean_cost(&self) -> Duration {
        if self.ticks == 0 {
            return Duration::ZERO;
        }
        self.total_cost / self.ticks as u32
    }

    /// Mean time between consecutive ticks.
    pub fn mean_interval(&self) -> Duration {
        if self.intervals == 0 {
            return Duration::ZERO;
        }
        self.total_interval / self.intervals as u32
    }
}

/// Absolute-deadline scheduler.
///
/// Each deadline is the previous one plus the period, so time spent working
/// comes straight out of the next wait and error never accumulates. The last
/// `spin_window` before a deadline is busy-waited for precision; zero means
/// sleep only.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    spin_window: Duration,
    next: Instant,
    last_tick: Option<Instant>,
    stats: PacerStats,
}

impl Pacer {
    pub fn new(period: Duration, spin_window: Duration) -> Self {
        Self {
            period,
            spin_window: spin_window.min(period),
            next: Instant::now() + period,
            last_tick: None,
            stats: PacerStats::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Resolve at the current deadline. Safe to drop mid-wait.
    pub async fn wait(&self) {
        if self.spin_window.is_zero() {
            tokio::time::sleep_until(self.next).await;
            return;
        }
        tokio::time::sleep_until(self.next - self.spin_window).await;
        while Instant::now() < self.next {
            std::hint::spin_loop();
        }
    }

    /// Mark the start of a tick and schedule the next one.
    ///
    /// If the loop is more than one period late, the schedule restarts from
    /// now instead of firing a burst of catch-up ticks.
    pub fn tick(&mut self) -> Instant {
        let now = Instant::now();
        if let Some(last) = self.last_tick {
            self.stats.total_interval += now - last;
            self.stats.intervals += 1;
        }
        self.last_tick = Some(now);
        self.stats.ticks += 1;

        self.next += self.period;
        if now > self.next {
            tracing::debug!(
                behind_ms = (now - self.next).as_millis() as u64,
                "audio pacer fell behind, re-anchoring"
            );
            self.next = now + self.period;
            self.stats.reanchors += 1;
        }
        now
    }

    pub fn record_cost(&mut self, cost: Duration) {
        self.stats.total_cost += cost;
    }

    /// Restart the schedule one period from now, e.g. after a pause.
    pub fn reanchor(&mut self) {
        self.next = Instant::now() + self.period;
        self.last_tick = None;
    }
}
