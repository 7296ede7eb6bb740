//! Heartbeat bookkeeping shared by the gateway and voice sockets.
//!
//! The supervisor owns no timer. The caller sleeps until [`HeartbeatSupervisor::deadline`]
//! inside its own `select!` and then calls [`HeartbeatSupervisor::on_tick`].

use std::time::Duration;
use tokio::time::Instant;

/// What the connection should do when the heartbeat deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged; the link is a zombie.
    Missed,
}

#[derive(Debug)]
pub struct HeartbeatSupervisor {
    interval: Duration,
    next_beat: Instant,
    /// Set only by scheduled beats; a missed tick is judged on this alone.
    awaiting_ack: bool,
    /// A server-requested beat is in flight.
    requested: bool,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatSupervisor {
    /// First beat is due one interval from now.
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now() + interval)
    }

    pub fn starting_at(interval: Duration, first_beat: Instant) -> Self {
        Self {
            interval,
            next_beat: first_beat,
            awaiting_ack: false,
            requested: false,
            last_sent: None,
            last_ack: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Instant {
        self.next_beat
    }

    /// Called when the deadline elapses. A `Send` result marks the beat as
    /// outstanding and schedules the next one.
    pub fn on_tick(&mut self) -> Beat {
        if self.awaiting_ack {
            return Beat::Missed;
        }
        self.record_sent(Instant::now());
        Beat::Send
    }

    /// Server asked for an immediate heartbeat. The regular schedule is kept,
    /// and the next tick is not failed while only this beat is unacknowledged.
    pub fn beat_now(&mut self) {
        self.requested = true;
        self.last_sent = Some(Instant::now());
    }

    fn record_sent(&mut self, now: Instant) {
        self.awaiting_ack = true;
        self.last_sent = Some(now);
        self.next_beat = now + self.interval;
    }

    /// Clears the outstanding beat and returns the measured round trip.
    pub fn on_ack(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.awaiting_ack = false;
        self.requested = false;
        self.last_ack = Some(now);
        self.last_sent.map(|sent| now.saturating_duration_since(sent))
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack || self.requested
    }

    /// Time since the last acknowledgement, or `None` before the first one.
    pub fn since_last_ack(&self) -> Option<Duration> {
        self.last_ack.map(|at| at.elapsed())
    }
}
