//! Liveness probing on idle transports.
//!
//! The driver records read and write activity here and sleeps on
//! `deadline`; when it fires, a ping frame goes out.  Inbound pings are
//! answered with pongs directly in the frame loop; inbound pongs count only
//! as read activity.

use std::time::Duration;
use tokio::time::Instant;

/// Tracks transport idleness and decides when the next ping is due.
///
/// A ping goes out when either direction has been idle for `every`.  The
/// last ping time is tracked separately so a transport that is read-idle
/// but write-active (or vice versa) is probed once per interval rather
/// than on every loop iteration.
#[derive(Debug, Clone)]
pub(crate) struct IdleTracker {
    every: Duration,
    last_read: Instant,
    last_write: Instant,
    last_ping: Option<Instant>,
}

impl IdleTracker {
    pub fn new(every: Duration) -> Self {
        let now = Instant::now();
        IdleTracker {
            every,
            last_read: now,
            last_write: now,
            last_ping: None,
        }
    }

    pub fn mark_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn mark_write(&mut self) {
        self.last_write = Instant::now();
    }

    pub fn mark_ping(&mut self) {
        self.last_ping = Some(Instant::now());
    }

    /// When the next ping is due.
    pub fn deadline(&self) -> Instant {
        let idle_edge = self.last_read.min(self.last_write) + self.every;
        match self.last_ping {
            Some(ping) => idle_edge.max(ping + self.every),
            None => idle_edge,
        }
    }
}
