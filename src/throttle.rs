//! Reconnect throttling.
//!
//! A throttle is a lazy sequence of delays: each `step` yields the delay to
//! wait before the next connection attempt plus the successor throttle.
//! `None` is the terminal value — stop reconnecting.  The connection driver
//! holds the current position and consumes one step per failed attempt; the
//! position resets to the configured throttle on every successful open.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Throttle {
    /// Never reconnect automatically.
    None,
    /// The same delay for a bounded number of attempts.
    Fixed { delay: Duration, attempts: u32 },
    /// Doubling delay capped at `cap`, for a bounded number of attempts.
    Backoff {
        initial: Duration,
        cap: Duration,
        attempts: u32,
    },
    /// Doubling delay capped at `cap`, never gives up.
    Indefinite { initial: Duration, cap: Duration },
}

impl Throttle {
    /// Yield the next delay and the successor throttle, or `None` when the
    /// schedule is exhausted.
    pub fn step(&self) -> Option<(Duration, Throttle)> {
        match *self {
            Throttle::None => None,
            Throttle::Fixed { attempts: 0, .. } | Throttle::Backoff { attempts: 0, .. } => None,
            Throttle::Fixed { delay, attempts } => Some((
                delay,
                Throttle::Fixed {
                    delay,
                    attempts: attempts - 1,
                },
            )),
            Throttle::Backoff {
                initial,
                cap,
                attempts,
            } => {
                let delay = initial.min(cap);
                Some((
                    delay,
                    Throttle::Backoff {
                        initial: (delay * 2).min(cap),
                        cap,
                        attempts: attempts - 1,
                    },
                ))
            }
            Throttle::Indefinite { initial, cap } => {
                let delay = initial.min(cap);
                Some((
                    delay,
                    Throttle::Indefinite {
                        initial: (delay * 2).min(cap),
                        cap,
                    },
                ))
            }
        }
    }

    /// Whether the next `step` would be terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            *self,
            Throttle::None
                | Throttle::Fixed { attempts: 0, .. }
                | Throttle::Backoff { attempts: 0, .. }
        )
    }
}

/// Format a delay for log output.
///
/// Minutes are the largest unit: longer delays print as whole minutes
/// (`90m`), which is as coarse as reconnect scheduling ever needs.
pub fn humanize(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let secs = ms / 1_000;
    let rem_ms = ms % 1_000;
    if secs < 60 {
        if rem_ms == 0 {
            return format!("{secs}s");
        }
        return format!("{secs}s {rem_ms}ms");
    }
    let mins = secs / 60;
    let rem_s = secs % 60;
    if rem_s == 0 {
        format!("{mins}m")
    } else {
        format!("{mins}m {rem_s}s")
    }
}
