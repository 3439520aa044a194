//! Outbound ack tracking.
//!
//! Every ack-wrapped send gets a per-connection id and a deadline.  The
//! driver polls `next_deadline` in its select loop and calls `expired` when
//! it fires; there are no spawned timer tasks, so an arriving `Ack` can
//! never race a half-cancelled timer.

use crate::error::ClientError;
use crate::message::{AckPayload, Outcome};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Reply = oneshot::Sender<Result<Outcome, ClientError>>;

struct PendingAck {
    payload: AckPayload,
    deadline: Instant,
    reply: Reply,
}

/// An ack that ran out of time.  The driver emits `AckFailed(payload)` and
/// resolves the send as `Cancelled`.
pub(crate) struct ExpiredAck {
    pub id: u64,
    pub payload: AckPayload,
    pub reply: Reply,
}

/// Correlates outbound `AckRequest` ids with inbound `Ack` frames.
///
/// Ids are monotonically increasing and scoped to one connection: `clear`
/// resets the counter along with the pending set.
#[derive(Default)]
pub(crate) struct AckRegistry {
    next_id: u64,
    pending: HashMap<u64, PendingAck>,
    // Lazily pruned: entries for already-acked ids are skipped on pop.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the id for the next ack-wrapped send.
    ///
    /// Separate from `register` so the frame can be written first; a send
    /// that never reaches the transport must not leave a timer armed.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Arm the timer for an id returned by `allocate_id`.
    pub fn register(&mut self, id: u64, payload: AckPayload, timeout: Duration, reply: Reply) {
        let deadline = Instant::now() + timeout;
        self.deadlines.push(Reverse((deadline, id)));
        self.pending.insert(
            id,
            PendingAck {
                payload,
                deadline,
                reply,
            },
        );
    }

    /// Resolve a pending send as `Success`.  Returns false when the id is
    /// unknown — a duplicate or stray ack, which is ignored.
    pub fn acknowledge(&mut self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(Outcome::Success));
                true
            }
            None => false,
        }
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            match self.pending.get(&id) {
                Some(pending) if pending.deadline == deadline => return Some(deadline),
                // Acked (or re-armed) since this entry was pushed.
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<ExpiredAck> {
        let mut out = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let Some(Reverse((_, id))) = self.deadlines.pop() else {
                break;
            };
            if let Some(pending) = self.pending.remove(&id) {
                out.push(ExpiredAck {
                    id,
                    payload: pending.payload,
                    reply: pending.reply,
                });
            }
        }
        out
    }

    /// Drop all pending entries and reset the id counter.  Called on the
    /// transition into Closed; the driver resolves the returned replies as
    /// `Cancelled`.
    pub fn clear(&mut self) -> Vec<Reply> {
        self.next_id = 0;
        self.deadlines.clear();
        self.pending
            .drain()
            .map(|(_, pending)| pending.reply)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
