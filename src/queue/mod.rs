//! Serialized GATT operation queue
//!
//! The native stack tolerates exactly one outstanding GATT operation per
//! connection. `OperationQueue` holds the waiting operations and the single
//! in-flight slot:
//! - FIFO for ordinary operations
//! - `Disconnect`/`Close` jump ahead of everything non-terminal
//! - the slot is an `Option`, never a collection
//! - timed-out signatures are kept as orphans so late answers can be discarded,
//!   each for one timeout window

pub mod operation;
pub mod outcome;
pub mod timeout;

// Re-export main types
pub use operation::{Operation, OperationId, OperationKind, OperationTarget, Request};
pub use outcome::{Outcome, OperationStatus, OutcomeData};
pub use timeout::{deadline_after, TimeoutGuard, MAX_OPERATION_TIMEOUT};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::ble::state::ConnectionState;

/// Upper bound on remembered orphan signatures
pub const MAX_ORPHANS: usize = 16;

/// `(kind, target)` pair used to match native answers
pub type Signature = (OperationKind, OperationTarget);

/// Whether a native answer with signature `answer` belongs to `operation`.
///
/// MTU answers carry the negotiated size rather than the requested one, so
/// they match on kind alone.
pub fn answers(operation: Signature, answer: Signature) -> bool {
    match (operation, answer) {
        ((OperationKind::RequestMtu, _), (OperationKind::RequestMtu, _)) => true,
        (op, ans) => op == ans,
    }
}

/// Queue operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Pending slot already holds {0}")]
    SlotOccupied(OperationId),
}

/// Signature of a timed-out operation whose answer may still arrive
#[derive(Debug, Clone, Copy)]
struct Orphan {
    signature: Signature,
    expires: Instant,
}

/// Waiting operations plus the single in-flight slot of one connection
#[derive(Debug)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    slot: Option<Operation>,
    next_id: u64,
    orphans: VecDeque<Orphan>,
    /// An answer matching the in-flight op was consumed as an orphan
    claimed_in_flight: bool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            slot: None,
            next_id: 1,
            orphans: VecDeque::new(),
            claimed_in_flight: false,
        }
    }

    /// Allocate the next operation identity
    pub fn next_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Queue an operation; terminal ones go ahead of every non-terminal one
    pub fn enqueue(&mut self, op: Operation) {
        if op.is_terminal() {
            let at = self
                .pending
                .iter()
                .position(|queued| !queued.is_terminal())
                .unwrap_or(self.pending.len());
            tracing::debug!("Queueing terminal {} at position {}", op, at);
            self.pending.insert(at, op);
        } else {
            tracing::debug!("Queueing {} ({} waiting)", op, self.pending.len());
            self.pending.push_back(op);
        }
    }

    /// Pop the head if the slot is free and `state` allows dispatching it.
    ///
    /// Never skips the head: a blocked head blocks everything behind it.
    pub fn next_dispatchable(&mut self, state: ConnectionState) -> Option<Operation> {
        if self.slot.is_some() {
            return None;
        }
        let head = self.pending.front()?;
        let allowed = match head.kind {
            OperationKind::Disconnect | OperationKind::Close => state != ConnectionState::Closed,
            OperationKind::Connect => state == ConnectionState::Connecting,
            _ => state == ConnectionState::Connected,
        };
        if allowed {
            self.pending.pop_front()
        } else {
            None
        }
    }

    /// Put an operation in flight
    pub fn occupy(&mut self, op: Operation) -> Result<(), QueueError> {
        if let Some(current) = &self.slot {
            return Err(QueueError::SlotOccupied(current.id));
        }
        self.slot = Some(op);
        self.claimed_in_flight = false;
        Ok(())
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        self.slot.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_some()
    }

    /// Clear the slot only if it holds `id`
    pub fn take_if(&mut self, id: OperationId) -> Option<Operation> {
        if self.slot.as_ref().map(|op| op.id) == Some(id) {
            self.slot.take()
        } else {
            None
        }
    }

    /// Clear the slot only if the native answer `signature` belongs to it
    pub fn take_matching(&mut self, signature: Signature) -> Option<Operation> {
        let matched = self
            .slot
            .as_ref()
            .map_or(false, |op| answers(op.signature(), signature));
        if matched {
            self.slot.take()
        } else {
            None
        }
    }

    /// Clear the slot unconditionally
    pub fn take_in_flight(&mut self) -> Option<Operation> {
        self.slot.take()
    }

    /// Remove every waiting non-terminal operation, keeping terminal ones queued
    pub fn drain_non_terminal(&mut self) -> Vec<Operation> {
        let (terminal, drained): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(Operation::is_terminal);
        self.pending = terminal.into();
        drained
    }

    /// Empty slot and queue, in-flight first
    pub fn drain_all(&mut self) -> Vec<Operation> {
        self.slot.take().into_iter().chain(self.pending.drain(..)).collect()
    }

    /// Remember a timed-out signature until `expires`, dropping the oldest past the bound
    pub fn remember_orphan(&mut self, signature: Signature, expires: Instant) {
        if self.orphans.len() == MAX_ORPHANS {
            self.orphans.pop_front();
        }
        self.orphans.push_back(Orphan { signature, expires });
    }

    /// Consume the oldest live orphan matching `signature` along with everything older.
    ///
    /// Answers arrive in issue order, so older orphans can no longer be answered.
    /// Orphans past their expiry are forgotten first.
    pub fn claim_orphan(&mut self, signature: Signature, now: Instant) -> bool {
        self.orphans.retain(|o| o.expires > now);
        match self.orphans.iter().position(|o| answers(o.signature, signature)) {
            Some(at) => {
                self.orphans.drain(..=at);
                let slot_matches = self
                    .slot
                    .as_ref()
                    .map_or(false, |op| answers(op.signature(), signature));
                if slot_matches {
                    self.claimed_in_flight = true;
                }
                true
            }
            None => false,
        }
    }

    /// Whether the in-flight op's own answer may have been consumed as an orphan.
    ///
    /// A timeout of such an op must not leave a new orphan behind, or every
    /// later identical op would lose its answer the same way.
    pub fn orphan_claimed_in_flight(&self) -> bool {
        self.claimed_in_flight
    }

    pub fn clear_orphans(&mut self) {
        self.orphans.clear();
        self.claimed_in_flight = false;
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Number of waiting operations (not counting the slot)
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.slot.is_none()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.pending.len(),
            terminal_waiting: self.pending.iter().filter(|op| op.is_terminal()).count(),
            in_flight: self.slot.as_ref().map(|op| op.id),
            orphans: self.orphans.len(),
            next_id: self.next_id,
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub terminal_waiting: usize,
    pub in_flight: Option<OperationId>,
    pub orphans: usize,
    pub next_id: u64,
}
