//! Per-stream pending list and bookkeeping.

use crate::op::{ReorderOptions, StreamOp};
use serde::Serialize;
use sio_types::{Priority, StreamId};
use std::collections::VecDeque;

/// Lifecycle of a stream inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    /// Accepting new ops.
    Open,
    /// Closed by the client; draining pending and in-flight ops.
    Closing,
}

/// An ordered channel of ops sharing one priority.
///
/// `pending` is kept in issue order: the reorder policy is applied on
/// insertion, so the scheduler always takes the front.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    priority: Priority,
    state: StreamState,
    pending: VecDeque<StreamOp>,
    in_flight: usize,
    /// Currently linked into the ready queue.
    pub(crate) queued: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, priority: Priority) -> Self {
        Self {
            id,
            priority,
            state: StreamState::Open,
            pending: VecDeque::new(),
            in_flight: 0,
            queued: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// No pending and no in-flight ops.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    /// Has a pending op and room under the in-flight limit.
    #[must_use]
    pub fn is_ready(&self, max_in_flight: Option<usize>) -> bool {
        !self.pending.is_empty() && max_in_flight.map_or(true, |limit| self.in_flight < limit)
    }

    pub(crate) fn close(&mut self) {
        self.state = StreamState::Closing;
    }

    /// Insert `op`, walking back from the tail past every op it may pass.
    /// Returns the index the op landed at.
    pub(crate) fn insert(&mut self, op: StreamOp, reorder: ReorderOptions) -> usize {
        let mut pos = self.pending.len();
        while pos > 0 && reorder.may_pass(&op, &self.pending[pos - 1]) {
            pos -= 1;
        }
        self.pending.insert(pos, op);
        pos
    }

    /// Move the next op to in-flight.
    pub(crate) fn take_next(&mut self) -> Option<StreamOp> {
        let op = self.pending.pop_front()?;
        self.in_flight += 1;
        Some(op)
    }

    /// Account for a completed op. Returns `false` if nothing was in flight.
    pub(crate) fn complete_one(&mut self) -> bool {
        if self.in_flight == 0 {
            return false;
        }
        self.in_flight -= 1;
        true
    }

    #[cfg(test)]
    pub(crate) fn pending_ids(&self) -> Vec<u64> {
        self.pending.iter().map(|op| op.id.0).collect()
    }
}
