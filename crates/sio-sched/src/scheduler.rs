//! Stream lifecycle, op flow control and shutdown.
//!
//! One `parking_lot::Mutex` guards the stream map, the ready queue and the
//! state machine. A single condvar wakes both blocked workers and a
//! draining `shutdown`; every state change that can make an op ready or
//! drop the outstanding count to zero notifies it.
//!
//! The client is never called with the lock held.

use crate::op::{ReorderOptions, StreamOp};
use crate::queue::Queue;
use crate::stream::{Stream, StreamState};
use crate::worker::WorkerPool;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sio_error::{Result, SioError};
use sio_types::{Priority, StreamId};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of [`SchedulerClient::issue`].
#[derive(Debug)]
pub enum Issued {
    /// The op finished synchronously; the scheduler completes it now.
    Complete(StreamOp),
    /// The client kept the op and will hand it back through
    /// [`Scheduler::async_complete`].
    Async,
}

/// Capabilities the scheduler consumes from its owner.
pub trait SchedulerClient: Send + Sync {
    /// Issue one dequeued op. Runs on a worker thread without scheduler
    /// locks held.
    fn issue(&self, op: StreamOp) -> Issued;

    /// Final hand-back of a completed op. Its result slot is filled.
    fn release(&self, op: StreamOp);

    /// Unrecoverable scheduler-internal error.
    fn fatal(&self, reason: &str) {
        tracing::error!(target: "sio::sched", reason, "scheduler_fatal");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub reorder: ReorderOptions,
    /// Upper bound on issued-but-incomplete ops per stream. `None` is
    /// unlimited.
    pub max_in_flight_per_stream: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Uninitialized,
    Serving,
    ShuttingDown,
}

/// Monotonic counters since the last `init`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub dequeued: u64,
    pub issued: u64,
    pub issued_async: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Result of [`Scheduler::enqueue`].
#[derive(Debug, Default)]
pub struct EnqueueOutcome {
    pub accepted: usize,
    /// Ops whose stream is unknown or closed. Ownership is back with the
    /// caller.
    pub rejected: Vec<StreamOp>,
}

/// Snapshot of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub priority: u32,
    pub state: StreamState,
    pub pending: usize,
    pub in_flight: usize,
    pub queued: bool,
}

struct Inner {
    state: SchedulerState,
    client: Option<Arc<dyn SchedulerClient>>,
    config: SchedulerConfig,
    streams: HashMap<StreamId, Stream>,
    queue: Queue,
    /// Pending plus in-flight across all streams.
    outstanding: usize,
    stats: SchedulerStats,
}

impl Inner {
    fn activate(&mut self, id: StreamId) {
        let limit = self.config.max_in_flight_per_stream;
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.queued && stream.is_ready(limit) {
                stream.queued = self.queue.push(id, stream.priority());
            }
        }
    }

    /// Pop the next op in priority order and mark it in flight.
    fn take_next(&mut self) -> Option<StreamOp> {
        while let Some(id) = self.queue.pop() {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            stream.queued = false;
            let Some(op) = stream.take_next() else {
                continue;
            };
            self.activate(id);
            self.stats.dequeued += 1;
            tracing::trace!(
                target: "sio::sched",
                stream = id.0,
                op = op.id.0,
                "op_dequeued"
            );
            return Some(op);
        }
        None
    }
}

/// Multi-stream priority scheduler.
pub struct Scheduler {
    inner: Mutex<Inner>,
    cond: Condvar,
    workers: Mutex<Option<WorkerPool>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Scheduler")
            .field("state", &inner.state)
            .field("streams", &inner.streams.len())
            .field("outstanding", &inner.outstanding)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SchedulerState::Uninitialized,
                client: None,
                config: SchedulerConfig::default(),
                streams: HashMap::new(),
                queue: Queue::new(),
                outstanding: 0,
                stats: SchedulerStats::default(),
            }),
            cond: Condvar::new(),
            workers: Mutex::new(None),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Attach `client` and start serving with the given reorder policy.
    pub fn init(&self, client: Arc<dyn SchedulerClient>, options: ReorderOptions) -> Result<()> {
        self.init_with_config(
            client,
            SchedulerConfig {
                reorder: options,
                ..SchedulerConfig::default()
            },
        )
    }

    pub fn init_with_config(
        &self,
        client: Arc<dyn SchedulerClient>,
        config: SchedulerConfig,
    ) -> Result<()> {
        if config.max_in_flight_per_stream == Some(0) {
            return Err(SioError::InvalidArgument(
                "max_in_flight_per_stream must be at least 1".to_owned(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Uninitialized {
            return Err(SioError::BadState(format!(
                "init while {:?}",
                inner.state
            )));
        }
        inner.client = Some(client);
        inner.config = config;
        inner.stats = SchedulerStats::default();
        inner.state = SchedulerState::Serving;
        tracing::info!(
            target: "sio::sched",
            reorder = config.reorder.bits(),
            max_in_flight = ?config.max_in_flight_per_stream,
            "scheduler_init"
        );
        Ok(())
    }

    /// Start `count` worker threads pulling from this scheduler.
    ///
    /// The pool holds a clone of the `Arc` until `shutdown` joins it.
    pub fn serve(self: &Arc<Self>, count: usize) -> Result<()> {
        if count == 0 {
            return Err(SioError::InvalidArgument(
                "worker count must be at least 1".to_owned(),
            ));
        }
        if self.state() != SchedulerState::Serving {
            return Err(SioError::BadState("serve before init".to_owned()));
        }
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Err(SioError::BadState("workers already running".to_owned()));
        }
        *workers = Some(WorkerPool::start(Arc::clone(self), count)?);
        Ok(())
    }

    /// Drain every stream, join the workers and return to `Uninitialized`.
    ///
    /// Blocks until all in-flight ops complete, including async ones. Ops
    /// still queued when no worker is left to take them are issued from
    /// the calling thread. Must not be called from a client callback.
    pub fn shutdown(&self) -> Result<()> {
        let client = {
            let mut inner = self.inner.lock();
            match inner.state {
                SchedulerState::Uninitialized => return Ok(()),
                SchedulerState::ShuttingDown => {
                    return Err(SioError::BadState("shutdown already in progress".to_owned()));
                }
                SchedulerState::Serving => {}
            }
            inner.state = SchedulerState::ShuttingDown;
            tracing::info!(
                target: "sio::sched",
                outstanding = inner.outstanding,
                streams = inner.streams.len(),
                "scheduler_shutdown_begin"
            );
            self.cond.notify_all();
            inner.client.clone()
        };

        let mut inline_issued = 0_u64;
        loop {
            let mut inner = self.inner.lock();
            if inner.outstanding == 0 {
                break;
            }
            if let Some(op) = inner.take_next() {
                drop(inner);
                if let Some(client) = &client {
                    self.issue_with(client.as_ref(), op);
                    inline_issued += 1;
                }
                continue;
            }
            self.cond.wait(&mut inner);
        }

        let pool = self.workers.lock().take();
        let reports = pool.map(WorkerPool::join).unwrap_or_default();

        let mut inner = self.inner.lock();
        let released = inner.streams.len();
        inner.streams.clear();
        inner.queue.clear();
        inner.client = None;
        inner.state = SchedulerState::Uninitialized;
        tracing::info!(
            target: "sio::sched",
            workers = reports.len(),
            inline_issued,
            released_streams = released,
            completed = inner.stats.completed,
            "scheduler_shutdown_complete"
        );
        self.cond.notify_all();
        Ok(())
    }

    // ── Streams ─────────────────────────────────────────────────────────────

    pub fn stream_open(&self, id: StreamId, priority: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Serving {
            return Err(SioError::BadState(format!(
                "stream_open while {:?}",
                inner.state
            )));
        }
        if inner.streams.contains_key(&id) {
            return Err(SioError::AlreadyExists(format!("stream {id}")));
        }
        let priority = Priority::new(priority)?;
        inner.streams.insert(id, Stream::new(id, priority));
        tracing::debug!(
            target: "sio::sched",
            stream = id.0,
            priority = priority.get(),
            "stream_open"
        );
        Ok(())
    }

    /// Stop accepting ops for `id`. Pending ops are still issued; the id is
    /// released once the stream drains.
    pub fn stream_close(&self, id: StreamId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get_mut(&id) else {
            return Err(SioError::NotFound(format!("stream {id}")));
        };
        if stream.state() == StreamState::Closing {
            return Err(SioError::BadState(format!("stream {id} already closed")));
        }
        stream.close();
        let drained = stream.is_drained();
        if drained {
            inner.streams.remove(&id);
        }
        tracing::debug!(
            target: "sio::sched",
            stream = id.0,
            released = drained,
            "stream_close"
        );
        Ok(())
    }

    #[must_use]
    pub fn stream_info(&self, id: StreamId) -> Option<StreamInfo> {
        let inner = self.inner.lock();
        inner.streams.get(&id).map(|s| StreamInfo {
            id,
            priority: s.priority().get(),
            state: s.state(),
            pending: s.pending_len(),
            in_flight: s.in_flight(),
            queued: s.queued,
        })
    }

    // ── Op flow ─────────────────────────────────────────────────────────────

    /// Hand ops to their streams. Ops for unknown or closed streams, or any
    /// op while the scheduler is not serving, come back in `rejected`.
    pub fn enqueue(&self, ops: impl IntoIterator<Item = StreamOp>) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let serving = inner.state == SchedulerState::Serving;
        let reorder = inner.config.reorder;
        for op in ops {
            let target = op.stream;
            let stream = if serving {
                inner
                    .streams
                    .get_mut(&target)
                    .filter(|s| s.state() == StreamState::Open)
            } else {
                None
            };
            let Some(stream) = stream else {
                outcome.rejected.push(op);
                continue;
            };
            let pos = stream.insert(op, reorder);
            tracing::trace!(
                target: "sio::sched",
                stream = target.0,
                pos,
                "op_enqueued"
            );
            outcome.accepted += 1;
            inner.outstanding += 1;
            inner.activate(target);
        }
        inner.stats.enqueued += outcome.accepted as u64;
        inner.stats.rejected += outcome.rejected.len() as u64;
        if !outcome.rejected.is_empty() {
            tracing::warn!(
                target: "sio::sched",
                rejected = outcome.rejected.len(),
                "ops_rejected"
            );
        }
        drop(guard);
        if outcome.accepted > 0 {
            self.cond.notify_all();
        }
        outcome
    }

    /// Take the highest-priority ready op.
    ///
    /// Returns `Canceled` once shutdown has begun and nothing is ready, or
    /// when the scheduler is not initialized. With `wait == false` an empty
    /// scheduler returns `ShouldWait` instead of blocking.
    pub fn dequeue(&self, wait: bool) -> Result<StreamOp> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state == SchedulerState::Uninitialized {
                return Err(SioError::Canceled);
            }
            if let Some(op) = inner.take_next() {
                return Ok(op);
            }
            if inner.state == SchedulerState::ShuttingDown {
                return Err(SioError::Canceled);
            }
            if !wait {
                return Err(SioError::ShouldWait);
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Issue a dequeued op through the client and complete it if the client
    /// finished synchronously.
    pub fn issue(&self, op: StreamOp) -> Result<()> {
        let client = self
            .inner
            .lock()
            .client
            .clone()
            .ok_or(SioError::Canceled)?;
        self.issue_with(client.as_ref(), op);
        Ok(())
    }

    fn issue_with(&self, client: &dyn SchedulerClient, op: StreamOp) {
        self.inner.lock().stats.issued += 1;
        match client.issue(op) {
            Issued::Complete(op) => self.complete(op),
            Issued::Async => {
                self.inner.lock().stats.issued_async += 1;
            }
        }
    }

    /// Completion path for ops the client issued asynchronously.
    ///
    /// Never blocks beyond the scheduler lock. An op without a recorded
    /// result is treated as successful.
    pub fn async_complete(&self, op: StreamOp) {
        self.complete(op);
    }

    fn complete(&self, mut op: StreamOp) {
        if !op.is_complete() {
            op.set_result(Ok(()));
        }
        let failed = matches!(op.result(), Some(Err(_)));
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = op.stream;
        let status = match inner.streams.get_mut(&id) {
            None => Err(format!("completion for op {} on unknown stream {id}", op.id)),
            Some(stream) => {
                if stream.complete_one() {
                    Ok(stream.state() == StreamState::Closing && stream.is_drained())
                } else {
                    Err(format!("completion for op {} with nothing in flight", op.id))
                }
            }
        };
        let fault = match status {
            Ok(release) => {
                if release {
                    inner.streams.remove(&id);
                    tracing::debug!(target: "sio::sched", stream = id.0, "stream_released");
                } else {
                    inner.activate(id);
                }
                inner.outstanding = inner.outstanding.saturating_sub(1);
                inner.stats.completed += 1;
                if failed {
                    inner.stats.failed += 1;
                }
                None
            }
            Err(reason) => Some(reason),
        };
        let client = inner.client.clone();
        tracing::trace!(
            target: "sio::sched",
            stream = id.0,
            op = op.id.0,
            failed,
            outstanding = inner.outstanding,
            "op_completed"
        );
        drop(guard);
        self.cond.notify_all();

        if let Some(client) = client {
            if let Some(reason) = &fault {
                client.fatal(reason);
            }
            client.release(op);
        } else if let Some(reason) = fault {
            tracing::error!(target: "sio::sched", reason = %reason, "scheduler_fatal");
        }
    }

    /// Report an unrecoverable error through the client.
    pub(crate) fn report_fatal(&self, reason: &str) {
        let client = self.inner.lock().client.clone();
        match client {
            Some(client) => client.fatal(reason),
            None => tracing::error!(target: "sio::sched", reason, "scheduler_fatal"),
        }
    }

    // ── Introspection ───────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats
    }

    /// Pending plus in-flight ops across all streams.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpClass;
    use sio_types::OpId;

    /// Completes every op synchronously, or parks it when `park` is set.
    #[derive(Default)]
    struct TestClient {
        park: bool,
        issued: Mutex<Vec<OpId>>,
        parked: Mutex<Vec<StreamOp>>,
        released: Mutex<Vec<OpId>>,
        fatals: Mutex<Vec<String>>,
    }

    impl TestClient {
        fn parking() -> Self {
            Self {
                park: true,
                ..Self::default()
            }
        }
    }

    impl SchedulerClient for TestClient {
        fn issue(&self, mut op: StreamOp) -> Issued {
            self.issued.lock().push(op.id);
            if self.park {
                self.parked.lock().push(op);
                Issued::Async
            } else {
                op.set_result(Ok(()));
                Issued::Complete(op)
            }
        }

        fn release(&self, op: StreamOp) {
            self.released.lock().push(op.id);
        }

        fn fatal(&self, reason: &str) {
            self.fatals.lock().push(reason.to_owned());
        }
    }

    fn op(id: u64, stream: u32) -> StreamOp {
        StreamOp::new(OpId(id), StreamId(stream), OpClass::Write, id, 1)
    }

    fn serving(client: &Arc<TestClient>) -> Scheduler {
        let sched = Scheduler::new();
        sched
            .init(Arc::clone(client) as Arc<dyn SchedulerClient>, ReorderOptions::NONE)
            .unwrap();
        sched
    }

    #[test]
    fn higher_priority_stream_dequeues_first() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(1), 10).unwrap();
        sched.stream_open(StreamId(2), 5).unwrap();
        let outcome = sched.enqueue([op(20, 2), op(10, 1)]);
        assert_eq!(outcome.accepted, 2);

        assert_eq!(sched.dequeue(false).unwrap().stream, StreamId(1));
        assert_eq!(sched.dequeue(false).unwrap().stream, StreamId(2));
        assert!(matches!(sched.dequeue(false), Err(SioError::ShouldWait)));
    }

    #[test]
    fn priority_above_max_is_invalid() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        assert!(matches!(
            sched.stream_open(StreamId(1), 40),
            Err(SioError::InvalidArgument(_))
        ));
        assert!(sched.stream_info(StreamId(1)).is_none());
    }

    #[test]
    fn duplicate_open_is_rejected_until_released() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(1), 3).unwrap();
        assert!(matches!(
            sched.stream_open(StreamId(1), 3),
            Err(SioError::AlreadyExists(_))
        ));

        sched.enqueue([op(1, 1)]);
        sched.stream_close(StreamId(1)).unwrap();
        // Still draining.
        assert!(matches!(
            sched.stream_open(StreamId(1), 3),
            Err(SioError::AlreadyExists(_))
        ));

        let taken = sched.dequeue(false).unwrap();
        sched.issue(taken).unwrap();
        assert!(sched.stream_info(StreamId(1)).is_none());
        sched.stream_open(StreamId(1), 7).unwrap();
        assert_eq!(sched.stream_info(StreamId(1)).unwrap().priority, 7);
    }

    #[test]
    fn api_before_init_reports_bad_state() {
        let sched = Scheduler::new();
        assert!(matches!(
            sched.stream_open(StreamId(1), 1),
            Err(SioError::BadState(_))
        ));
        assert!(matches!(sched.dequeue(false), Err(SioError::Canceled)));
        let outcome = sched.enqueue([op(1, 1)]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected.len(), 1);
    }

    #[test]
    fn double_init_is_bad_state() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        assert!(matches!(
            sched.init(Arc::clone(&client) as Arc<dyn SchedulerClient>, ReorderOptions::NONE),
            Err(SioError::BadState(_))
        ));
    }

    #[test]
    fn rejected_ops_never_reach_the_client() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(1), 1).unwrap();
        let outcome = sched.enqueue([op(1, 1), op(2, 99), op(3, 1)]);
        assert_eq!(outcome.accepted, 2);
        let rejected: Vec<_> = outcome.rejected.iter().map(|o| o.id).collect();
        assert_eq!(rejected, vec![OpId(2)]);

        while let Ok(next) = sched.dequeue(false) {
            sched.issue(next).unwrap();
        }
        assert_eq!(*client.issued.lock(), vec![OpId(1), OpId(3)]);
        assert_eq!(*client.released.lock(), vec![OpId(1), OpId(3)]);
        let stats = sched.stats();
        assert_eq!((stats.enqueued, stats.rejected, stats.completed), (2, 1, 2));
    }

    #[test]
    fn closed_stream_rejects_new_ops_but_drains_old_ones() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(4), 2).unwrap();
        sched.enqueue([op(1, 4), op(2, 4)]);
        sched.stream_close(StreamId(4)).unwrap();

        let late = sched.enqueue([op(3, 4)]);
        assert_eq!(late.accepted, 0);
        assert_eq!(late.rejected[0].id, OpId(3));

        let first = sched.dequeue(false).unwrap();
        assert_eq!(first.id, OpId(1));
        sched.issue(first).unwrap();
        assert!(sched.stream_info(StreamId(4)).is_some());
        let second = sched.dequeue(false).unwrap();
        sched.issue(second).unwrap();
        assert!(sched.stream_info(StreamId(4)).is_none());
        assert!(matches!(
            sched.stream_close(StreamId(4)),
            Err(SioError::NotFound(_))
        ));
    }

    #[test]
    fn equal_priorities_alternate() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(1), 4).unwrap();
        sched.stream_open(StreamId(2), 4).unwrap();
        sched.enqueue([op(1, 1), op(2, 1), op(3, 2), op(4, 2)]);
        let order: Vec<u32> = (0..4).map(|_| sched.dequeue(false).unwrap().stream.0).collect();
        assert_eq!(order, vec![1, 2, 1, 2]);
    }

    #[test]
    fn in_flight_limit_holds_stream_until_async_completion() {
        let client = Arc::new(TestClient::parking());
        let sched = Scheduler::new();
        sched
            .init_with_config(
                Arc::clone(&client) as Arc<dyn SchedulerClient>,
                SchedulerConfig {
                    reorder: ReorderOptions::NONE,
                    max_in_flight_per_stream: Some(1),
                },
            )
            .unwrap();
        sched.stream_open(StreamId(1), 0).unwrap();
        sched.enqueue([op(1, 1), op(2, 1)]);

        let first = sched.dequeue(false).unwrap();
        sched.issue(first).unwrap();
        assert!(matches!(sched.dequeue(false), Err(SioError::ShouldWait)));
        assert!(!sched.stream_info(StreamId(1)).unwrap().queued);

        let parked = client.parked.lock().pop().unwrap();
        sched.async_complete(parked);
        assert_eq!(sched.dequeue(false).unwrap().id, OpId(2));
        assert_eq!(sched.stats().issued_async, 1);
    }

    #[test]
    fn zero_in_flight_limit_is_invalid() {
        let client = Arc::new(TestClient::default());
        let sched = Scheduler::new();
        let result = sched.init_with_config(
            client as Arc<dyn SchedulerClient>,
            SchedulerConfig {
                reorder: ReorderOptions::NONE,
                max_in_flight_per_stream: Some(0),
            },
        );
        assert!(matches!(result, Err(SioError::InvalidArgument(_))));
    }

    #[test]
    fn failed_results_are_counted() {
        struct Failing;
        impl SchedulerClient for Failing {
            fn issue(&self, mut op: StreamOp) -> Issued {
                op.set_result(Err(SioError::Io(std::io::Error::other("media error"))));
                Issued::Complete(op)
            }
            fn release(&self, _op: StreamOp) {}
        }
        let sched = Scheduler::new();
        sched.init(Arc::new(Failing), ReorderOptions::NONE).unwrap();
        sched.stream_open(StreamId(1), 1).unwrap();
        sched.enqueue([op(1, 1)]);
        let next = sched.dequeue(false).unwrap();
        sched.issue(next).unwrap();
        assert_eq!(sched.stats().failed, 1);
    }

    #[test]
    fn stray_completion_is_fatal_not_a_panic() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.async_complete(op(9, 77));
        assert_eq!(client.fatals.lock().len(), 1);
        assert_eq!(*client.released.lock(), vec![OpId(9)]);
    }

    #[test]
    fn shutdown_issues_leftovers_and_allows_reinit() {
        let client = Arc::new(TestClient::default());
        let sched = serving(&client);
        sched.stream_open(StreamId(1), 1).unwrap();
        sched.stream_open(StreamId(2), 9).unwrap();
        sched.enqueue([op(1, 1), op(2, 2)]);

        sched.shutdown().unwrap();
        assert_eq!(sched.state(), SchedulerState::Uninitialized);
        assert_eq!(*client.issued.lock(), vec![OpId(2), OpId(1)]);
        assert!(matches!(sched.dequeue(true), Err(SioError::Canceled)));
        assert!(sched.stream_info(StreamId(1)).is_none());

        sched
            .init(Arc::clone(&client) as Arc<dyn SchedulerClient>, ReorderOptions::NONE)
            .unwrap();
        sched.stream_open(StreamId(1), 1).unwrap();
        assert_eq!(sched.stats(), SchedulerStats::default());
    }

    #[test]
    fn shutdown_without_init_is_a_no_op() {
        let sched = Scheduler::new();
        sched.shutdown().unwrap();
        assert_eq!(sched.state(), SchedulerState::Uninitialized);
    }
}
