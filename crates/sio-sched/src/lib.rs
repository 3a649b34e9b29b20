#![forbid(unsafe_code)]
//! Priority stream scheduler for block I/O.
//!
//! Clients open streams with a priority in `0..=31`, enqueue ops tagged
//! with a stream id, and either run a [`WorkerPool`] through
//! [`Scheduler::serve`] or pull ops themselves with
//! [`Scheduler::dequeue`]. Dequeue always picks the highest-priority ready
//! stream, oldest activation first. Within a stream, ops leave in FIFO
//! order unless the [`ReorderOptions`] given at `init` allow a same-class
//! or cross-class pass.
//!
//! ## Ownership
//!
//! A [`StreamOp`] has exactly one owner at a time. `enqueue` takes it,
//! or hands it back in [`EnqueueOutcome::rejected`]. An accepted op goes
//! to [`SchedulerClient::issue`] once and returns to the client through
//! [`SchedulerClient::release`] once, after completion.
//!
//! ## State machine
//!
//! ```text
//! Uninitialized --init--> Serving --shutdown--> ShuttingDown --drained--> Uninitialized
//! ```

pub mod op;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod worker;

pub use op::{OpClass, ReorderOptions, StreamOp};
pub use queue::Queue;
pub use scheduler::{
    EnqueueOutcome, Issued, Scheduler, SchedulerClient, SchedulerConfig, SchedulerState,
    SchedulerStats, StreamInfo,
};
pub use stream::{Stream, StreamState};
pub use worker::{WorkerPool, WorkerReport};
