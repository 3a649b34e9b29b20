//! Fixed-size pool of threads draining a [`Scheduler`].
//!
//! Each worker loops on a blocking `dequeue`, hands the op to the client,
//! and exits when the scheduler reports `Canceled`.

use crate::scheduler::Scheduler;
use serde::Serialize;
use sio_error::{Result, SioError};
use std::sync::Arc;
use std::thread::JoinHandle;

/// What one worker did before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub issued: u64,
}

pub struct WorkerPool {
    handles: Vec<(usize, JoinHandle<WorkerReport>)>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `count` workers. Threads already started are left running if a
    /// later spawn fails; they exit at the next shutdown.
    pub fn start(scheduler: Arc<Scheduler>, count: usize) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let sched = Arc::clone(&scheduler);
            let handle = std::thread::Builder::new()
                .name(format!("sio-worker-{index}"))
                .spawn(move || run(&sched, index))
                .map_err(SioError::Io)?;
            handles.push((index, handle));
        }
        tracing::info!(target: "sio::worker", workers = count, "worker_pool_started");
        Ok(Self { handles })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit. A panicked worker is logged and
    /// reported with zero issued ops.
    pub fn join(self) -> Vec<WorkerReport> {
        self.handles
            .into_iter()
            .map(|(index, handle)| {
                handle.join().unwrap_or_else(|_| {
                    tracing::error!(target: "sio::worker", worker = index, "worker_panicked");
                    WorkerReport {
                        worker: index,
                        issued: 0,
                    }
                })
            })
            .collect()
    }
}

fn run(scheduler: &Scheduler, index: usize) -> WorkerReport {
    let mut issued = 0_u64;
    tracing::debug!(target: "sio::worker", worker = index, "worker_start");
    loop {
        match scheduler.dequeue(true) {
            Ok(op) => {
                if let Err(err) = scheduler.issue(op) {
                    tracing::warn!(target: "sio::worker", worker = index, error = %err, "issue_failed");
                    break;
                }
                issued += 1;
            }
            Err(SioError::Canceled) => break,
            Err(err) => {
                scheduler.report_fatal(&format!("worker {index} dequeue failed: {err}"));
                break;
            }
        }
    }
    tracing::debug!(target: "sio::worker", worker = index, issued, "worker_exit");
    WorkerReport {
        worker: index,
        issued,
    }
}
