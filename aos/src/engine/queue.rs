//! Bounded worker pool over an in-process FIFO queue.
//!
//! Runs are independent; within a run execution is sequential, across runs
//! up to `workers` proceed concurrently. The admission queue is bounded and
//! overflow surfaces as `backpressure` to the submitter, never queued
//! invisibly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use crate::engine::Engine;
use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::types::{RunContext, RunSummary, TaskSpec};

pub struct RunJob {
    pub task: TaskSpec,
    pub ctx: RunContext,
    pub cancel: Arc<AtomicBool>,
    pub started: Arc<AtomicBool>,
    pub done: oneshot::Sender<KernelResult<RunSummary>>,
}

#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::Sender<RunJob>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish()
    }
}

impl WorkerPool {
    pub fn start(engine: Arc<Engine>, workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<RunJob>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..workers.max(1) {
            let engine = Arc::clone(&engine);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };

                    job.started.store(true, Ordering::Relaxed);
                    debug!(worker_id, run_id = %job.ctx.run_id, "worker picked up run");
                    let result = engine.run(&job.task, &job.ctx, Arc::clone(&job.cancel)).await;
                    if let Err(e) = &result {
                        error!(run_id = %job.ctx.run_id, error = %e, "run terminated with error");
                    }
                    let _ = job.done.send(result);
                }
            });
        }

        Self { sender }
    }

    /// Non-blocking admission. A full queue is backpressure, surfaced to the
    /// caller rather than retried internally.
    pub fn try_submit(&self, job: RunJob) -> KernelResult<()> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => KernelError::attempt(
                ErrorKind::Backpressure,
                "admission queue is full; retry after in-flight runs drain",
            ),
            mpsc::error::TrySendError::Closed(_) => {
                KernelError::Store("worker pool has shut down".into())
            }
        })
    }
}
