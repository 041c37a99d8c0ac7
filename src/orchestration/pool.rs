//! Fixed-size worker pool.
//!
//! The `WorkerPool` owns `size` long-lived worker tasks. Each worker has a
//! private job channel, runs one phase-step at a time, and hands the node
//! back over the shared completion channel. The pool tracks which workers
//! are idle, so at most `size` phase-steps are ever in flight.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskNode, WorkerEnv};
use crate::{plog_debug, plog_warn};

/// Identifier of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Messages from workers to the scheduler.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A phase-step finished; the node comes back with its phase advanced.
    Finished {
        /// The worker that ran the step and is now idle.
        worker: WorkerId,
        /// The node after the step.
        node: TaskNode,
    },
}

/// Manages the fixed set of workers.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::mpsc;
/// use phasepool::core::WorkerEnv;
/// use phasepool::orchestration::WorkerPool;
///
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let mut pool = WorkerPool::spawn(3, WorkerEnv::default(), tx);
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.in_flight(), 0);
/// ```
pub struct WorkerPool {
    jobs: Vec<mpsc::UnboundedSender<TaskNode>>,
    idle: VecDeque<WorkerId>,
    handles: Vec<JoinHandle<()>>,
    /// Workers whose job channel closed; never dispatched to again.
    dead: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Start `size` workers that report to `done_tx`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(size: usize, env: WorkerEnv, done_tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        let cancel = CancellationToken::new();
        let mut jobs = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        let mut idle = VecDeque::with_capacity(size);

        for index in 0..size {
            let id = WorkerId(index);
            let (job_tx, job_rx) = mpsc::unbounded_channel();
            handles.push(tokio::spawn(run_worker(
                id,
                job_rx,
                done_tx.clone(),
                env.clone(),
                cancel.child_token(),
            )));
            jobs.push(job_tx);
            idle.push_back(id);
        }

        plog_debug!("WorkerPool::spawn size={}", size);
        Self {
            jobs,
            idle,
            handles,
            dead: 0,
            cancel,
        }
    }

    /// Hand `node` to the next idle worker.
    ///
    /// Gives the node back when no worker is idle or the chosen worker is
    /// gone.
    pub fn dispatch(&mut self, mut node: TaskNode) -> Result<WorkerId, TaskNode> {
        while let Some(worker) = self.idle.pop_front() {
            match self.jobs[worker.0].send(node) {
                Ok(()) => return Ok(worker),
                Err(mpsc::error::SendError(returned)) => {
                    plog_warn!("{} is gone, not dispatching to it again", worker);
                    self.dead += 1;
                    node = returned;
                }
            }
        }
        Err(node)
    }

    /// Mark `worker` idle again after it reported back.
    pub fn release(&mut self, worker: WorkerId) {
        if !self.idle.contains(&worker) {
            self.idle.push_back(worker);
        }
    }

    /// Number of phase-steps currently running.
    pub fn in_flight(&self) -> usize {
        self.jobs.len() - self.idle.len() - self.dead
    }

    pub fn has_capacity(&self) -> bool {
        !self.idle.is_empty()
    }

    pub fn size(&self) -> usize {
        self.jobs.len()
    }

    /// Signal every worker to stop, abandoning running phase-steps, and
    /// wait for all of them to exit.
    pub async fn shutdown(self) {
        plog_debug!("WorkerPool::shutdown");
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    id: WorkerId,
    mut jobs: mpsc::UnboundedReceiver<TaskNode>,
    done_tx: mpsc::UnboundedSender<WorkerEvent>,
    env: WorkerEnv,
    cancel: CancellationToken,
) {
    loop {
        let mut node = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(node) => node,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                plog_debug!("{} cancelled while running {}", id, node.label());
                break;
            }
            _ = node.step(&env) => {}
        }

        if done_tx.send(WorkerEvent::Finished { worker: id, node }).is_err() {
            break;
        }
    }
    plog_debug!("{} exiting", id);
}
