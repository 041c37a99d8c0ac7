//! Fan-out/fan-in phase scheduler.
//!
//! The Scheduler owns every piece of bookkeeping: the ready queue, the
//! parents waiting on children, and the buffer of resolved roots. Workers
//! only ever see one `TaskNode` at a time and hand it back through the
//! completion channel; every state transition happens here, on the task
//! that polls `next()`.

use std::collections::VecDeque;

use futures::Stream;
use tokio::sync::mpsc;

use crate::core::{Resolved, Task, TaskId, TaskNode, Token, WorkerEnv};
use crate::error::{Error, Result};
use crate::orchestration::pool::{WorkerEvent, WorkerId, WorkerPool};
use crate::orchestration::registry::WaitingRegistry;
use crate::{plog_debug, plog_error, plog_trace};

/// Events emitted by the scheduler as the task tree evolves.
///
/// These let a caller follow progress without polling the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A phase-step was handed to a worker.
    PhaseDispatched {
        task: TaskId,
        label: String,
        phase: usize,
        worker: WorkerId,
    },
    /// A phase spawned children; the task now waits under `token`.
    FannedOut {
        task: TaskId,
        token: Token,
        children: usize,
    },
    /// A child resolved into its waiting parent.
    FannedIn {
        task: TaskId,
        parent: Token,
        remaining: usize,
    },
    /// A phase returned an error or panicked.
    PhaseFailed {
        task: TaskId,
        phase: usize,
        message: String,
    },
    /// A root task fully resolved and is ready for the consumer.
    RootResolved { task: TaskId, failed: bool },
}

/// Dispatches phase-steps to a fixed worker pool and yields resolved roots.
///
/// # Example
///
/// ```ignore
/// use phasepool::orchestration::Scheduler;
///
/// let mut scheduler = Scheduler::new(4)?;
/// scheduler.submit(cases);
/// while let Some(resolved) = scheduler.next().await {
///     println!("{} done (failed: {})", resolved.label, resolved.is_failed());
/// }
/// scheduler.shutdown().await;
/// ```
pub struct Scheduler {
    pool: WorkerPool,
    completions: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Dispatchable phase-steps. Children and continuations go to the
    /// front, fresh submissions to the back.
    queue: VecDeque<TaskNode>,
    /// Parents waiting for their children, keyed by the token the
    /// children carry.
    waiting: WaitingRegistry<TaskNode>,
    /// Resolved roots not yet handed to the consumer.
    completed: VecDeque<Resolved>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    dispatched: u64,
}

impl Scheduler {
    /// Create a scheduler with `pool_size` workers and the default
    /// worker environment.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(pool_size: usize) -> Result<Self> {
        Self::with_env(pool_size, WorkerEnv::default())
    }

    /// Create a scheduler whose workers share `env`.
    pub fn with_env(pool_size: usize, env: WorkerEnv) -> Result<Self> {
        if pool_size == 0 {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        let (done_tx, completions) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(pool_size, env, done_tx);
        Ok(Self {
            pool,
            completions,
            queue: VecDeque::new(),
            waiting: WaitingRegistry::new(),
            completed: VecDeque::new(),
            events: None,
            dispatched: 0,
        })
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Submit root tasks. They queue behind everything already submitted.
    pub fn submit<T, I>(&mut self, tasks: I)
    where
        T: Task,
        I: IntoIterator<Item = T>,
    {
        self.submit_boxed(tasks.into_iter().map(|t| Box::new(t) as Box<dyn Task>));
    }

    /// Submit root tasks of mixed types.
    pub fn submit_boxed<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = Box<dyn Task>>,
    {
        for task in tasks {
            let node = TaskNode::new(task);
            if node.is_terminal() {
                self.settle(node);
            } else {
                self.queue.push_back(node);
            }
        }
        self.pump();
    }

    /// Submit more roots while consuming results.
    ///
    /// Same as `submit`; roots added between two `next()` calls are
    /// picked up by the same stream.
    pub fn add_more<T, I>(&mut self, tasks: I)
    where
        T: Task,
        I: IntoIterator<Item = T>,
    {
        self.submit(tasks);
    }

    /// Wait for the next fully resolved root.
    ///
    /// Returns `None` once the queue is empty, nothing is in flight and
    /// every resolved root has been handed out. Cancel-safe: dropping the
    /// future between completions loses nothing.
    pub async fn next(&mut self) -> Option<Resolved> {
        loop {
            if let Some(resolved) = self.completed.pop_front() {
                return Some(resolved);
            }

            self.pump();
            if self.pool.in_flight() == 0 {
                if !self.queue.is_empty() || !self.waiting.is_empty() {
                    plog_error!(
                        "Scheduler stalled with {} queued and {} waiting tasks and no live workers",
                        self.queue.len(),
                        self.waiting.len()
                    );
                }
                return None;
            }

            match self.completions.recv().await {
                Some(WorkerEvent::Finished { worker, node }) => {
                    self.pool.release(worker);
                    plog_trace!("{} returned {} at phase {}", worker, node.label(), node.phase());
                    self.settle(node);
                    self.pump();
                }
                None => {
                    plog_error!("Scheduler completion channel closed");
                    return None;
                }
            }
        }
    }

    /// Consume the scheduler as a stream of resolved roots.
    pub fn into_stream(self) -> impl Stream<Item = Resolved> + Send {
        futures::stream::unfold(self, |mut scheduler| async move {
            let resolved = scheduler.next().await?;
            Some((resolved, scheduler))
        })
    }

    /// Stop dispatching, cancel and join every worker, and drop all
    /// unresolved trees.
    pub async fn shutdown(mut self) {
        let in_flight = self.pool.in_flight();
        let queued = self.queue.len();
        let waiting = self.waiting.clear();
        self.queue.clear();
        self.pool.shutdown().await;
        plog_debug!(
            "Scheduler shut down: discarded {} queued, {} waiting, {} in flight, {} undelivered",
            queued,
            waiting,
            in_flight,
            self.completed.len()
        );
    }

    /// Phase-steps currently running on workers.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Phase-steps ready to run but not yet dispatched.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Parents waiting on children.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Total phase-steps dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Fill every idle worker from the front of the queue.
    fn pump(&mut self) {
        while self.pool.has_capacity() {
            let Some(node) = self.queue.pop_front() else {
                break;
            };
            let (task, label, phase) = (node.id(), node.label().to_string(), node.phase());
            match self.pool.dispatch(node) {
                Ok(worker) => {
                    self.dispatched += 1;
                    plog_trace!("{} phase {} -> {}", label, phase, worker);
                    self.emit(SchedulerEvent::PhaseDispatched {
                        task,
                        label,
                        phase,
                        worker,
                    });
                }
                Err(node) => {
                    self.queue.push_front(node);
                    break;
                }
            }
        }
    }

    /// Apply the one transition a returned node calls for: fan-out,
    /// continuation, fan-in or completion.
    fn settle(&mut self, mut node: TaskNode) {
        loop {
            if node.has_children() {
                self.fan_out(node);
                return;
            }

            if !node.is_terminal() {
                self.queue.push_front(node);
                return;
            }

            if let Some(failure) = node.failure() {
                self.emit(SchedulerEvent::PhaseFailed {
                    task: node.id(),
                    phase: failure.phase,
                    message: failure.message.clone(),
                });
            }

            let Some(token) = node.parent() else {
                let task = node.id();
                let failed = node.failure().is_some();
                plog_debug!("{} resolved (failed: {})", node.label(), failed);
                self.completed.push_back(node.into_resolved());
                self.emit(SchedulerEvent::RootResolved { task, failed });
                return;
            };

            let task = node.id();
            let Some(parent) = self.waiting.get_mut(token) else {
                plog_error!("{} reports to unknown parent {}", node.label(), token);
                return;
            };
            let last = parent.collect(node.into_resolved());
            let remaining = parent.outstanding();
            self.emit(SchedulerEvent::FannedIn {
                task,
                parent: token,
                remaining,
            });
            if !last {
                return;
            }
            match self.waiting.release(token) {
                Some(parent) => node = parent,
                None => return,
            }
        }
    }

    fn fan_out(&mut self, mut parent: TaskNode) {
        let children = parent.begin_wait();
        let task = parent.id();
        let count = children.len();
        plog_debug!("{} fans out {} children", parent.label(), count);
        let token = self.waiting.register(parent);
        self.emit(SchedulerEvent::FannedOut {
            task,
            token,
            children: count,
        });

        let mut ready = Vec::with_capacity(count);
        let mut resolved = Vec::new();
        for child in children {
            let mut node = TaskNode::new(child);
            node.set_parent(token);
            if node.is_terminal() {
                resolved.push(node);
            } else {
                ready.push(node);
            }
        }
        for node in ready.into_iter().rev() {
            self.queue.push_front(node);
        }
        for node in resolved {
            self.settle(node);
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
