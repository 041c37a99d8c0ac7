//! What a phase sees while it runs.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::task::{PhaseFailure, Task, TaskId};
use crate::core::temp::TempNamespace;
use crate::error::ToolError;
use crate::process::{ExecutionResult, Invocation, ProcessExecutor};
use crate::util;
use crate::{plog, plog_debug, plog_error, plog_warn, Result};

/// Shared resources handed to every phase a worker runs.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub executor: Arc<ProcessExecutor>,
    /// Directory holding the per-task temp namespaces.
    pub temp_dir: PathBuf,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self {
            executor: Arc::new(ProcessExecutor::default()),
            temp_dir: std::env::temp_dir().join("phasepool"),
        }
    }
}

impl WorkerEnv {
    pub fn new(executor: ProcessExecutor, temp_dir: PathBuf) -> Self {
        Self {
            executor: Arc::new(executor),
            temp_dir,
        }
    }
}

/// A task that has run all of its phases (or failed), together with the
/// failure that stopped it, if any.
pub struct Resolved {
    pub id: TaskId,
    pub label: String,
    task: Box<dyn Task>,
    failure: Option<PhaseFailure>,
}

impl Resolved {
    pub(crate) fn new(
        id: TaskId,
        label: String,
        task: Box<dyn Task>,
        failure: Option<PhaseFailure>,
    ) -> Self {
        Self {
            id,
            label,
            task,
            failure,
        }
    }

    /// The resolved task, if it is a `T`.
    pub fn task<T: 'static>(&self) -> Option<&T> {
        self.task.as_any().downcast_ref::<T>()
    }

    /// Take ownership of the resolved task, if it is a `T`.
    pub fn into_task<T: 'static>(self) -> Option<Box<T>> {
        self.task.into_any().downcast::<T>().ok()
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("failure", &self.failure)
            .finish()
    }
}

/// Handle passed to each phase operation.
///
/// Through it a phase logs under its task's label, spawns children, reads
/// the results of children spawned by an earlier phase, allocates temp
/// files, and runs external tools.
pub struct PhaseContext {
    label: String,
    phase: usize,
    children: Vec<Box<dyn Task>>,
    results: Vec<Resolved>,
    temp: TempNamespace,
    executor: Arc<ProcessExecutor>,
}

impl PhaseContext {
    pub fn new(
        label: &str,
        phase: usize,
        results: Vec<Resolved>,
        env: &WorkerEnv,
        temp_prefix: &str,
    ) -> Self {
        Self {
            label: label.to_string(),
            phase,
            children: Vec::new(),
            results,
            temp: TempNamespace::new(env.temp_dir.clone(), temp_prefix),
            executor: Arc::clone(&env.executor),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Index of the phase being run.
    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Queue a child task. The current task resumes only after every child
    /// spawned during this phase has resolved.
    pub fn spawn<T: Task>(&mut self, child: T) {
        self.children.push(Box::new(child));
    }

    pub fn spawn_boxed(&mut self, child: Box<dyn Task>) {
        self.children.push(child);
    }

    /// Number of children spawned so far in this phase.
    pub fn spawned(&self) -> usize {
        self.children.len()
    }

    /// Children collected by the last fan-in, in completion order.
    pub fn results(&self) -> &[Resolved] {
        &self.results
    }

    pub fn take_results(&mut self) -> Vec<Resolved> {
        std::mem::take(&mut self.results)
    }

    pub fn temp(&self) -> &TempNamespace {
        &self.temp
    }

    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    /// Run an external tool, logging the call under this task's label.
    ///
    /// The returned future does not borrow the context.
    pub fn invoke(
        &self,
        invocation: Invocation,
    ) -> impl Future<Output = std::result::Result<ExecutionResult, ToolError>> + Send + 'static {
        let executor = Arc::clone(&self.executor);
        let label = self.label.clone();
        async move {
            plog_debug!("[{}] running {}", label, invocation.command_line());
            let result = executor.invoke(invocation).await;
            if let Err(e) = &result {
                plog_warn!("[{}] {}", label, e);
            }
            result
        }
    }

    /// Run CPU-bound or blocking work off the async workers.
    pub fn blocking<F, T>(&self, f: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        util::blocking(f)
    }

    pub fn info(&self, msg: impl Display) {
        plog!("[{}] {}", self.label, msg);
    }

    pub fn debug(&self, msg: impl Display) {
        plog_debug!("[{}] {}", self.label, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        plog_warn!("[{}] {}", self.label, msg);
    }

    pub fn error(&self, msg: impl Display) {
        plog_error!("[{}] {}", self.label, msg);
    }

    pub(crate) fn into_parts(self) -> (Vec<Box<dyn Task>>, Vec<Resolved>) {
        (self.children, self.results)
    }
}
