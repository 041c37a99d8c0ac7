//! Scheduler-side state wrapped around a task.
//!
//! The task itself only knows its phases; the node tracks which phase runs
//! next, what the last phase spawned, the results collected from children,
//! and which waiting parent (if any) this node reports to.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::core::context::{PhaseContext, Resolved, WorkerEnv};
use crate::core::task::{PhaseFailure, Task, TaskId};
use crate::util::panic_message;
use crate::{plog_debug, plog_error};

/// Key of a waiting parent in the waiting registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct TaskNode {
    id: TaskId,
    label: String,
    task: Box<dyn Task>,
    /// Index of the next phase to run.
    phase: usize,
    /// Phase count seen at construction; checked after every dispatch.
    phase_count: usize,
    /// Children spawned by the phase that just ran.
    children: Vec<Box<dyn Task>>,
    /// Results collected by the last fan-in.
    results: Vec<Resolved>,
    /// Children still to report before this node may run again.
    outstanding: usize,
    parent: Option<Token>,
    failure: Option<PhaseFailure>,
}

impl TaskNode {
    pub fn new(task: Box<dyn Task>) -> Self {
        let label = task.label();
        let phase_count = task.phase_count();
        Self {
            id: TaskId::new(),
            label,
            task,
            phase: 0,
            phase_count,
            children: Vec::new(),
            results: Vec::new(),
            outstanding: 0,
            parent: None,
            failure: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Index of the phase the next dispatch will run.
    pub fn phase(&self) -> usize {
        self.phase
    }

    pub fn phase_count(&self) -> usize {
        self.phase_count
    }

    pub fn parent(&self) -> Option<Token> {
        self.parent
    }

    pub fn set_parent(&mut self, token: Token) {
        self.parent = Some(token);
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        self.failure.as_ref()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn results(&self) -> &[Resolved] {
        &self.results
    }

    /// Waiting for children to report.
    pub fn is_waiting(&self) -> bool {
        self.outstanding > 0
    }

    /// Nothing left to run: every phase done (or the task failed), no
    /// children pending.
    pub fn is_terminal(&self) -> bool {
        !self.has_children()
            && !self.is_waiting()
            && (self.failure.is_some() || self.phase >= self.phase_count)
    }

    /// Move the freshly spawned children out and start waiting for them.
    ///
    /// The result accumulator is reset; it fills up again as children
    /// report through `collect`.
    pub fn begin_wait(&mut self) -> Vec<Box<dyn Task>> {
        let children = std::mem::take(&mut self.children);
        self.outstanding = children.len();
        self.results.clear();
        children
    }

    /// Fold one child's result in. Returns `true` when it was the last one.
    pub fn collect(&mut self, result: Resolved) -> bool {
        if self.outstanding == 0 {
            plog_error!(
                "{} received an unexpected child result from {}",
                self.label,
                result.label
            );
            return false;
        }
        self.results.push(result);
        self.outstanding -= 1;
        self.outstanding == 0
    }

    /// Outstanding children.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Run the current phase and advance to the next one.
    ///
    /// A phase that returns an error or panics fails the task: the children
    /// it spawned are dropped and no further phase runs.
    pub async fn step(&mut self, env: &WorkerEnv) {
        let phase = self.phase;
        let prefix = self.task.temp_prefix();
        let results = std::mem::take(&mut self.results);
        let mut ctx = PhaseContext::new(&self.label, phase, results, env, &prefix);

        plog_debug!("{} phase {} started", self.label, phase);
        let outcome = AssertUnwindSafe(self.task.run_phase(phase, &mut ctx))
            .catch_unwind()
            .await;
        self.phase += 1;

        let (children, results) = ctx.into_parts();
        self.results = results;

        match outcome {
            Ok(Ok(())) => self.children = children,
            Ok(Err(e)) => self.fail(phase, e.to_string()),
            Err(payload) => self.fail(phase, format!("panicked: {}", panic_message(payload.as_ref()))),
        }

        let declared = self.task.phase_count();
        if self.failure.is_none() && declared != self.phase_count {
            self.fail(
                phase,
                format!(
                    "phase count changed from {} to {} while running",
                    self.phase_count, declared
                ),
            );
        }
    }

    fn fail(&mut self, phase: usize, message: String) {
        plog_error!("{} phase {} failed: {}", self.label, phase, message);
        self.children.clear();
        self.failure = Some(PhaseFailure {
            task: self.label.clone(),
            phase,
            message,
        });
    }

    pub fn into_resolved(self) -> Resolved {
        Resolved::new(self.id, self.label, self.task, self.failure)
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("phase", &self.phase)
            .field("phase_count", &self.phase_count)
            .field("children", &self.children.len())
            .field("results", &self.results.len())
            .field("outstanding", &self.outstanding)
            .field("parent", &self.parent)
            .field("failure", &self.failure)
            .finish()
    }
}
