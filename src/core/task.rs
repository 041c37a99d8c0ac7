//! Task model for the phase scheduler.
//!
//! A task is a fixed, gap-free list of phase operations. Each dispatch runs
//! exactly one phase; a phase may spawn children through its
//! `PhaseContext`, in which case the task waits until every child has
//! resolved before its next phase runs.

use std::any::Any;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::context::PhaseContext;
use crate::error::{Error, Result};

/// Unique identifier for a task instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One phase operation of a task of type `T`.
///
/// Phases are plain functions so that a task type's whole phase list can
/// be declared as a constant:
///
/// ```ignore
/// impl PhasedTask for Case {
///     const PHASES: &'static [PhaseFn<Self>] = &[Case::prepare, Case::collect];
///     fn label(&self) -> String { self.name.clone() }
/// }
///
/// impl Case {
///     fn prepare<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
///         Box::pin(async move { /* ... */ Ok(()) })
///     }
/// }
/// ```
pub type PhaseFn<T> = for<'a> fn(&'a mut T, &'a mut PhaseContext) -> BoxFuture<'a, Result<()>>;

/// A task type with a statically declared phase list.
pub trait PhasedTask: Send + Sized + 'static {
    /// Phase operations, run in order, one per dispatch.
    const PHASES: &'static [PhaseFn<Self>];

    /// Human-readable name used in logs and results.
    fn label(&self) -> String;

    /// Prefix for the task's private temp files. Defaults to the label.
    fn temp_prefix(&self) -> String {
        self.label()
    }
}

/// Object-safe view of a task, as stored and moved around by the scheduler.
///
/// Every `PhasedTask` is a `Task`; implement this trait by hand only when
/// the phase list is not known at compile time.
pub trait Task: Send + 'static {
    fn label(&self) -> String;

    fn temp_prefix(&self) -> String;

    fn phase_count(&self) -> usize;

    /// Run phase `phase`.
    ///
    /// # Errors
    ///
    /// `Error::ContractViolation` if `phase` is not a declared phase, or
    /// whatever the phase itself returns.
    fn run_phase<'a>(
        &'a mut self,
        phase: usize,
        ctx: &'a mut PhaseContext,
    ) -> BoxFuture<'a, Result<()>>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: PhasedTask> Task for T {
    fn label(&self) -> String {
        PhasedTask::label(self)
    }

    fn temp_prefix(&self) -> String {
        PhasedTask::temp_prefix(self)
    }

    fn phase_count(&self) -> usize {
        T::PHASES.len()
    }

    fn run_phase<'a>(
        &'a mut self,
        phase: usize,
        ctx: &'a mut PhaseContext,
    ) -> BoxFuture<'a, Result<()>> {
        match T::PHASES.get(phase) {
            Some(op) => op(self, ctx),
            None => {
                let err = Error::ContractViolation(format!(
                    "{} has {} phases, phase {} requested",
                    PhasedTask::label(self),
                    T::PHASES.len(),
                    phase
                ));
                Box::pin(futures::future::ready(Err(err)))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Why a task stopped before running all of its phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    /// Label of the task that failed.
    pub task: String,
    /// Index of the phase that failed.
    pub phase: usize,
    /// Error or panic message.
    pub message: String,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase {} of {} failed: {}", self.phase, self.task, self.message)
    }
}

impl From<PhaseFailure> for Error {
    fn from(failure: PhaseFailure) -> Self {
        Error::PhaseFailed {
            task: failure.task,
            phase: failure.phase,
            message: failure.message,
        }
    }
}
