//! Core task model.
//!
//! Tasks declare their phases, the node wraps a task with the state the
//! scheduler needs between phases, and the context is what a running phase
//! gets to work with.

pub mod context;
pub mod node;
pub mod task;
pub mod temp;

pub use context::{PhaseContext, Resolved, WorkerEnv};
pub use node::{TaskNode, Token};
pub use task::{PhaseFailure, PhaseFn, PhasedTask, Task, TaskId};
pub use temp::TempNamespace;
