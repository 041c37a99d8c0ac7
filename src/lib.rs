pub mod bench;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod process;
pub mod util;

pub use crate::core::{PhaseContext, PhaseFailure, PhaseFn, PhasedTask, Resolved, Task, TaskId};
pub use error::{Error, Result, ToolError};
pub use orchestration::{Scheduler, SchedulerEvent};
pub use process::{ExecutionResult, Invocation, MemoryLimit, ProcessExecutor, Timing};
