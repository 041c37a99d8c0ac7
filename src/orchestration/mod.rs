//! Orchestration layer.
//!
//! The scheduler drives the dynamic task tree; the worker pool runs phase
//! steps; the registry parks parents while their children run.

mod pool;
mod registry;
mod scheduler;

pub use pool::{WorkerEvent, WorkerId, WorkerPool};
pub use registry::WaitingRegistry;
pub use scheduler::{Scheduler, SchedulerEvent};
