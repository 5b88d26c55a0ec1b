//! The Coordination Store (CS) — §3 (data model) and §4.1 (contract).

mod cs;
mod schema;
mod types;

pub use cs::{ClaimedTask, CoordinationStore};
pub use types::{
    AddTaskOutcome, CompletedTask, FileLock, LockAcquisition, LockConflict, ParsedTask, Run,
    RunStatus, Task, TaskCost, TaskStatus, Worker, WorkerRegistryEntry, WorkerStatus,
};
