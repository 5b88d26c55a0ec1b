//! `coordination` — the shared library behind the parallel task swarm
//! orchestrator: the Coordination Store, the Devplan Analyzer, the worker
//! runtime, the scheduler, and the merge/artifact extractor.
//!
//! Binaries (`swarm-worker`, `swarmctl`) are thin entry points over what's
//! exposed here.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod devplan;
pub mod error;
pub mod hash;
pub mod merge;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::{OutputMode, SwarmConfig};
pub use error::{CoordError, CoordResult};
pub use merge::{MergeReport, Merger, WorkerMergeReport};
pub use scheduler::{emergency_stop, run_scheduler_loop, SchedulerOutcome};
pub use store::{
    AddTaskOutcome, ClaimedTask, CompletedTask, CoordinationStore, FileLock, LockAcquisition,
    LockConflict, ParsedTask, Run, RunStatus, Task, TaskCost, TaskStatus, Worker,
    WorkerRegistryEntry, WorkerStatus,
};
pub use worker::agent::{AgentOutcome, AgentRunner, ProcessAgentRunner};
pub use worker::{run_worker_loop, WorkerLoopOutcome};
