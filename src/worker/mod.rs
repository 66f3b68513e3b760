//! Job queue and worker pool.
//!
//! - `state`: job status machine (queued → processing → completed/failed)
//! - `queue`: `JobQueue` contract, in-memory implementation
//! - `worker`: one pipeline attempt per claimed item, with timeout and panic capture
//! - `pool`: N polling workers plus the result sweeper

pub mod pool;
pub mod queue;
pub mod state;
pub mod worker;

pub use pool::{join_background, spawn_result_sweeper, PoolConfig, WorkerPool};
pub use queue::{InMemoryQueue, JobQueue};
pub use state::{ClaimedJob, JobResult, JobStatus, WorkItem};
pub use worker::{AttemptOutcome, Worker, WorkerDeps};
