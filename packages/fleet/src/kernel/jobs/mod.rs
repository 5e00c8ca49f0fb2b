//! Job scheduling and execution infrastructure.
//!
//! - [`PostgresJobQueue`] — database-backed queue with SKIP LOCKED claims
//! - [`WorkerRuntime`] — long-running service that polls and executes jobs
//! - [`JobExecutor`] — one claimed job from `running` to a terminal state
//! - [`HitlCoordinator`] — pause/resume around human-gated blockers
//! - [`Job`] — the job row model and its guarded transitions
//!
//! Business logic lives in handlers registered with [`HandlerRegistry`];
//! this module only provides the lifecycle around them.

pub mod errors;
pub mod events;
mod executor;
pub mod hitl;
mod job;
mod queue;
mod registry;
mod worker;
mod worker_record;

pub use errors::{classify, ErrorCode, ErrorPolicy, HandlerError};
pub use events::{JobEventRow, ProgressRecorder};
pub use executor::JobExecutor;
pub use hitl::{Blocker, BlockerType, HitlCoordinator, InterventionOutcome, PauseClock, RESUME_CHANNEL};
pub use job::{Job, JobStatus};
pub use queue::{EnqueueResult, JobQueue, PostgresJobQueue};
pub use registry::{HandlerRegistry, JobContext, JobHandler, JobOutcome, SharedHandlerRegistry};
pub use worker::{WorkerConfig, WorkerHandle, WorkerRuntime};
pub use worker_record::{WorkerRecord, WorkerStatus};
