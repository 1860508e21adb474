//! Qmio Batch Scheduler Client
//!
//! Submits backend jobs to a cluster batch scheduler, tracks their state and
//! waits for completion.
//!
//! # Overview
//!
//! 1. **Describe**: a [`JobScript`] carries the resource request, command
//!    line, environment and expected artifacts of one job
//! 2. **Submit**: [`JobSubmitter::submit`] hands it to a [`BatchScheduler`]
//! 3. **Track**: [`JobSubmitter::poll`] translates native states into [`JobState`]
//! 4. **Wait**: [`JobSubmitter::wait`] polls with backoff until the job is
//!    terminal or the [`WaitPolicy`] budget runs out
//!
//! # Schedulers
//!
//! | Scheduler | Commands | Use |
//! |-----------|----------|-----|
//! | [`SlurmAdapter`] | sbatch, squeue, sacct, scancel | Production |
//! | [`MockScheduler`] | none | Tests and dry runs |
//!
//! Transient failures (the scheduler controller not answering, a job briefly
//! unknown to accounting) are retried per [`RetryPolicy`] before surfacing as
//! [`SchedError::SchedulerUnreachable`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use qmio_sched::{JobSubmitter, SlurmAdapter, SlurmConfig, WaitPolicy};
//!
//! let slurm = SlurmAdapter::new(SlurmConfig::default()).await?;
//! let submitter = JobSubmitter::new(Arc::new(slurm));
//!
//! let job = submitter.submit(&script).await?;
//! let outcome = submitter.wait(&job, &WaitPolicy::default()).await?;
//! println!("{} finished: {}", job.id, outcome.state);
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod mock;
pub mod scheduler;
pub mod slurm;

pub use client::{JobSubmitter, RetryPolicy, WaitPolicy, translate};
pub use error::{SchedError, SchedResult};
pub use job::{
    CommandLine, ExpectedOutputs, JobId, JobOutcome, JobScript, JobState, JobTimeline,
    ResourceRequest, SubmittedJob, format_time_limit, parse_time_limit,
};
pub use mock::{Executor, Lifecycle, MockScheduler};
pub use scheduler::{BatchScheduler, NativeStatus};
pub use slurm::{SlurmAdapter, SlurmConfig};
