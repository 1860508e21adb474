//! Batch scheduler interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SchedResult;
use crate::job::{JobId, JobScript};

/// Job status exactly as the scheduler reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeStatus {
    /// Native state string (e.g. `PENDING`, `COMPLETED`).
    pub state: String,
    /// Exit code, once known.
    pub exit_code: Option<i32>,
    /// Reason for the current state (e.g. `Resources` while pending).
    pub reason: Option<String>,
    /// Node the job runs on, once allocated.
    pub node: Option<String>,
}

impl NativeStatus {
    /// Status with only a state string.
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            exit_code: None,
            reason: None,
            node: None,
        }
    }

    /// Set the exit code.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Set the allocated node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Set the state reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Raw operations of a cluster batch scheduler.
///
/// Implementations report native state strings; translating them into
/// [`JobState`](crate::JobState) is the job of [`JobSubmitter`](crate::JobSubmitter).
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Scheduler name, for logging.
    fn name(&self) -> &str;

    /// Submit a job and return its id.
    async fn submit(&self, script: &JobScript) -> SchedResult<JobId>;

    /// Query the native status of a job.
    async fn query(&self, id: &JobId) -> SchedResult<NativeStatus>;

    /// Request cancellation of a job.
    async fn cancel(&self, id: &JobId) -> SchedResult<()>;
}
