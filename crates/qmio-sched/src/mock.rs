//! In-process scheduler for tests and dry runs.
//!
//! [`MockScheduler`] walks every submitted job through a poll-driven
//! lifecycle: a number of `PENDING` answers, a number of `RUNNING` answers,
//! then a final native status. Nothing happens between polls, so tests stay
//! deterministic regardless of wall-clock time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobScript};
use crate::scheduler::{BatchScheduler, NativeStatus};

/// Emulates a job's command. Returns the exit code.
pub type Executor = Arc<dyn Fn(&JobScript) -> i32 + Send + Sync>;

/// Poll-driven lifecycle of a mock job.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    /// Number of queries answered `PENDING`.
    pub pending_polls: u32,
    /// Number of queries answered `RUNNING` after the pending ones.
    pub running_polls: u32,
    /// Status reported from then on.
    pub final_status: NativeStatus,
}

impl Lifecycle {
    /// Pending then running for the given number of polls, then `COMPLETED`.
    pub fn completes_after(pending_polls: u32, running_polls: u32) -> Self {
        Self {
            pending_polls,
            running_polls,
            final_status: NativeStatus::new("COMPLETED").with_exit_code(0),
        }
    }

    /// Ends in the given native state instead.
    pub fn ending_in(mut self, status: NativeStatus) -> Self {
        self.final_status = status;
        self
    }

    /// Starts after `pending_polls` and never finishes on its own.
    pub fn runs_forever(pending_polls: u32) -> Self {
        Self::completes_after(pending_polls, u32::MAX)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::completes_after(1, 1)
    }
}

struct MockJob {
    script: JobScript,
    lifecycle: Lifecycle,
    polls: u32,
    cancelled: bool,
    outcome: Option<NativeStatus>,
}

#[derive(Default)]
struct MockState {
    jobs: FxHashMap<JobId, MockJob>,
    lifecycles: Vec<(String, Lifecycle)>,
    default_lifecycle: Lifecycle,
    executor: Option<Executor>,
    reject: Option<String>,
    failing_submits: u32,
    failing_queries: u32,
    submitted: Vec<JobScript>,
}

/// In-process [`BatchScheduler`].
pub struct MockScheduler {
    state: Mutex<MockState>,
    node: String,
    next_id: AtomicU64,
    submits: AtomicUsize,
    queries: AtomicUsize,
    cancels: AtomicUsize,
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScheduler {
    /// Create a mock scheduler; jobs complete after one pending and one running poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            node: "mock-node-01".to_string(),
            next_id: AtomicU64::new(1000),
            submits: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Node reported for running jobs.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Lifecycle for jobs not matched by a name prefix.
    pub async fn set_default_lifecycle(&self, lifecycle: Lifecycle) {
        self.state.lock().await.default_lifecycle = lifecycle;
    }

    /// Lifecycle for jobs whose name starts with `prefix`.
    pub async fn set_lifecycle_for(&self, prefix: impl Into<String>, lifecycle: Lifecycle) {
        self.state
            .lock()
            .await
            .lifecycles
            .push((prefix.into(), lifecycle));
    }

    /// Emulate job commands with `executor` when jobs finish.
    pub async fn set_executor<F>(&self, executor: F)
    where
        F: Fn(&JobScript) -> i32 + Send + Sync + 'static,
    {
        self.state.lock().await.executor = Some(Arc::new(executor));
    }

    /// Reject every following submission.
    pub async fn reject_submissions(&self, reason: impl Into<String>) {
        self.state.lock().await.reject = Some(reason.into());
    }

    /// Fail the next `n` submissions as if `sbatch` could not be run.
    pub async fn fail_next_submits(&self, n: u32) {
        self.state.lock().await.failing_submits = n;
    }

    /// Fail the next `n` queries as if the scheduler were unreachable.
    pub async fn fail_next_queries(&self, n: u32) {
        self.state.lock().await.failing_queries = n;
    }

    /// Force the final status of a job, as if it died.
    pub async fn finish(&self, id: &JobId, status: NativeStatus) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(id) {
            job.outcome = Some(status);
        }
    }

    /// Scripts submitted so far, in order.
    pub async fn submitted_scripts(&self) -> Vec<JobScript> {
        self.state.lock().await.submitted.clone()
    }

    /// Whether `cancel` reached the job before it finished.
    pub async fn is_cancelled(&self, id: &JobId) -> bool {
        self.state
            .lock()
            .await
            .jobs
            .get(id)
            .is_some_and(|j| j.cancelled)
    }

    /// Number of `submit` calls.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of `query` calls.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `cancel` calls.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Total scheduler calls of any kind.
    pub fn calls(&self) -> usize {
        self.submit_count() + self.query_count() + self.cancel_count()
    }
}

impl MockState {
    fn lifecycle_for(&self, name: &str) -> Lifecycle {
        self.lifecycles
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, l)| l.clone())
            .unwrap_or_else(|| self.default_lifecycle.clone())
    }
}

#[async_trait]
impl BatchScheduler for MockScheduler {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, script: &JobScript) -> SchedResult<JobId> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(SchedError::SchedulerCommand {
                command: "sbatch".to_string(),
                message: "Unable to contact slurm controller".to_string(),
            });
        }
        if let Some(reason) = &state.reject {
            return Err(SchedError::SubmissionRejected(reason.clone()));
        }

        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        let lifecycle = state.lifecycle_for(&script.name);
        state.submitted.push(script.clone());
        state.jobs.insert(
            id.clone(),
            MockJob {
                script: script.clone(),
                lifecycle,
                polls: 0,
                cancelled: false,
                outcome: None,
            },
        );
        debug!(job_id = %id, name = %script.name, "Mock job submitted");
        Ok(id)
    }

    async fn query(&self, id: &JobId) -> SchedResult<NativeStatus> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(SchedError::SchedulerCommand {
                command: "squeue".to_string(),
                message: "Socket timed out on send/recv operation".to_string(),
            });
        }

        let executor = state.executor.clone();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;

        if let Some(outcome) = &job.outcome {
            return Ok(outcome.clone());
        }

        job.polls = job.polls.saturating_add(1);
        let lifecycle = &job.lifecycle;
        if job.polls <= lifecycle.pending_polls {
            return Ok(NativeStatus::new("PENDING").with_reason("Resources"));
        }
        if job.polls - lifecycle.pending_polls <= lifecycle.running_polls {
            return Ok(NativeStatus::new("RUNNING").with_node(&self.node));
        }

        let mut outcome = lifecycle.final_status.clone();
        if outcome.state == "COMPLETED" {
            if let Some(executor) = executor {
                let code = executor(&job.script);
                if code != 0 {
                    outcome = NativeStatus::new("FAILED").with_exit_code(code);
                }
            }
        }
        job.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    async fn cancel(&self, id: &JobId) -> SchedResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;
        if job.outcome.is_some() {
            return Err(SchedError::JobNotFound(
                "Job not found or already completed".to_string(),
            ));
        }
        job.cancelled = true;
        job.outcome = Some(NativeStatus::new("CANCELLED").with_exit_code(0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CommandLine, ResourceRequest};
    use std::time::Duration;

    fn script(name: &str) -> JobScript {
        JobScript::new(
            name,
            "sim",
            ResourceRequest::new("short", Duration::from_secs(60)),
            CommandLine::new("/bin/true", vec![]),
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mock = MockScheduler::new();
        let id = mock.submit(&script("job")).await.unwrap();

        assert_eq!(mock.query(&id).await.unwrap().state, "PENDING");
        let running = mock.query(&id).await.unwrap();
        assert_eq!(running.state, "RUNNING");
        assert_eq!(running.node.as_deref(), Some("mock-node-01"));
        let done = mock.query(&id).await.unwrap();
        assert_eq!(done.state, "COMPLETED");
        assert_eq!(mock.query(&id).await.unwrap(), done);
        assert_eq!(mock.calls(), 5);
    }

    #[tokio::test]
    async fn test_executor_exit_code() {
        let mock = MockScheduler::new();
        mock.set_default_lifecycle(Lifecycle::completes_after(0, 0)).await;
        mock.set_executor(|_| 3).await;
        let id = mock.submit(&script("job")).await.unwrap();

        let status = mock.query(&id).await.unwrap();
        assert_eq!(status.state, "FAILED");
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_prefix_lifecycle_and_cancel() {
        let mock = MockScheduler::new();
        mock.set_lifecycle_for("tunnel", Lifecycle::runs_forever(0)).await;
        let id = mock.submit(&script("tunnel-612")).await.unwrap();

        for _ in 0..10 {
            assert_eq!(mock.query(&id).await.unwrap().state, "RUNNING");
        }
        mock.cancel(&id).await.unwrap();
        assert!(mock.is_cancelled(&id).await);
        assert_eq!(mock.query(&id).await.unwrap().state, "CANCELLED");
        assert!(mock.cancel(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mock = MockScheduler::new();
        mock.fail_next_queries(1).await;
        let id = mock.submit(&script("job")).await.unwrap();
        assert!(mock.query(&id).await.unwrap_err().is_transient());
        assert!(mock.query(&id).await.is_ok());

        mock.reject_submissions("QOSMaxSubmitJobPerUserLimit").await;
        let err = mock.submit(&script("job")).await.unwrap_err();
        assert!(matches!(err, SchedError::SubmissionRejected(_)));
        assert_eq!(mock.submitted_scripts().await.len(), 1);
    }
}
