//! Job submitter: the scheduler client used by the rest of the system.
//!
//! [`JobSubmitter`] wraps a [`BatchScheduler`] with bounded retries for
//! transient failures, translates native scheduler states into [`JobState`],
//! and implements the wait-for-completion loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobOutcome, JobScript, JobState, JobTimeline, SubmittedJob};
use crate::scheduler::{BatchScheduler, NativeStatus};

/// Retry behavior for scheduler calls that fail transiently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and initial delay.
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp))
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Polling discipline for [`JobSubmitter::wait`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Delay after the first poll.
    pub interval: Duration,
    /// Upper bound on the delay between polls.
    pub max_interval: Duration,
    /// Growth factor of the delay; 1.0 polls at a fixed interval.
    pub backoff: f64,
    /// Total wait budget.
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            backoff: 1.5,
            timeout: Duration::from_secs(3600),
        }
    }
}

impl WaitPolicy {
    /// Fixed-interval polling.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            timeout,
        }
    }

    /// Same policy with another timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff.max(1.0))
            .map_or(cap, |next| next.min(cap))
    }
}

/// Translate a native scheduler status into a [`JobState`].
///
/// Unrecognized states are failures, never pending.
pub fn translate(status: &NativeStatus) -> JobState {
    match status.state.as_str() {
        "PENDING" | "PD" | "CONFIGURING" | "CF" | "REQUEUED" | "RQ" | "RESIZING" | "SUSPENDED"
        | "S" => JobState::Pending,
        "RUNNING" | "R" | "COMPLETING" | "CG" | "STAGE_OUT" | "SO" => JobState::Running,
        "COMPLETED" | "CD" => match status.exit_code {
            None | Some(0) => JobState::Completed,
            Some(code) => JobState::Failed(format!("completed with exit code {code}")),
        },
        "FAILED" | "F" => JobState::Failed(match status.exit_code {
            Some(code) => format!("job failed with exit code {code}"),
            None => "job failed".to_string(),
        }),
        "NODE_FAIL" | "NF" => JobState::Failed("node failure".to_string()),
        "OUT_OF_MEMORY" | "OOM" => JobState::Failed("out of memory".to_string()),
        "BOOT_FAIL" | "BF" => JobState::Failed("node boot failure".to_string()),
        "TIMEOUT" | "TO" | "DEADLINE" | "DL" => JobState::TimedOut,
        "CANCELLED" | "CA" | "PREEMPTED" | "PR" | "REVOKED" | "RV" => JobState::Cancelled,
        other => JobState::Failed(format!("unrecognized scheduler state '{other}'")),
    }
}

/// Scheduler client with retries, state translation and waiting.
#[derive(Clone)]
pub struct JobSubmitter {
    scheduler: Arc<dyn BatchScheduler>,
    retry: RetryPolicy,
}

impl JobSubmitter {
    /// Create a submitter with the default retry policy.
    pub fn new(scheduler: Arc<dyn BatchScheduler>) -> Self {
        Self {
            scheduler,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<dyn BatchScheduler> {
        &self.scheduler
    }

    /// Submit a job script.
    pub async fn submit(&self, script: &JobScript) -> SchedResult<SubmittedJob> {
        let id = self
            .with_retries("submit", || self.scheduler.submit(script))
            .await?;
        info!(job_id = %id, backend = %script.backend, name = %script.name, "Job submitted");
        Ok(SubmittedJob::new(id, script, Utc::now()))
    }

    /// Query the native status of a job, retrying transient failures.
    pub async fn query(&self, id: &JobId) -> SchedResult<NativeStatus> {
        self.with_retries("query", || self.scheduler.query(id)).await
    }

    /// Current state of a job.
    pub async fn poll(&self, id: &JobId) -> SchedResult<JobState> {
        let status = self.query(id).await?;
        let state = translate(&status);
        if let JobState::Failed(reason) = &state {
            debug!(job_id = %id, native = %status.state, %reason, "Job failed");
        }
        Ok(state)
    }

    /// Wait for a job to reach a terminal state.
    ///
    /// Success and job failure both return `Ok`; running out of budget returns
    /// [`SchedError::WaitTimeout`] and leaves the job alone.
    pub async fn wait(&self, job: &SubmittedJob, policy: &WaitPolicy) -> SchedResult<JobOutcome> {
        let start = Instant::now();
        let mut timeline = JobTimeline::new(job.submitted_at);
        let mut interval = policy.interval;

        loop {
            let state = self.poll(&job.id).await?;

            if !state.is_pending() && timeline.started_at.is_none() {
                timeline.started_at = Some(Utc::now());
                debug!(job_id = %job.id, "Job started");
            }

            if state.is_terminal() {
                timeline.finished_at = Some(Utc::now());
                info!(job_id = %job.id, state = %state, "Job finished");
                return Ok(JobOutcome { state, timeline });
            }

            let elapsed = start.elapsed();
            if elapsed >= policy.timeout {
                warn!(job_id = %job.id, ?elapsed, "Wait budget exhausted, job left running");
                return Err(SchedError::WaitTimeout {
                    job_id: job.id.to_string(),
                    waited: elapsed,
                });
            }

            sleep(interval.min(policy.timeout - elapsed)).await;
            interval = policy.next_interval(interval);
        }
    }

    /// Request cancellation. A job that already finished is not an error.
    pub async fn cancel(&self, id: &JobId) -> SchedResult<()> {
        let result = self
            .with_retries("cancel", || async {
                match self.scheduler.cancel(id).await {
                    Err(SchedError::JobNotFound(_)) => {
                        debug!(job_id = %id, "Job already finished, nothing to cancel");
                        Ok(())
                    }
                    other => other,
                }
            })
            .await;
        if result.is_ok() {
            info!(job_id = %id, "Cancellation requested");
        }
        result
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, mut call: F) -> SchedResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.retry.max_retries => {
                    warn!(scheduler = self.scheduler.name(), operation, error = %e, "Giving up");
                    return Err(SchedError::SchedulerUnreachable {
                        attempts: attempt + 1,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        "Retrying {} (attempt {}/{}) after {:?}: {}",
                        operation, attempt, self.retry.max_retries, delay, e
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
