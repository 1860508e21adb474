//! Job types for the scheduler client.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Scheduler-assigned job identifier. Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a job ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, not yet started.
    Pending,
    /// Executing on a compute node.
    Running,
    /// Finished with exit status 0.
    Completed,
    /// Finished unsuccessfully.
    Failed(String),
    /// Killed by the scheduler at its wall-clock limit.
    TimedOut,
    /// Cancelled by a user or the scheduler.
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Check if the job finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Completed)
    }

    /// Check if the job has not started yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending)
    }

    /// Short state name.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
            JobState::TimedOut => "timed-out",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Resources requested for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Partition to submit to.
    pub partition: String,
    /// Number of nodes.
    pub nodes: u32,
    /// Tasks per node.
    pub tasks_per_node: u32,
    /// CPUs per task.
    pub cpus_per_task: u32,
    /// Wall-clock limit.
    pub time_limit: Duration,
    /// Memory per node in MB.
    pub memory_mb: Option<u32>,
    /// Account for billing.
    pub account: Option<String>,
    /// Reservation to run inside.
    pub reservation: Option<String>,
}

impl ResourceRequest {
    /// Single task on one node of `partition`.
    pub fn new(partition: impl Into<String>, time_limit: Duration) -> Self {
        Self {
            partition: partition.into(),
            nodes: 1,
            tasks_per_node: 1,
            cpus_per_task: 1,
            time_limit,
            memory_mb: None,
            account: None,
            reservation: None,
        }
    }
}

/// Program and positional arguments run by the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    /// Executable path.
    pub program: PathBuf,
    /// Positional arguments, in order.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Create a command line.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Artifacts the job's executable is expected to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedOutputs {
    /// Primary artifact (results or instructions).
    pub artifact: PathBuf,
    /// Metrics artifact, for run jobs.
    pub metrics: Option<PathBuf>,
}

/// Scheduler-neutral description of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScript {
    /// Job name.
    pub name: String,
    /// Label of the backend the job targets.
    pub backend: String,
    /// Resource request.
    pub resources: ResourceRequest,
    /// Command executed by the job.
    pub command: CommandLine,
    /// Environment exported before the command runs.
    pub env: Vec<(String, String)>,
    /// Artifacts the command writes, if any.
    pub outputs: Option<ExpectedOutputs>,
    /// Directory for the scheduler's stdout/stderr logs.
    pub log_dir: PathBuf,
}

impl JobScript {
    /// Create a script with no environment and no expected outputs.
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        resources: ResourceRequest,
        command: CommandLine,
    ) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            resources,
            command,
            env: Vec::new(),
            outputs: None,
            log_dir: PathBuf::from("."),
        }
    }

    /// Export a variable to the job.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Declare expected artifacts.
    pub fn with_outputs(mut self, outputs: ExpectedOutputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Set the log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Stdout log pattern; `%j` is replaced by the scheduler with the job id.
    pub fn stdout_pattern(&self) -> PathBuf {
        self.log_dir.join(format!("{}-%j.out", self.name))
    }

    /// Stderr log pattern.
    pub fn stderr_pattern(&self) -> PathBuf {
        self.log_dir.join(format!("{}-%j.err", self.name))
    }

    /// Value of an exported variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A job accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    /// Scheduler-assigned id.
    pub id: JobId,
    /// Job name.
    pub name: String,
    /// Backend label.
    pub backend: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Expected artifacts.
    pub outputs: Option<ExpectedOutputs>,
    /// Stdout log path.
    pub stdout: PathBuf,
    /// Stderr log path.
    pub stderr: PathBuf,
}

impl SubmittedJob {
    /// Record a job accepted for `script`.
    pub fn new(id: JobId, script: &JobScript, submitted_at: DateTime<Utc>) -> Self {
        let stdout = expand_job_id(&script.stdout_pattern(), &id);
        let stderr = expand_job_id(&script.stderr_pattern(), &id);
        Self {
            id,
            name: script.name.clone(),
            backend: script.backend.clone(),
            submitted_at,
            outputs: script.outputs.clone(),
            stdout,
            stderr,
        }
    }
}

fn expand_job_id(pattern: &Path, id: &JobId) -> PathBuf {
    PathBuf::from(pattern.to_string_lossy().replace("%j", id.as_str()))
}

/// Observed timestamps of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeline {
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// First poll that saw the job running (or finished).
    pub started_at: Option<DateTime<Utc>>,
    /// First poll that saw a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobTimeline {
    /// Timeline with only the submit time.
    pub fn new(submitted_at: DateTime<Utc>) -> Self {
        Self {
            submitted_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Observed seconds between submission and start.
    pub fn queue_wait_secs(&self) -> f64 {
        self.started_at
            .map(|s| seconds_between(self.submitted_at, s))
            .unwrap_or(0.0)
    }

    /// Observed seconds between start and finish.
    pub fn execution_secs(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => seconds_between(s, f),
            _ => 0.0,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Terminal state of a job and when it was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Terminal state.
    pub state: JobState,
    /// Observed timestamps.
    pub timeline: JobTimeline,
}

/// Parse a `HH:MM:SS` (or `D-HH:MM:SS`) time limit.
pub fn parse_time_limit(s: &str) -> SchedResult<Duration> {
    let invalid = || SchedError::InvalidTimeLimit(s.to_string());
    let (days, rest) = match s.trim().split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, rest),
        None => (0, s.trim()),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let mut fields = [0u64; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        *field = part.parse().map_err(|_| invalid())?;
    }
    let [hours, minutes, seconds] = fields;
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    days.checked_mul(86_400)
        .and_then(|d| hours.checked_mul(3600).and_then(|h| d.checked_add(h)))
        .and_then(|t| t.checked_add(minutes * 60 + seconds))
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Format a duration as a scheduler time limit (`D-HH:MM:SS` or `HH:MM:SS`).
pub fn format_time_limit(limit: Duration) -> String {
    let total = limit.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed("x".into()).is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());

        assert!(JobState::Completed.is_success());
        assert!(!JobState::Failed("x".into()).is_success());
        assert_eq!(JobState::Failed("OOM".into()).to_string(), "failed: OOM");
    }

    #[test]
    fn test_parse_time_limit() {
        assert_eq!(parse_time_limit("00:10:00").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_time_limit("02:00:30").unwrap(), Duration::from_secs(7230));
        assert_eq!(
            parse_time_limit("1-00:00:00").unwrap(),
            Duration::from_secs(86_400)
        );
        assert!(parse_time_limit("10:00").is_err());
        assert!(parse_time_limit("aa:bb:cc").is_err());
        assert!(parse_time_limit("00:61:00").is_err());
        assert!(parse_time_limit("99999999999999999-00:00:00").is_err());
        assert!(parse_time_limit("18446744073709551615:00:00").is_err());
    }

    #[test]
    fn test_format_time_limit() {
        assert_eq!(format_time_limit(Duration::from_secs(30 * 60)), "00:30:00");
        assert_eq!(format_time_limit(Duration::from_secs(5400)), "01:30:00");
        assert_eq!(format_time_limit(Duration::from_secs(2 * 86_400)), "2-00:00:00");
        assert_eq!(format_time_limit(Duration::from_secs(45)), "00:00:45");
    }

    #[test]
    fn test_submitted_job_log_paths() {
        let script = JobScript::new(
            "qmio-run",
            "sim",
            ResourceRequest::new("short", Duration::from_secs(60)),
            CommandLine::new("/opt/run.sh", vec![]),
        )
        .with_log_dir("/scratch/logs");

        let job = SubmittedJob::new(JobId::new("4242"), &script, Utc::now());
        assert_eq!(job.stdout, PathBuf::from("/scratch/logs/qmio-run-4242.out"));
        assert_eq!(job.stderr, PathBuf::from("/scratch/logs/qmio-run-4242.err"));
    }

    #[test]
    fn test_timeline() {
        let t0 = Utc::now();
        let mut timeline = JobTimeline::new(t0);
        assert_eq!(timeline.queue_wait_secs(), 0.0);
        timeline.started_at = Some(t0 + chrono::Duration::seconds(3));
        timeline.finished_at = Some(t0 + chrono::Duration::seconds(10));
        assert_eq!(timeline.queue_wait_secs(), 3.0);
        assert_eq!(timeline.execution_secs(), 7.0);
    }
}
