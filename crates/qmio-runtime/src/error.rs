//! Error types for the runtime crate.

use std::fmt;
use std::path::PathBuf;

use qmio_hal::{Action, HalError, InputKind};
use qmio_sched::{JobId, SchedError};
use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by the runtime components.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No backend registered under this name.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// The backend does not implement the action.
    #[error("Backend {backend} does not support {action}")]
    UnsupportedAction { backend: String, action: Action },

    /// The action cannot consume this representation of the circuit.
    #[error("Backend {backend} cannot {action} a {input}")]
    UnsupportedInput {
        backend: String,
        action: Action,
        input: InputKind,
    },

    /// Request fields and executable signature disagree.
    #[error("Argument mismatch for {backend} {action}: {reason}")]
    ArgumentMismatch {
        backend: String,
        action: Action,
        reason: String,
    },

    /// Shot count must be positive.
    #[error("Invalid shot count: {0}")]
    InvalidShots(u32),

    /// The backend disallows compilation.
    #[error("Backend {0} does not support compilation")]
    CompilationUnsupported(String),

    /// A hardware backend was selected but no tunnel endpoint is configured.
    #[error("Backend {0} requires a tunnel endpoint (set QMIO_ENDPOINT)")]
    MissingEndpoint(String),

    /// The tunnel job did not come up.
    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    /// An operation was called in the wrong state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The job ran and failed.
    #[error("Job {job_id} failed: {reason}{}", stderr_suffix(.stderr_tail))]
    JobFailed {
        job_id: JobId,
        reason: String,
        stderr_tail: Option<String>,
    },

    /// The job looked successful but wrote no results artifact.
    #[error("Job {job_id} completed without writing {}", .path.display())]
    ResultFileMissing { job_id: JobId, path: PathBuf },

    /// The results artifact could not be parsed.
    #[error("Malformed results in {}: {reason}", .path.display())]
    ResultParseError {
        path: PathBuf,
        reason: String,
        raw: String,
    },

    /// Scheduler error.
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// HAL error.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(tail: &Option<String>) -> String {
    match tail {
        Some(tail) if !tail.trim().is_empty() => format!("\n--- stderr (tail) ---\n{}", tail.trim_end()),
        _ => String::new(),
    }
}

/// Coarse classification of a failure, for callers that branch on cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad request or configuration; nothing was submitted.
    Configuration,
    /// The scheduler declined the job.
    SubmissionRejected,
    /// The scheduler could not be reached after retries.
    SchedulerUnreachable,
    /// The wait budget ran out; the job may still be running.
    WaitTimeout,
    /// The job failed or produced no usable results.
    JobFailed,
    /// The tunnel to the hardware could not be opened.
    TunnelUnavailable,
    /// Anything else.
    Internal,
}

impl RuntimeError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Config(_)
            | RuntimeError::UnknownBackend(_)
            | RuntimeError::UnsupportedAction { .. }
            | RuntimeError::UnsupportedInput { .. }
            | RuntimeError::ArgumentMismatch { .. }
            | RuntimeError::InvalidShots(_)
            | RuntimeError::CompilationUnsupported(_)
            | RuntimeError::MissingEndpoint(_) => ErrorKind::Configuration,
            RuntimeError::TunnelUnavailable(_) => ErrorKind::TunnelUnavailable,
            RuntimeError::JobFailed { .. }
            | RuntimeError::ResultFileMissing { .. }
            | RuntimeError::ResultParseError { .. } => ErrorKind::JobFailed,
            RuntimeError::Sched(e) => match e {
                SchedError::SubmissionRejected(_) | SchedError::InvalidReservation(_) => {
                    ErrorKind::SubmissionRejected
                }
                SchedError::CommandNotFound(_) => ErrorKind::Configuration,
                SchedError::SchedulerUnreachable { .. }
                | SchedError::SchedulerCommand { .. }
                | SchedError::JobNotFound(_) => ErrorKind::SchedulerUnreachable,
                SchedError::WaitTimeout { .. } => ErrorKind::WaitTimeout,
                SchedError::InvalidTimeLimit(_) => ErrorKind::Configuration,
                SchedError::Io(_) | SchedError::Json(_) => ErrorKind::Internal,
            },
            RuntimeError::Hal(HalError::UnknownBackend(_) | HalError::InvalidDescriptor { .. }) => {
                ErrorKind::Configuration
            }
            RuntimeError::Hal(_) | RuntimeError::PreconditionFailed(_) | RuntimeError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Remedy to show next to the error, if one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RuntimeError::Sched(e) => e.hint(),
            RuntimeError::MissingEndpoint(_) => {
                Some("Set QMIO_ENDPOINT or tunnel.endpoint to the hardware address (tcp://host:port).")
            }
            _ => None,
        }
    }
}

/// Stage of a request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Validating the request and building the job script.
    Build,
    /// Opening the tunnel to the hardware.
    TunnelOpening,
    /// Handing the job to the scheduler.
    Submitted,
    /// Waiting for the job to finish.
    Waiting,
    /// Reading the job's artifacts.
    Collecting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::TunnelOpening => "tunnel opening",
            Stage::Submitted => "submission",
            Stage::Waiting => "waiting",
            Stage::Collecting => "collecting",
        };
        f.write_str(name)
    }
}

/// The single error returned by [`QmioRuntime`](crate::QmioRuntime) operations.
#[derive(Debug, Error)]
#[error("{step} failed at {stage}: {source}")]
pub struct RunCommandError {
    /// Which job of the request failed.
    pub step: Action,
    /// Where in the lifecycle it failed.
    pub stage: Stage,
    /// Scheduler id of the job involved, if one was submitted.
    pub job_id: Option<JobId>,
    /// Underlying cause.
    #[source]
    pub source: RuntimeError,
}

impl RunCommandError {
    /// Wrap a cause.
    pub fn new(step: Action, stage: Stage, source: impl Into<RuntimeError>) -> Self {
        Self {
            step,
            stage,
            job_id: None,
            source: source.into(),
        }
    }

    /// Attach the job id.
    pub fn with_job(mut self, id: &JobId) -> Self {
        self.job_id = Some(id.clone());
        self
    }

    /// Classify the cause.
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// Remedy for the cause, if one is known.
    pub fn hint(&self) -> Option<&'static str> {
        self.source.hint()
    }
}
