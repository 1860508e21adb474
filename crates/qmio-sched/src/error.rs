//! Error handling for the scheduler client.

use std::time::Duration;

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedError {
    /// The scheduler declined the job (quota, malformed script, partition unavailable).
    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    /// A scheduler command could not be run or produced unexpected output.
    #[error("Scheduler command failed: {command} - {message}")]
    SchedulerCommand { command: String, message: String },

    /// A scheduler client command is not installed.
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// The requested reservation does not exist or is not active.
    #[error("Invalid reservation: {0}")]
    InvalidReservation(String),

    /// The scheduler does not (yet) know the job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Retries were exhausted talking to the scheduler.
    #[error("Scheduler unreachable after {attempts} attempts: {last}")]
    SchedulerUnreachable { attempts: u32, last: String },

    /// The wait budget ran out while the job was still non-terminal.
    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    WaitTimeout { job_id: String, waited: Duration },

    /// Malformed `HH:MM:SS` time limit.
    #[error("Invalid time limit '{0}', expected HH:MM:SS")]
    InvalidTimeLimit(String),

    /// Local IO error, such as writing the batch script.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedError::SchedulerCommand { .. } | SchedError::JobNotFound(_)
        )
    }

    /// Remedy shown to the user next to the error, if one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SchedError::CommandNotFound(_) => Some(
                "Ensure the scheduler commands (sbatch, squeue, sacct, scancel) are installed and on your PATH.",
            ),
            SchedError::InvalidReservation(_) => Some(
                "Check for an active reservation with `scontrol show reservations`, or verify the reservation name.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::JobNotFound("123".to_string());
        assert_eq!(err.to_string(), "Job not found: 123");

        let err = SchedError::SchedulerCommand {
            command: "squeue".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Scheduler command failed: squeue - connection refused"
        );
    }

    #[test]
    fn test_transient() {
        assert!(SchedError::JobNotFound("1".into()).is_transient());
        assert!(!SchedError::SubmissionRejected("quota".into()).is_transient());
        assert!(
            !SchedError::WaitTimeout {
                job_id: "1".into(),
                waited: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!SchedError::CommandNotFound("sbatch".into()).is_transient());
        assert!(!SchedError::InvalidReservation("qpu_res".into()).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!SchedError::Io(denied).is_transient());
    }

    #[test]
    fn test_hints() {
        assert!(SchedError::CommandNotFound("sbatch".into()).hint().unwrap().contains("PATH"));
        assert!(
            SchedError::InvalidReservation("x".into())
                .hint()
                .unwrap()
                .contains("scontrol show reservations")
        );
        assert!(SchedError::SubmissionRejected("quota".into()).hint().is_none());
    }
}
