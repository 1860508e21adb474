//! Parsers for SLURM command output.

use crate::error::{SchedError, SchedResult};
use crate::job::JobId;
use crate::scheduler::NativeStatus;

/// Parse sbatch output to extract job ID.
///
/// sbatch output format: "Submitted batch job 12345"
pub fn parse_sbatch_output(output: &str) -> SchedResult<JobId> {
    let trimmed = output.trim();

    if let Some(rest) = trimmed.strip_prefix("Submitted batch job ") {
        // Federated clusters append "on cluster <name>"
        let job_id = rest.split_whitespace().next().unwrap_or_default();
        if !job_id.is_empty() && job_id.chars().all(|c| c.is_ascii_digit()) {
            return Ok(JobId::new(job_id));
        }
    }

    Err(SchedError::SubmissionRejected(format!(
        "unexpected sbatch output: {trimmed}"
    )))
}

/// Classify a failed sbatch run from its exit code and stderr.
pub fn parse_sbatch_failure(code: Option<i32>, stderr: &str) -> SchedError {
    let stderr = stderr.trim();
    if code == Some(127) {
        return SchedError::CommandNotFound("sbatch".to_string());
    }
    if stderr.to_ascii_lowercase().contains("reservation is invalid") {
        return SchedError::InvalidReservation(stderr.to_string());
    }
    SchedError::SubmissionRejected(stderr.to_string())
}

/// Parse squeue output to extract job information.
///
/// Expected format (from `squeue -h -j <id> -o "%i|%j|%T|%r|%N"`):
/// 12345|job_name|RUNNING|None|c7-3
pub fn parse_squeue_output(output: &str) -> SchedResult<Option<NativeStatus>> {
    let Some(data_line) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };

    let parts: Vec<&str> = data_line.split('|').collect();
    if parts.len() < 4 {
        return Err(SchedError::SchedulerCommand {
            command: "squeue".to_string(),
            message: format!("Unexpected output format: {data_line}"),
        });
    }

    let mut status = NativeStatus::new(normalize_state(parts[2]));
    status.reason = non_empty(parts[3]).filter(|r| r != "None");
    status.node = parts.get(4).and_then(|n| non_empty(n));

    Ok(Some(status))
}

/// Parse sacct output for completed job information.
///
/// Expected format (from `sacct -j <id> -o JobID,JobName,State,ExitCode -P -n`):
/// 12345|job_name|COMPLETED|0:0
/// 12345.batch|batch|COMPLETED|0:0
pub fn parse_sacct_output(output: &str) -> Option<NativeStatus> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            continue;
        }

        // Skip job steps (e.g., "12345.batch", "12345.extern")
        if parts[0].trim().contains('.') {
            continue;
        }

        let mut status = NativeStatus::new(normalize_state(parts[2]));
        status.exit_code = parse_exit_code(parts[3].trim());
        return Some(status);
    }

    None
}

/// Parse scancel stderr to verify cancellation.
pub fn parse_scancel_output(stderr: &str) -> SchedResult<()> {
    let stderr = stderr.trim();

    if stderr.contains("Invalid job id") || stderr.contains("does not exist") {
        return Err(SchedError::JobNotFound(
            "Job not found or already completed".to_string(),
        ));
    }

    if !stderr.is_empty() && !stderr.contains("already completing") {
        return Err(SchedError::SchedulerCommand {
            command: "scancel".to_string(),
            message: stderr.to_string(),
        });
    }

    Ok(())
}

/// Upper-case state without qualifiers ("CANCELLED by 1001" -> "CANCELLED").
fn normalize_state(state: &str) -> String {
    state
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_uppercase()
}

/// Parse exit code from SLURM format "exit_code:signal".
fn parse_exit_code(code: &str) -> Option<i32> {
    code.split(':').next().and_then(|s| s.parse().ok())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty() && s != "(null)").then(|| s.to_string())
}
