//! Result collection.
//!
//! Reads the artifacts a finished job left behind. Nothing here talks to the
//! scheduler: the caller hands over the job's terminal [`JobOutcome`].

use std::path::{Path, PathBuf};

use qmio_hal::{ExecutionMetrics, ResultPayload};
use qmio_sched::{JobOutcome, SubmittedJob};
use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::error::{RuntimeError, RuntimeResult};

/// Lines of the job's stderr log attached to failures.
const DEFAULT_TAIL_LINES: usize = 20;

/// Reads results and metrics artifacts of finished jobs.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    tail_lines: usize,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCollector {
    /// Create a collector.
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Number of stderr lines attached to job failures.
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    /// Parse the results and metrics of a successful run job.
    ///
    /// Metrics are best-effort: a missing or malformed metrics file yields
    /// the times observed while waiting. A shot total that differs from
    /// `expected_shots` is logged, not rejected.
    pub async fn collect(
        &self,
        job: &SubmittedJob,
        outcome: &JobOutcome,
        expected_shots: Option<u32>,
    ) -> RuntimeResult<(ResultPayload, ExecutionMetrics)> {
        let results_path = self.collect_artifact(job, outcome).await?;

        let bytes = fs::read(&results_path).await?;
        let raw = String::from_utf8(bytes).map_err(|e| RuntimeError::ResultParseError {
            path: results_path.clone(),
            reason: format!("results are not valid UTF-8: {}", e.utf8_error()),
            raw: String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })?;
        let payload =
            ResultPayload::from_str_json(&raw).map_err(|e| RuntimeError::ResultParseError {
                path: results_path.clone(),
                reason: e.to_string(),
                raw: raw.clone(),
            })?;

        if let Some(expected) = expected_shots {
            let total = payload.total_shots();
            if total != u64::from(expected) {
                warn!(
                    job_id = %job.id,
                    expected,
                    total,
                    "Shot total differs from the requested count"
                );
            }
        }

        let timeline = &outcome.timeline;
        let (queue, exec) = (timeline.queue_wait_secs(), timeline.execution_secs());
        let metrics = match job.outputs.as_ref().and_then(|o| o.metrics.as_deref()) {
            Some(path) => match read_json(path).await {
                Some(value) => ExecutionMetrics::from_json_or(value, queue, exec),
                None => {
                    warn!(job_id = %job.id, path = %path.display(), "No usable metrics file, using observed times");
                    ExecutionMetrics::observed(queue, exec)
                }
            },
            None => ExecutionMetrics::observed(queue, exec),
        };

        Ok((payload, metrics))
    }

    /// Path of the primary artifact of a successful job, checked to exist.
    pub async fn collect_artifact(
        &self,
        job: &SubmittedJob,
        outcome: &JobOutcome,
    ) -> RuntimeResult<PathBuf> {
        if !outcome.state.is_terminal() {
            return Err(RuntimeError::PreconditionFailed(format!(
                "job {} is still {}",
                job.id, outcome.state
            )));
        }

        if !outcome.state.is_success() {
            return Err(RuntimeError::JobFailed {
                job_id: job.id.clone(),
                reason: outcome.state.to_string(),
                stderr_tail: self.stderr_tail(&job.stderr).await,
            });
        }

        let outputs = job.outputs.as_ref().ok_or_else(|| {
            RuntimeError::PreconditionFailed(format!("job {} declares no artifacts", job.id))
        })?;

        if fs::metadata(&outputs.artifact).await.is_err() {
            return Err(RuntimeError::ResultFileMissing {
                job_id: job.id.clone(),
                path: outputs.artifact.clone(),
            });
        }
        Ok(outputs.artifact.clone())
    }

    async fn stderr_tail(&self, path: &Path) -> Option<String> {
        let content = fs::read_to_string(path).await.ok()?;
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(self.tail_lines);
        let tail = lines[start..].join("\n");
        if tail.trim().is_empty() { None } else { Some(tail) }
    }
}

async fn read_json(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&raw).ok()
}
