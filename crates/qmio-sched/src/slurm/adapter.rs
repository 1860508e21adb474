//! SLURM adapter for job submission and tracking.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobScript};
use crate::scheduler::{BatchScheduler, NativeStatus};
use crate::slurm::parser;
use crate::slurm::templates;

/// Configuration for the SLURM adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmConfig {
    /// Directory the rendered batch scripts are written to.
    pub script_dir: PathBuf,

    /// Modules to load before running.
    #[serde(default)]
    pub modules: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from(".qmio/scripts"),
            modules: Vec::new(),
        }
    }
}

/// Adapter for the SLURM batch scheduler.
pub struct SlurmAdapter {
    config: SlurmConfig,
    script_counter: AtomicU64,
}

impl SlurmAdapter {
    /// Create a new SLURM adapter with the given configuration.
    pub async fn new(config: SlurmConfig) -> SchedResult<Self> {
        fs::create_dir_all(&config.script_dir).await?;

        Ok(Self {
            config,
            script_counter: AtomicU64::new(0),
        })
    }

    /// Adapter configuration.
    pub fn config(&self) -> &SlurmConfig {
        &self.config
    }

    fn script_path(&self, job: &JobScript) -> PathBuf {
        let n = self.script_counter.fetch_add(1, Ordering::Relaxed);
        self.config.script_dir.join(format!(
            "{}-{}-{n}.sh",
            templates::sanitize_name(&job.name),
            std::process::id()
        ))
    }

    /// Run sbatch command.
    async fn run_sbatch(&self, script_path: &Path) -> SchedResult<JobId> {
        let output = Command::new("sbatch")
            .arg(script_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error("sbatch", &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parser::parse_sbatch_failure(output.status.code(), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parser::parse_sbatch_output(&stdout)
    }

    /// Run squeue command to get the status of a queued or running job.
    async fn run_squeue(&self, id: &JobId) -> SchedResult<Option<NativeStatus>> {
        let output = Command::new("squeue")
            .args(["-h", "-j", id.as_str(), "-o", "%i|%j|%T|%r|%N"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error("squeue", &e))?;

        // squeue exits non-zero for jobs that already left the queue
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Invalid job id") {
                return Ok(None);
            }
            return Err(SchedError::SchedulerCommand {
                command: "squeue".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parser::parse_squeue_output(&stdout)
    }

    /// Run sacct command to get finished job status.
    async fn run_sacct(&self, id: &JobId) -> SchedResult<Option<NativeStatus>> {
        let output = Command::new("sacct")
            .args([
                "-j",
                id.as_str(),
                "-o",
                "JobID,JobName,State,ExitCode",
                "-P",
                "-n",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error("sacct", &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SchedError::SchedulerCommand {
                command: "sacct".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parser::parse_sacct_output(&stdout))
    }
}

fn spawn_error(command: &str, e: &std::io::Error) -> SchedError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SchedError::CommandNotFound(command.to_string())
    } else {
        SchedError::SchedulerCommand {
            command: command.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl BatchScheduler for SlurmAdapter {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, job: &JobScript) -> SchedResult<JobId> {
        // SLURM refuses to start jobs whose log directory is missing
        fs::create_dir_all(&job.log_dir).await?;

        let script = templates::generate_batch_script(job, &self.config.modules);
        let script_path = self.script_path(job);
        fs::write(&script_path, &script).await?;
        debug!(script = %script_path.display(), "Wrote batch script");

        let id = self.run_sbatch(&script_path).await?;
        info!(job_id = %id, name = %job.name, partition = %job.resources.partition, "Submitted batch job");
        Ok(id)
    }

    async fn query(&self, id: &JobId) -> SchedResult<NativeStatus> {
        if let Some(status) = self.run_squeue(id).await? {
            return Ok(status);
        }

        if let Some(status) = self.run_sacct(id).await? {
            return Ok(status);
        }

        Err(SchedError::JobNotFound(id.to_string()))
    }

    async fn cancel(&self, id: &JobId) -> SchedResult<()> {
        let output = Command::new("scancel")
            .arg(id.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error("scancel", &e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        parser::parse_scancel_output(&stderr)
    }
}
