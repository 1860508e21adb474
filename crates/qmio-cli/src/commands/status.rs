//! Status command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;
use qmio_sched::{JobId, JobState};

use super::common::create_runtime;

/// Execute the status command.
pub async fn execute(config: Option<&Path>, job_id: &str) -> Result<()> {
    let runtime = create_runtime(config).await?;
    let state = runtime.status(&JobId::new(job_id)).await?;

    let marker = match state {
        JobState::Completed => style("●").green(),
        JobState::Pending | JobState::Running => style("●").yellow(),
        _ => style("●").red(),
    };
    println!("  {} {} {}", marker, style(job_id).bold(), state);
    Ok(())
}
