//! Cancel command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;
use qmio_sched::JobId;

use super::common::create_runtime;

/// Execute the cancel command.
pub async fn execute(config: Option<&Path>, job_id: &str) -> Result<()> {
    let runtime = create_runtime(config).await?;
    runtime.cancel(&JobId::new(job_id)).await?;
    println!(
        "{} Cancellation requested for job {}",
        style("✓").green().bold(),
        style(job_id).bold()
    );
    Ok(())
}
