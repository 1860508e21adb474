//! Shared helpers for CLI commands.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use qmio_hal::{ExecutionMetrics, ResultPayload};
use qmio_runtime::{QmioRuntime, RunCommandError, RuntimeConfig, RuntimeError};
use tracing::debug;

/// Outcomes shown before the table is truncated.
const MAX_ROWS: usize = 16;

/// Load configuration from `path`, or the default file, plus `QMIO_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::load(path).context("Failed to load configuration")?;
    debug!(
        backend = %config.default_backend,
        work_dir = %config.work_dir.display(),
        "Configuration loaded"
    );
    Ok(config)
}

/// Create a runtime submitting to SLURM.
pub async fn create_runtime(path: Option<&Path>) -> Result<QmioRuntime> {
    let config = load_config(path)?;
    QmioRuntime::new(config)
        .await
        .context("Failed to initialize the scheduler client")
}

/// Remedy for the first error in the chain that has one.
pub fn hint(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<RunCommandError>() {
            e.hint()
        } else {
            cause.downcast_ref::<RuntimeError>().and_then(RuntimeError::hint)
        }
    })
}

/// Spinner shown while jobs are queued or running.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Print counts as a table with probability bars.
#[allow(clippy::cast_precision_loss)]
pub fn print_results(results: &ResultPayload, metrics: &ExecutionMetrics) {
    let total = results.total_shots();
    println!(
        "\n{} Results ({} shots):",
        style("✓").green().bold(),
        total
    );

    let sorted = results.counts.sorted();
    for (bitstring, count) in sorted.iter().take(MAX_ROWS) {
        let prob = if total == 0 {
            0.0
        } else {
            **count as f64 / total as f64 * 100.0
        };
        let bar: String = "█".repeat((prob / 2.0).round() as usize);

        println!(
            "  {}: {:>6} ({:>5.2}%) {}",
            style(bitstring).cyan(),
            count,
            prob,
            style(bar).green()
        );
    }

    if sorted.len() > MAX_ROWS {
        println!("  ... and {} more outcomes", sorted.len() - MAX_ROWS);
    }

    for (name, counts) in results.registers.iter().skip(1) {
        println!(
            "  Register {}: {} outcomes",
            style(name).bold(),
            counts.len()
        );
    }

    println!(
        "\n  Queue wait:     {:.2} s",
        style(metrics.queue_wait_secs).yellow()
    );
    println!(
        "  Execution time: {:.2} s",
        style(metrics.execution_secs).yellow()
    );
}

/// Print results and metrics as one JSON document.
pub fn print_json(results: &ResultPayload, metrics: &ExecutionMetrics) -> Result<()> {
    let doc = serde_json::json!({
        "results": results,
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmio_hal::Action;
    use qmio_runtime::Stage;
    use qmio_sched::SchedError;

    #[test]
    fn test_hint_found_through_context() {
        let err = anyhow::Error::from(RuntimeError::MissingEndpoint("qpu_felisa".into()))
            .context("Failed to run");
        assert!(hint(&err).unwrap().contains("QMIO_ENDPOINT"));

        let run = RunCommandError::new(
            Action::Run,
            Stage::Submitted,
            RuntimeError::Sched(SchedError::InvalidReservation("qpu_res".into())),
        );
        assert!(hint(&anyhow::Error::from(run)).unwrap().contains("scontrol"));

        assert!(hint(&anyhow::anyhow!("plain failure")).is_none());
    }
}
