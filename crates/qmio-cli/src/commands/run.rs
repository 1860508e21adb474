//! Run command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;
use qmio_runtime::{ErrorKind, RunRequest};

use super::common::{create_runtime, print_json, print_results, spinner};

/// Execute the run command.
pub async fn execute(config: Option<&Path>, request: RunRequest, json: bool) -> Result<()> {
    let runtime = create_runtime(config).await?;
    let backend = request
        .backend
        .clone()
        .unwrap_or_else(|| runtime.config().default_backend.clone());
    let shots = request.shots.unwrap_or(runtime.config().default_shots);

    if !json {
        println!(
            "{} Running on {} ({} shots)",
            style("→").cyan().bold(),
            style(&backend).yellow(),
            shots
        );
    }

    let pb = spinner(format!("Waiting for {backend}"));
    let result = tokio::select! {
        result = runtime.run(request) => result,
        _ = tokio::signal::ctrl_c() => {
            pb.finish_and_clear();
            runtime.shutdown().await;
            anyhow::bail!("Interrupted; tunnel jobs were cancelled, submitted jobs keep running");
        }
    };
    pb.finish_and_clear();
    runtime.shutdown().await;

    let (results, metrics) = match result {
        Ok(ok) => ok,
        Err(e) => {
            if e.kind() == ErrorKind::WaitTimeout {
                if let Some(ref id) = e.job_id {
                    eprintln!(
                        "{} Job {} is still in the queue; check it with `qmio status {}`",
                        style("!").yellow().bold(),
                        id,
                        id
                    );
                }
            }
            return Err(e.into());
        }
    };

    if json {
        print_json(&results, &metrics)
    } else {
        print_results(&results, &metrics);
        Ok(())
    }
}
