//! Compile command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;
use qmio_runtime::CompileRequest;

use super::common::{create_runtime, spinner};

/// Execute the compile command.
pub async fn execute(config: Option<&Path>, request: CompileRequest) -> Result<()> {
    let runtime = create_runtime(config).await?;
    let backend = request
        .backend
        .clone()
        .unwrap_or_else(|| runtime.config().default_backend.clone());

    println!(
        "{} Compiling for {}",
        style("→").cyan().bold(),
        style(&backend).yellow()
    );

    let pb = spinner("Waiting for the compile job");
    let result = tokio::select! {
        result = runtime.compile(request) => result,
        _ = tokio::signal::ctrl_c() => {
            pb.finish_and_clear();
            anyhow::bail!("Interrupted; the compile job keeps running");
        }
    };
    pb.finish_and_clear();
    let path = result?;

    println!(
        "{} Instructions written to {}",
        style("✓").green().bold(),
        style(path.display()).cyan()
    );
    Ok(())
}
