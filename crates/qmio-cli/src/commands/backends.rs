//! Backends command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;
use qmio_hal::{Action, BackendRegistry, InputKind};
use qmio_sched::format_time_limit;

use super::common::load_config;

/// Execute the backends command.
pub fn execute(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let registry = BackendRegistry::builtin(&config.backend_prefix);

    println!("{} Available backends:\n", style("Qmio").cyan().bold());

    for desc in registry.iter() {
        let marker = if desc.is_hardware() {
            style("●").magenta()
        } else {
            style("●").green()
        };
        let default = if desc.name == config.default_backend {
            " (default)"
        } else {
            ""
        };
        println!("  {} {}{}", marker, style(&desc.name).bold(), default);

        let res = &desc.resources;
        println!("    Partition: {}", desc.partition);
        println!(
            "    Resources: {} node(s), {} task(s)/node, {} cpu(s)/task, {}",
            res.nodes,
            res.tasks_per_node,
            res.cpus_per_task,
            format_time_limit(std::time::Duration::from_secs(
                u64::from(res.time_limit_minutes) * 60
            ))
        );
        println!(
            "    Compile: {}",
            if desc.supports(Action::Compile) { "yes" } else { "no" }
        );
        if let Some(run) = desc.action(Action::Run) {
            let inputs: Vec<String> = [InputKind::Source, InputKind::Instructions]
                .into_iter()
                .filter(|k| run.accepts(*k))
                .map(|k| k.to_string())
                .collect();
            println!("    Run input: {}", inputs.join(", "));
        }
        if desc.requires_tunnel {
            let endpoint = config.tunnel.endpoint.as_deref().unwrap_or("not configured");
            println!("    Endpoint: {endpoint}");
        }
        println!();
    }

    Ok(())
}
