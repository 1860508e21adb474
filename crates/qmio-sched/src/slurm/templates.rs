//! SLURM batch script templates.

use crate::job::{JobScript, format_time_limit};

/// Render a SLURM batch script for a job.
pub fn generate_batch_script(job: &JobScript, modules: &[String]) -> String {
    let resources = &job.resources;
    let mut script = String::new();

    // Shebang
    script.push_str("#!/bin/bash\n");

    // SLURM directives
    script.push_str(&format!("#SBATCH --job-name={}\n", sanitize_name(&job.name)));
    script.push_str(&format!(
        "#SBATCH --output={}\n",
        job.stdout_pattern().display()
    ));
    script.push_str(&format!(
        "#SBATCH --error={}\n",
        job.stderr_pattern().display()
    ));
    script.push_str(&format!("#SBATCH --partition={}\n", resources.partition));

    if let Some(ref account) = resources.account {
        script.push_str(&format!("#SBATCH --account={account}\n"));
    }
    if let Some(ref reservation) = resources.reservation {
        script.push_str(&format!("#SBATCH --reservation={reservation}\n"));
    }

    script.push_str(&format!("#SBATCH --nodes={}\n", resources.nodes));
    script.push_str(&format!(
        "#SBATCH --ntasks-per-node={}\n",
        resources.tasks_per_node
    ));
    script.push_str(&format!(
        "#SBATCH --cpus-per-task={}\n",
        resources.cpus_per_task
    ));
    script.push_str(&format!(
        "#SBATCH --time={}\n",
        format_time_limit(resources.time_limit)
    ));
    if let Some(mem) = resources.memory_mb {
        script.push_str(&format!("#SBATCH --mem={mem}M\n"));
    }

    // Environment setup
    script.push_str("\n# Environment setup\n");
    script.push_str("set -e\n");
    script.push_str("set -o pipefail\n\n");

    if !modules.is_empty() {
        script.push_str("# Load required modules\n");
        for module in modules {
            script.push_str(&format!("module load {module}\n"));
        }
        script.push('\n');
    }

    if !job.env.is_empty() {
        for (key, value) in &job.env {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        script.push('\n');
    }

    // Job information
    script.push_str("# Job information\n");
    script.push_str("echo \"Job ID: $SLURM_JOB_ID\"\n");
    script.push_str(&format!("echo \"Backend: {}\"\n", job.backend));
    script.push_str("echo \"Node: $SLURM_NODELIST\"\n");
    script.push_str("echo \"Start Time: $(date)\"\n\n");

    // Backend command; its exit status is the job's exit status
    script.push_str("# Execute backend command\n");
    let mut line = shell_quote(&job.command.program.to_string_lossy());
    for arg in &job.command.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    script.push_str(&line);
    script.push('\n');

    script
}

/// Sanitize a job name for SLURM.
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64) // SLURM has a 64 character limit for job names
        .collect()
}

/// Quote a word for bash, leaving plain words untouched.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+,@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
