//! Qmio Command-Line Interface
//!
//! Runs and compiles quantum circuits on the Qmio backends through the
//! cluster batch scheduler.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use qmio_runtime::{CircuitSource, CompileRequest, RunMode, RunRequest};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{backends, cancel, compile, run, status};

/// Qmio - quantum circuit execution on CESGA backends
#[derive(Parser)]
#[command(name = "qmio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default ~/.qmio/config.yaml)
    #[arg(short, long, global = true, env = "QMIO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a circuit on a backend and print the counts
    Run {
        /// Circuit: QASM text, a .qasm file or a compiled .p file
        circuit: String,

        /// Backend to use (defaults to the configured one)
        #[arg(short, long)]
        backend: Option<String>,

        /// Number of shots (defaults to the configured number)
        #[arg(short, long)]
        shots: Option<u32>,

        /// Compile in a separate job before running
        #[arg(long)]
        precompile: bool,

        /// Results file
        #[arg(long)]
        results: Option<PathBuf>,

        /// Execution metrics file
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Instructions file written when compiling first
        #[arg(long)]
        instructions: Option<PathBuf>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a circuit into an instructions file
    Compile {
        /// Circuit: QASM text or a .qasm file
        circuit: String,

        /// Backend to compile for (defaults to the configured one)
        #[arg(short, long)]
        backend: Option<String>,

        /// Number of shots baked into the instructions
        #[arg(short, long)]
        shots: Option<u32>,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List available backends
    Backends,

    /// Query the state of a scheduler job
    Status {
        /// Scheduler job id
        job_id: String,
    },

    /// Cancel a scheduler job
    Cancel {
        /// Scheduler job id
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging; -v wins over RUST_LOG
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();

    // Execute command
    let result = match cli.command {
        Commands::Run {
            circuit,
            backend,
            shots,
            precompile,
            results,
            metrics,
            instructions,
            json,
        } => {
            let mut request = RunRequest::new(CircuitSource::detect(&circuit));
            request.backend = backend;
            request.shots = shots;
            request.results = results;
            request.metrics = metrics;
            request.instructions = instructions;
            if precompile {
                request = request.mode(RunMode::PreCompile);
            }
            run::execute(config, request, json).await
        }

        Commands::Compile {
            circuit,
            backend,
            shots,
            output,
        } => {
            let mut request = CompileRequest::new(CircuitSource::detect(&circuit));
            request.backend = backend;
            request.shots = shots;
            request.output = output;
            compile::execute(config, request).await
        }

        Commands::Backends => backends::execute(config),

        Commands::Status { job_id } => status::execute(config, &job_id).await,

        Commands::Cancel { job_id } => cancel::execute(config, &job_id).await,
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        if let Some(hint) = commands::common::hint(&e) {
            eprintln!("{} {}", style("Hint:").cyan().bold(), hint);
        }
        std::process::exit(1);
    }

    Ok(())
}
