//! Qmio Runtime
//!
//! Runs and compiles quantum circuits on Qmio backends. Every call becomes
//! one or more batch jobs: the runtime builds the job scripts, opens a
//! tunnel when the backend is hardware behind an isolated network, waits for
//! the jobs and parses what they wrote.
//!
//! # Components
//!
//! - [`ScriptBuilder`]: validates a [`JobRequest`] against the backend
//!   descriptor and produces a [`JobScript`](qmio_sched::JobScript)
//! - [`TunnelManager`]: shares [`TunnelProvider`] handles between requests
//! - [`ResultCollector`]: reads results and metrics of finished jobs
//! - [`QmioRuntime`]: `run` and `compile` on top of all of the above
//!
//! # Run paths
//!
//! | Input | Backend | Jobs |
//! |-------|---------|------|
//! | source | direct | run |
//! | source | not direct, or [`RunMode::PreCompile`] | compile, then run |
//! | instructions | any | run |
//!
//! # Example
//!
//! ```ignore
//! use qmio_runtime::{QmioRuntime, RunRequest, RuntimeConfig};
//!
//! let runtime = QmioRuntime::new(RuntimeConfig::load(None)?).await?;
//! let (results, metrics) = runtime
//!     .run(RunRequest::new("bell.qasm").backend("simulator_rtcs").shots(1000))
//!     .await?;
//! println!("{:?} in {:.2}s", results.counts.most_frequent(), metrics.execution_secs);
//! ```

pub mod circuit;
pub mod collector;
pub mod config;
pub mod error;
pub mod runtime;
pub mod script;
pub mod tunnel;

pub use circuit::{CircuitSource, bell, ghz};
pub use collector::ResultCollector;
pub use config::{
    ArtifactPaths, PollingConfig, RuntimeConfig, SchedulerSettings, TunnelConfig, TunnelMode,
};
pub use error::{ErrorKind, RunCommandError, RuntimeError, RuntimeResult, Stage};
pub use runtime::{CompileRequest, QmioRuntime, RunMode, RunRequest};
pub use script::{ENDPOINT_ENV, JobRequest, ScriptBuilder};
pub use tunnel::{
    DirectTunnel, Endpoint, SchedulerTunnel, TunnelHandle, TunnelLease, TunnelManager,
    TunnelProvider, TunnelSettings, verify_reachable,
};
