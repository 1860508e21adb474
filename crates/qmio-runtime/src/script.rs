//! Job script builder.
//!
//! Turns a [`JobRequest`] into a scheduler-neutral [`JobScript`]. Arguments
//! are filled from named request fields in the order the backend's
//! [`ActionSpec`](qmio_hal::ActionSpec) signature lists them, so a request
//! that does not fit the executable is rejected here instead of producing a
//! job with misordered arguments.

use std::path::PathBuf;
use std::time::Duration;

use qmio_hal::{Action, ArgSlot, BackendRegistry, HalError, InputKind};
use qmio_sched::{CommandLine, ExpectedOutputs, JobScript, ResourceRequest};

use crate::error::{RuntimeError, RuntimeResult};

/// Variable through which jobs learn the tunnel address.
pub const ENDPOINT_ENV: &str = "QMIO_ENDPOINT";

/// One job to build: what to run, on what, and where artifacts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Backend name.
    pub backend: String,
    /// Compile or run.
    pub action: Action,
    /// Number of shots.
    pub shots: u32,
    /// Input file handed to the executable.
    pub input: PathBuf,
    /// Representation of the input file.
    pub input_kind: InputKind,
    /// Artifacts the executable must write.
    pub outputs: ExpectedOutputs,
    /// Reachable tunnel address, for hardware jobs.
    pub tunnel: Option<String>,
}

impl JobRequest {
    /// Run request writing results and metrics.
    pub fn run(
        backend: impl Into<String>,
        input: impl Into<PathBuf>,
        input_kind: InputKind,
        shots: u32,
        results: impl Into<PathBuf>,
        metrics: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend: backend.into(),
            action: Action::Run,
            shots,
            input: input.into(),
            input_kind,
            outputs: ExpectedOutputs {
                artifact: results.into(),
                metrics: Some(metrics.into()),
            },
            tunnel: None,
        }
    }

    /// Compile request writing an instructions artifact.
    pub fn compile(
        backend: impl Into<String>,
        input: impl Into<PathBuf>,
        shots: u32,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend: backend.into(),
            action: Action::Compile,
            shots,
            input: input.into(),
            input_kind: InputKind::Source,
            outputs: ExpectedOutputs {
                artifact: output.into(),
                metrics: None,
            },
            tunnel: None,
        }
    }

    /// Route the job through a tunnel.
    pub fn with_tunnel(mut self, address: impl Into<String>) -> Self {
        self.tunnel = Some(address.into());
        self
    }
}

/// Builds job scripts from requests. Pure: no I/O, no scheduler calls.
#[derive(Debug, Clone)]
pub struct ScriptBuilder<'a> {
    registry: &'a BackendRegistry,
    log_dir: PathBuf,
    account: Option<String>,
    reservation: Option<String>,
}

impl<'a> ScriptBuilder<'a> {
    /// Create a builder over `registry`.
    pub fn new(registry: &'a BackendRegistry) -> Self {
        Self {
            registry,
            log_dir: PathBuf::from("."),
            account: None,
            reservation: None,
        }
    }

    /// Directory for job logs.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Account jobs are billed to.
    pub fn with_account(mut self, account: Option<String>) -> Self {
        self.account = account;
        self
    }

    /// Reservation for hardware jobs.
    pub fn with_reservation(mut self, reservation: Option<String>) -> Self {
        self.reservation = reservation;
        self
    }

    /// Build the job script for `request`.
    pub fn build(&self, request: &JobRequest) -> RuntimeResult<JobScript> {
        let backend = &request.backend;
        let desc = self.registry.get(backend).map_err(|e| match e {
            HalError::UnknownBackend(name) => RuntimeError::UnknownBackend(name),
            other => RuntimeError::Hal(other),
        })?;

        let spec = desc
            .action(request.action)
            .ok_or_else(|| RuntimeError::UnsupportedAction {
                backend: backend.clone(),
                action: request.action,
            })?;

        if request.shots == 0 {
            return Err(RuntimeError::InvalidShots(request.shots));
        }
        if !spec.accepts(request.input_kind) {
            return Err(RuntimeError::UnsupportedInput {
                backend: backend.clone(),
                action: request.action,
                input: request.input_kind,
            });
        }

        let mismatch = |reason: &str| RuntimeError::ArgumentMismatch {
            backend: backend.clone(),
            action: request.action,
            reason: reason.to_string(),
        };

        let mut args = Vec::with_capacity(spec.arity());
        for slot in &spec.signature {
            let arg = match slot {
                ArgSlot::Input => request.input.to_string_lossy().into_owned(),
                ArgSlot::Output => request.outputs.artifact.to_string_lossy().into_owned(),
                ArgSlot::Metrics => match &request.outputs.metrics {
                    Some(path) => path.to_string_lossy().into_owned(),
                    None => return Err(mismatch("executable expects a metrics path")),
                },
                ArgSlot::Shots => request.shots.to_string(),
            };
            args.push(arg);
        }
        if request.outputs.metrics.is_some() && !spec.takes(ArgSlot::Metrics) {
            return Err(mismatch("executable takes no metrics path"));
        }
        if args.len() != spec.arity() {
            return Err(mismatch("argument count differs from signature"));
        }

        if desc.requires_tunnel && request.tunnel.is_none() {
            return Err(RuntimeError::MissingEndpoint(backend.clone()));
        }

        let footprint = &desc.resources;
        let resources = ResourceRequest {
            partition: desc.partition.clone(),
            nodes: footprint.nodes,
            tasks_per_node: footprint.tasks_per_node,
            cpus_per_task: footprint.cpus_per_task,
            time_limit: Duration::from_secs(u64::from(footprint.time_limit_minutes) * 60),
            memory_mb: footprint.memory_mb,
            account: self.account.clone(),
            reservation: if desc.is_hardware() {
                self.reservation.clone()
            } else {
                None
            },
        };

        let mut script = JobScript::new(
            format!("qmio-{}-{}", request.action, backend),
            backend.clone(),
            resources,
            CommandLine::new(spec.executable.clone(), args),
        )
        .with_outputs(request.outputs.clone())
        .with_log_dir(self.log_dir.clone());

        if let Some(ref address) = request.tunnel {
            script = script.with_env(ENDPOINT_ENV, address.clone());
        }

        Ok(script)
    }
}
