//! Backend descriptors.
//!
//! A [`BackendDescriptor`] is the static description of an execution target:
//! where its jobs run (partition and resource footprint) and how each of its
//! executables must be called. Call signatures are explicit lists of
//! [`ArgSlot`]s so that argument order is data, not string assembly.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};

/// What a job does with its circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Translate a circuit into a backend instructions artifact.
    Compile,
    /// Execute a circuit and produce counts.
    Run,
}

impl Action {
    /// Name used in script names and executable file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Compile => "compile",
            Action::Run => "run",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Real quantum hardware behind an isolated network.
    Hardware,
    /// Classical simulator running on cluster nodes.
    Simulator,
}

/// Representation of the circuit handed to an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Circuit description text (QASM or similar).
    Source,
    /// Pre-compiled, backend-specific instructions artifact.
    Instructions,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Source => f.write_str("circuit source"),
            InputKind::Instructions => f.write_str("instructions artifact"),
        }
    }
}

/// One positional argument of a backend executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgSlot {
    /// Path of the circuit or instructions file.
    Input,
    /// Path the primary artifact is written to.
    Output,
    /// Path the execution metrics are written to.
    Metrics,
    /// Number of shots.
    Shots,
}

/// Resources requested from the scheduler for every job of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFootprint {
    /// Number of nodes.
    pub nodes: u32,
    /// Tasks per node (MPI ranks).
    pub tasks_per_node: u32,
    /// CPUs per task.
    pub cpus_per_task: u32,
    /// Wall-clock limit in minutes.
    pub time_limit_minutes: u32,
    /// Memory per node in MB, if the partition requires it.
    pub memory_mb: Option<u32>,
}

impl Default for ResourceFootprint {
    fn default() -> Self {
        Self {
            nodes: 1,
            tasks_per_node: 1,
            cpus_per_task: 1,
            time_limit_minutes: 10,
            memory_mb: None,
        }
    }
}

impl ResourceFootprint {
    /// Single-node footprint with the given CPU count and time limit.
    pub fn single_node(cpus_per_task: u32, time_limit_minutes: u32) -> Self {
        Self {
            cpus_per_task,
            time_limit_minutes,
            ..Default::default()
        }
    }
}

/// Executable and call signature for one action of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Path of the executable invoked by the job script.
    pub executable: PathBuf,
    /// Positional arguments in the order the executable expects them.
    pub signature: Vec<ArgSlot>,
    /// Circuit representations the executable understands.
    pub accepts: Vec<InputKind>,
}

impl ActionSpec {
    /// Compile executable: `input output shots`.
    pub fn compile(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            signature: vec![ArgSlot::Input, ArgSlot::Output, ArgSlot::Shots],
            accepts: vec![InputKind::Source],
        }
    }

    /// Run executable: `input results metrics shots`.
    pub fn run(executable: impl Into<PathBuf>, accepts: &[InputKind]) -> Self {
        Self {
            executable: executable.into(),
            signature: vec![
                ArgSlot::Input,
                ArgSlot::Output,
                ArgSlot::Metrics,
                ArgSlot::Shots,
            ],
            accepts: accepts.to_vec(),
        }
    }

    /// Number of positional arguments.
    pub fn arity(&self) -> usize {
        self.signature.len()
    }

    /// Whether the signature contains a slot.
    pub fn takes(&self, slot: ArgSlot) -> bool {
        self.signature.contains(&slot)
    }

    /// Whether the executable understands an input representation.
    pub fn accepts(&self, kind: InputKind) -> bool {
        self.accepts.contains(&kind)
    }

    fn validate(&self, backend: &str, action: Action) -> HalResult<()> {
        let invalid = |reason: String| HalError::InvalidDescriptor {
            backend: backend.to_string(),
            reason,
        };

        for slot in [ArgSlot::Input, ArgSlot::Output] {
            let n = self.signature.iter().filter(|s| **s == slot).count();
            if n != 1 {
                return Err(invalid(format!(
                    "{action} signature must contain exactly one {slot:?} slot, found {n}"
                )));
            }
        }
        if self.signature.iter().filter(|s| **s == ArgSlot::Metrics).count() > 1
            || self.signature.iter().filter(|s| **s == ArgSlot::Shots).count() > 1
        {
            return Err(invalid(format!("{action} signature repeats a slot")));
        }
        if action == Action::Run && !self.takes(ArgSlot::Metrics) {
            return Err(invalid("run signature must contain a Metrics slot".into()));
        }
        if action == Action::Compile && self.takes(ArgSlot::Metrics) {
            return Err(invalid("compile signature cannot contain a Metrics slot".into()));
        }
        if self.accepts.is_empty() {
            return Err(invalid(format!("{action} accepts no input kind")));
        }
        Ok(())
    }
}

/// Static description of an execution target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Registry key.
    pub name: String,
    /// Hardware or simulator.
    pub kind: BackendKind,
    /// Scheduler partition jobs are submitted to.
    pub partition: String,
    /// Resource footprint of every job.
    pub resources: ResourceFootprint,
    /// Compile action, if supported.
    pub compile: Option<ActionSpec>,
    /// Run action, if supported.
    pub run: Option<ActionSpec>,
    /// Run action accepts raw source and compiles internally.
    pub direct: bool,
    /// Jobs need a network tunnel to reach the backend.
    pub requires_tunnel: bool,
}

impl BackendDescriptor {
    /// Create a descriptor with no actions.
    pub fn new(name: impl Into<String>, kind: BackendKind, partition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            partition: partition.into(),
            resources: ResourceFootprint::default(),
            compile: None,
            run: None,
            direct: false,
            requires_tunnel: false,
        }
    }

    /// Set the resource footprint.
    pub fn with_resources(mut self, resources: ResourceFootprint) -> Self {
        self.resources = resources;
        self
    }

    /// Add a compile action.
    pub fn with_compile(mut self, spec: ActionSpec) -> Self {
        self.compile = Some(spec);
        self
    }

    /// Add a run action. A run action that accepts source makes the backend direct.
    pub fn with_run(mut self, spec: ActionSpec) -> Self {
        self.direct = spec.accepts(InputKind::Source);
        self.run = Some(spec);
        self
    }

    /// Require a tunnel for every job.
    pub fn with_tunnel(mut self) -> Self {
        self.requires_tunnel = true;
        self
    }

    /// Spec for an action, if the backend supports it.
    pub fn action(&self, action: Action) -> Option<&ActionSpec> {
        match action {
            Action::Compile => self.compile.as_ref(),
            Action::Run => self.run.as_ref(),
        }
    }

    /// Whether the backend supports an action.
    pub fn supports(&self, action: Action) -> bool {
        self.action(action).is_some()
    }

    /// Whether jobs target real hardware.
    pub fn is_hardware(&self) -> bool {
        self.kind == BackendKind::Hardware
    }

    /// Check internal consistency.
    pub fn validate(&self) -> HalResult<()> {
        if self.name.is_empty() {
            return Err(HalError::InvalidDescriptor {
                backend: self.name.clone(),
                reason: "empty name".into(),
            });
        }
        let Some(run) = &self.run else {
            return Err(HalError::InvalidDescriptor {
                backend: self.name.clone(),
                reason: "backend has no run action".into(),
            });
        };
        run.validate(&self.name, Action::Run)?;
        if let Some(compile) = &self.compile {
            compile.validate(&self.name, Action::Compile)?;
            if !run.accepts(InputKind::Instructions) {
                return Err(HalError::InvalidDescriptor {
                    backend: self.name.clone(),
                    reason: "compile output cannot be consumed by the run action".into(),
                });
            }
        } else if !run.accepts(InputKind::Source) {
            return Err(HalError::InvalidDescriptor {
                backend: self.name.clone(),
                reason: "run needs instructions but the backend cannot compile".into(),
            });
        }
        if self.resources.nodes == 0 || self.resources.time_limit_minutes == 0 {
            return Err(HalError::InvalidDescriptor {
                backend: self.name.clone(),
                reason: "resource footprint must request at least one node and one minute".into(),
            });
        }
        Ok(())
    }

    /// Conventional executable location: `<prefix>/<backend>/<action>.sh`.
    pub fn executable_path(prefix: &Path, backend: &str, action: Action) -> PathBuf {
        prefix.join(backend).join(format!("{}.sh", action.as_str()))
    }
}
