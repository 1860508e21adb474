//! Backend registry.
//!
//! The [`BackendRegistry`] maps backend names to immutable
//! [`BackendDescriptor`]s. It is built once (usually with
//! [`BackendRegistry::builtin`]) and then shared read-only.

use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::backend::{
    Action, ActionSpec, BackendDescriptor, BackendKind, InputKind, ResourceFootprint,
};
use crate::error::{HalError, HalResult};

/// Name of the hardware QPU backend.
pub const QPU_FELISA: &str = "qpu_felisa";
/// Name of the QAT real-time control simulator backend.
pub const SIMULATOR_RTCS: &str = "simulator_rtcs";
/// Name of the single-node Qulacs simulator backend.
pub const SIMULATOR_QULACS: &str = "simulator_qulacs";
/// Name of the MPI Qulacs simulator backend.
pub const SIMULATOR_QULACS_MPI: &str = "simulator_qulacs_mpi";

/// Central registry of backend descriptors.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: FxHashMap<String, BackendDescriptor>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the site backends, executables under `prefix`.
    pub fn builtin(prefix: &Path) -> Self {
        let exe = |backend: &str, action: Action| {
            BackendDescriptor::executable_path(prefix, backend, action)
        };

        let descriptors = [
            BackendDescriptor::new(QPU_FELISA, BackendKind::Hardware, "qpu")
                .with_resources(ResourceFootprint::single_node(1, 30))
                .with_run(ActionSpec::run(
                    exe(QPU_FELISA, Action::Run),
                    &[InputKind::Source, InputKind::Instructions],
                ))
                .with_tunnel(),
            BackendDescriptor::new(SIMULATOR_RTCS, BackendKind::Simulator, "ilk")
                .with_resources(ResourceFootprint::single_node(4, 20))
                .with_compile(ActionSpec::compile(exe(SIMULATOR_RTCS, Action::Compile)))
                .with_run(ActionSpec::run(
                    exe(SIMULATOR_RTCS, Action::Run),
                    &[InputKind::Instructions],
                )),
            BackendDescriptor::new(SIMULATOR_QULACS, BackendKind::Simulator, "ilk")
                .with_resources(ResourceFootprint::single_node(32, 60))
                .with_run(ActionSpec::run(
                    exe(SIMULATOR_QULACS, Action::Run),
                    &[InputKind::Source],
                )),
            BackendDescriptor::new(SIMULATOR_QULACS_MPI, BackendKind::Simulator, "ilk")
                .with_resources(ResourceFootprint {
                    nodes: 4,
                    tasks_per_node: 1,
                    cpus_per_task: 64,
                    time_limit_minutes: 120,
                    memory_mb: None,
                })
                .with_run(ActionSpec::run(
                    exe(SIMULATOR_QULACS_MPI, Action::Run),
                    &[InputKind::Source],
                )),
        ];

        let mut registry = Self::new();
        for descriptor in descriptors {
            // Built-in descriptors are validated by the unit tests below.
            registry.backends.insert(descriptor.name.clone(), descriptor);
        }
        registry
    }

    /// Register a descriptor after validating it. Replaces any previous entry.
    pub fn register(&mut self, descriptor: BackendDescriptor) -> HalResult<()> {
        descriptor.validate()?;
        debug!("Registering backend: {}", descriptor.name);
        self.backends.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> HalResult<&BackendDescriptor> {
        self.backends
            .get(name)
            .ok_or_else(|| HalError::UnknownBackend(name.to_string()))
    }

    /// Check if a backend is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        let mut all: Vec<_> = self.backends.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all.into_iter()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_builtin_descriptors_valid() {
        let registry = BackendRegistry::builtin(Path::new("/mnt/Q_SWAP/qmio/backends"));
        assert_eq!(registry.len(), 4);
        for desc in registry.iter() {
            desc.validate().unwrap();
        }
    }

    #[test]
    fn test_qpu_is_run_only_hardware() {
        let registry = BackendRegistry::builtin(Path::new("/opt"));
        let qpu = registry.get(QPU_FELISA).unwrap();
        assert!(qpu.is_hardware());
        assert!(qpu.requires_tunnel);
        assert!(!qpu.supports(Action::Compile));
        assert!(qpu.direct);
    }

    #[test]
    fn test_rtcs_runs_instructions_only() {
        let registry = BackendRegistry::builtin(Path::new("/opt"));
        let rtcs = registry.get(SIMULATOR_RTCS).unwrap();
        assert!(!rtcs.direct);
        assert!(rtcs.supports(Action::Compile));
        let run = rtcs.action(Action::Run).unwrap();
        assert!(run.accepts(InputKind::Instructions));
        assert!(!run.accepts(InputKind::Source));
    }

    #[test]
    fn test_executable_prefix() {
        let registry = BackendRegistry::builtin(Path::new("/opt/qmio"));
        let rtcs = registry.get(SIMULATOR_RTCS).unwrap();
        assert_eq!(
            rtcs.action(Action::Compile).unwrap().executable,
            PathBuf::from("/opt/qmio/simulator_rtcs/compile.sh")
        );
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::builtin(Path::new("/opt"));
        let err = registry.get("quantum_computer_9000").unwrap_err();
        assert!(matches!(err, HalError::UnknownBackend(_)));
        assert!(!registry.contains("quantum_computer_9000"));
    }

    #[test]
    fn test_names_sorted() {
        let registry = BackendRegistry::builtin(Path::new("/opt"));
        assert_eq!(
            registry.names(),
            vec![
                QPU_FELISA,
                SIMULATOR_QULACS,
                SIMULATOR_QULACS_MPI,
                SIMULATOR_RTCS
            ]
        );
    }

    #[test]
    fn test_register_rejects_invalid() {
        let mut registry = BackendRegistry::new();
        let desc = BackendDescriptor::new("broken", BackendKind::Simulator, "short");
        assert!(registry.register(desc).is_err());
        assert!(registry.is_empty());
    }
}
