//! Qmio Hardware Abstraction Layer
//!
//! Static descriptions of the execution targets reachable through the
//! cluster batch scheduler, and the result types their executables produce.
//!
//! # Overview
//!
//! - [`BackendDescriptor`] describes one target: partition, resource
//!   footprint, and the call signature of each executable
//! - [`BackendRegistry`] maps backend names to descriptors
//! - [`ResultPayload`] and [`ExecutionMetrics`] hold parsed job artifacts
//!
//! # Built-in Backends
//!
//! | Backend | Kind | Compile | Run input | Tunnel |
//! |---------|------|---------|-----------|--------|
//! | `qpu_felisa` | Hardware | no | source, instructions | yes |
//! | `simulator_rtcs` | Simulator | yes | source, instructions | no |
//! | `simulator_qulacs` | Simulator | no | source | no |
//! | `simulator_qulacs_mpi` | Simulator | no | source | no |
//!
//! # Example
//!
//! ```ignore
//! use std::path::Path;
//! use qmio_hal::{Action, BackendRegistry};
//!
//! let registry = BackendRegistry::builtin(Path::new("/mnt/Q_SWAP/qmio/backends"));
//! let rtcs = registry.get("simulator_rtcs")?;
//! assert!(rtcs.supports(Action::Compile));
//! ```

pub mod backend;
pub mod error;
pub mod registry;
pub mod result;

pub use backend::{
    Action, ActionSpec, ArgSlot, BackendDescriptor, BackendKind, InputKind, ResourceFootprint,
};
pub use error::{HalError, HalResult};
pub use registry::{
    BackendRegistry, QPU_FELISA, SIMULATOR_QULACS, SIMULATOR_QULACS_MPI, SIMULATOR_RTCS,
};
pub use result::{Counts, ExecutionMetrics, ResultPayload};
