//! Circuit inputs.

use std::path::{Path, PathBuf};

use qmio_hal::InputKind;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RuntimeError, RuntimeResult};

/// Extensions of circuit source files.
const SOURCE_EXTENSIONS: &[&str] = &["qasm"];
/// Extensions of pre-compiled instructions artifacts.
const INSTRUCTION_EXTENSIONS: &[&str] = &["p", "instructions"];

/// The circuit handed to a request. Exactly one representation is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitSource {
    /// Circuit description text.
    Source(String),
    /// Path of a circuit description file.
    SourceFile(PathBuf),
    /// Path of a pre-compiled instructions artifact.
    Instructions(PathBuf),
}

impl CircuitSource {
    /// Classify a user-supplied string.
    ///
    /// Paths ending in `.qasm` are source files and paths ending in `.p` or
    /// `.instructions` are instructions artifacts; anything else, including
    /// text starting with `OPENQASM`, is raw source.
    pub fn detect(input: &str) -> Self {
        let trimmed = input.trim_start();
        if trimmed.starts_with("OPENQASM") || input.contains('\n') {
            return Self::Source(input.to_string());
        }

        let path = Path::new(input.trim());
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if SOURCE_EXTENSIONS.contains(&ext) => Self::SourceFile(path.to_path_buf()),
            Some(ext) if INSTRUCTION_EXTENSIONS.contains(&ext) => {
                Self::Instructions(path.to_path_buf())
            }
            _ => Self::Source(input.to_string()),
        }
    }

    /// Representation the executable will receive.
    pub fn kind(&self) -> InputKind {
        match self {
            Self::Source(_) | Self::SourceFile(_) => InputKind::Source,
            Self::Instructions(_) => InputKind::Instructions,
        }
    }

    /// Whether this is source (text or file) rather than instructions.
    pub fn is_source(&self) -> bool {
        self.kind() == InputKind::Source
    }

    /// Path to hand to a job, writing raw text to a uniquely named file
    /// under `work_dir` first.
    pub async fn materialize(&self, work_dir: &Path) -> RuntimeResult<PathBuf> {
        match self {
            Self::Source(text) => {
                if text.trim().is_empty() {
                    return Err(RuntimeError::Config("empty circuit source".into()));
                }
                fs::create_dir_all(work_dir).await?;
                let path = work_dir.join(format!(".circuit-{}.qasm", Uuid::new_v4()));
                fs::write(&path, text).await?;
                debug!(path = %path.display(), "Materialized circuit source");
                Ok(path)
            }
            Self::SourceFile(path) | Self::Instructions(path) => {
                if fs::metadata(path).await.is_err() {
                    return Err(RuntimeError::Config(format!(
                        "circuit file not found: {}",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
        }
    }
}

impl From<&str> for CircuitSource {
    fn from(s: &str) -> Self {
        Self::detect(s)
    }
}

/// OPENQASM 3.0 Bell pair between `control` and `target`, measured into `c`.
pub fn bell(control: u32, target: u32) -> String {
    format!(
        "OPENQASM 3.0;
include \"qelib1.inc\";
qreg q[2];
creg c[2];
h q[{control}];
cx q[{control}],q[{target}];
measure q[{control}] -> c[0];
measure q[{target}] -> c[1];"
    )
}

/// OPENQASM 3.0 GHZ state over three qubits, measured into `meas`.
pub fn ghz(control: u32, target1: u32, target2: u32) -> String {
    format!(
        "OPENQASM 3.0;
include \"qelib1.inc\";
qreg q[3];
creg meas[3];
h q[{control}];
cx q[{control}],q[{target1}];
cx q[{control}],q[{target2}];
barrier q[{control}],q[{target1}],q[{target2}];
measure q[{control}] -> meas[0];
measure q[{target1}] -> meas[1];
measure q[{target2}] -> meas[2];"
    )
}
