//! SLURM integration for batch job submission.

mod adapter;
mod parser;
mod templates;

pub use adapter::{SlurmAdapter, SlurmConfig};
pub use templates::generate_batch_script;
