//! CLI command implementations.

pub mod backends;
pub mod cancel;
pub mod common;
pub mod compile;
pub mod run;
pub mod status;
