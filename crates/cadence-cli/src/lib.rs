#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unused_crate_dependencies)]

// Used by the binary target only.
use anyhow as _;
use tracing_subscriber as _;

pub mod agents;
pub mod config;
pub mod error;
pub mod parser;
pub mod simulate;

pub use error::CliError;
pub use parser::{Cli, Commands};
pub use simulate::{SimulationReport, run_simulation};
