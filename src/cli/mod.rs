//! Command-line interface for docforge.
//!
//! Provides commands to execute a run and to inspect a stored run's status
//! and timeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, KIND_ENV};
