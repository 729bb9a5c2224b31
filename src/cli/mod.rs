//! CLI module for the Halyard tool.
//!
//! This module provides the command-line surface and the text/JSON
//! rendering of plans, run reports, drift reports and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
