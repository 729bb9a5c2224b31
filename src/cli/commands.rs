//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halyard - infrastructure convergence and teardown.
#[derive(Parser, Debug)]
#[command(name = "halyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "HALYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format on stderr (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Lock holder identity (defaults to user@host:pid).
    #[arg(long, global = true, env = "HALYARD_HOLDER")]
    pub holder: Option<String>,

    /// Seconds to wait for a held lock before giving up.
    #[arg(long, global = true, value_name = "SECS")]
    pub wait_lock: Option<u64>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and its dependency graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what apply would change, without changing anything.
    Plan {
        /// Show field-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the environment toward the configuration.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete every recorded resource of the environment.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Attach an existing resource to a record without creating it.
    Import {
        /// Logical id to record the resource under.
        id: String,

        /// Resource type.
        #[arg(long = "type")]
        resource_type: String,

        /// Provider identifier of the existing resource.
        #[arg(long)]
        provider_id: String,
    },

    /// Remove the environment lock regardless of who holds it.
    ForceUnlock {
        /// Why the lock is being removed; recorded in the audit log.
        #[arg(long)]
        reason: String,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with live provider state.
    Drift,

    /// Inspect the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State inspection subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded state and the current lock.
    Show,

    /// Show the administrative audit log.
    Audit,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_arguments() {
        let cli = Cli::try_parse_from([
            "halyard",
            "import",
            "vpc",
            "--type",
            "network.vpc",
            "--provider-id",
            "vpc-1",
            "--output",
            "json",
        ])
        .expect("parse");

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Import {
                id,
                resource_type,
                provider_id,
            } => {
                assert_eq!(id, "vpc");
                assert_eq!(resource_type, "network.vpc");
                assert_eq!(provider_id, "vpc-1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_force_unlock_requires_reason() {
        assert!(Cli::try_parse_from(["halyard", "force-unlock"]).is_err());
        let cli = Cli::try_parse_from(["halyard", "force-unlock", "--reason", "stuck", "--wait-lock", "5"])
            .expect("parse");
        assert_eq!(cli.wait_lock, Some(5));
        assert!(matches!(cli.command, Commands::ForceUnlock { .. }));
    }
}
