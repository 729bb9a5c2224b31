//! Halyard CLI entrypoint.
//!
//! This is the main entrypoint for the halyard command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use halyard::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use halyard::config::{ConfigParser, DeployConfig, StateBackend, find_config_file};
use halyard::credentials::{CredentialSink, DirectoryCredentialSink};
use halyard::engine::RunReport;
use halyard::error::{ConfigError, EXIT_SUCCESS, HalyardError, Result};
use halyard::lock::generate_holder_id;
use halyard::orchestrator::Orchestrator;
use halyard::provider::HttpProvider;
use halyard::state::{LocalStateStore, RunOperation, S3StateStore, STATE_DIR, SharedStateStore};

use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            if formatter.is_json() {
                emit(&formatter.format_error(&e));
            } else {
                eprintln!("{}", formatter.format_error(&e));
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. Logs go to stderr.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point; returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let (config, base_dir) = load_config(cli.config.as_ref())?;
    let holder = cli.holder.clone().unwrap_or_else(generate_holder_id);
    let store = open_store(&config, &base_dir).await?;
    let mut orchestrator = Orchestrator::new(config.clone(), store).with_holder_id(holder.clone());
    if let Some(secs) = cli.wait_lock {
        orchestrator = orchestrator.with_lock_wait((secs > 0).then(|| Duration::from_secs(secs)));
    }

    match cli.command {
        Commands::Validate { warnings } => {
            let (result, graph) = orchestrator.validate()?;
            emit(&formatter.format_validation(&result, &graph, warnings));
            Ok(EXIT_SUCCESS)
        }
        Commands::Plan { detailed } => {
            let plan = orchestrator.plan().await?;
            emit(&formatter.format_plan(&plan, detailed));
            Ok(EXIT_SUCCESS)
        }
        Commands::Apply { yes } => {
            let orchestrator = with_provider(orchestrator, &config, &base_dir).await?;
            let plan = orchestrator.plan().await?;
            if plan.has_changes() && !formatter.is_json() {
                eprintln!("{}", formatter.format_plan(&plan, false));
            }
            if plan.has_changes() && !yes && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
                eprintln!("Apply cancelled.");
                return Ok(EXIT_SUCCESS);
            }
            let result = orchestrator.apply().await;
            finish_run(formatter, orchestrator.environment(), RunOperation::Apply, result)
        }
        Commands::Destroy { yes } => {
            let orchestrator = with_provider(orchestrator, &config, &base_dir).await?;
            if let Some(state) = orchestrator.state().await? {
                if !formatter.is_json() {
                    eprintln!("The following resources will be destroyed:");
                    for record in state.records.values() {
                        eprintln!("  - {} ({}, {})", record.id, record.resource_type, record.status);
                    }
                }
            }
            if !yes && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
                eprintln!("Destruction cancelled.");
                return Ok(EXIT_SUCCESS);
            }
            let result = orchestrator.destroy().await;
            finish_run(formatter, orchestrator.environment(), RunOperation::Destroy, result)
        }
        Commands::Import {
            id,
            resource_type,
            provider_id,
        } => {
            let orchestrator = with_provider(orchestrator, &config, &base_dir).await?;
            let result = orchestrator.import(&id, &resource_type, &provider_id).await;
            finish_run(formatter, orchestrator.environment(), RunOperation::Import, result)
        }
        Commands::ForceUnlock { reason, yes } => {
            if let Some(lease) = orchestrator.lock_status().await? {
                eprintln!(
                    "Lock on '{}' is held by {} (last heartbeat {}).",
                    lease.scope, lease.holder_id, lease.heartbeat_at
                );
            }
            if !yes && !confirm("Remove it? [y/N]: ", "y")? {
                eprintln!("Force unlock cancelled.");
                return Ok(EXIT_SUCCESS);
            }
            let removed = orchestrator.force_unlock(&holder, &reason).await?;
            emit(&formatter.format_unlock(orchestrator.environment(), removed.as_ref()));
            Ok(EXIT_SUCCESS)
        }
        Commands::Drift => {
            let orchestrator = with_provider(orchestrator, &config, &base_dir).await?;
            let report = orchestrator.drift().await?;
            emit(&formatter.format_drift(&report));
            Ok(EXIT_SUCCESS)
        }
        Commands::State { command } => match command {
            StateCommands::Show => {
                let lock = orchestrator.lock_status().await?;
                match orchestrator.state().await? {
                    Some(state) => emit(&formatter.format_state(&state, lock.as_ref())),
                    None => eprintln!("No state found for '{}'.", orchestrator.environment()),
                }
                Ok(EXIT_SUCCESS)
            }
            StateCommands::Audit => {
                let entries = orchestrator.audit().await?;
                emit(&formatter.format_audit(&entries));
                Ok(EXIT_SUCCESS)
            }
        },
    }
}

/// Prints a run report and maps it to an exit code.
///
/// With JSON output a run that was rejected before it started still
/// produces a report.
fn finish_run(
    formatter: &OutputFormatter,
    environment: &str,
    operation: RunOperation,
    result: Result<RunReport>,
) -> Result<u8> {
    match result {
        Ok(report) => {
            emit(&formatter.format_report(&report));
            Ok(report.exit_code())
        }
        Err(e) if formatter.is_json() => {
            error!("{e}");
            emit(&formatter.format_report(&RunReport::rejected(environment, operation, &e.to_string())));
            Ok(e.exit_code())
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", output.trim_end());
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Loads `.env` and the configuration; returns it with its directory.
fn load_config(config_path: Option<&PathBuf>) -> Result<(DeployConfig, PathBuf)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Creates the state store named in the configuration.
async fn open_store(config: &DeployConfig, base_dir: &Path) -> Result<SharedStateStore> {
    let store: SharedStateStore = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                HalyardError::from(ConfigError::validation("S3 bucket not configured", "state.bucket"))
            })?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };
    Ok(store)
}

/// Connects the HTTP provider and the credential sink.
async fn with_provider(orchestrator: Orchestrator, config: &DeployConfig, base_dir: &Path) -> Result<Orchestrator> {
    let Some(endpoint) = config.provider.endpoint.as_deref() else {
        // The orchestrator reports the missing endpoint as a spec error.
        return Ok(orchestrator);
    };
    let token = ConfigParser::provider_token(config)?;
    let call_timeout = Duration::from_secs(config.engine.call_timeout_secs);
    let provider = HttpProvider::connect(endpoint, &token, call_timeout).await?;

    let sink = config.credentials.as_ref().map(|c| {
        let sink: Arc<dyn CredentialSink> = Arc::new(DirectoryCredentialSink::new(base_dir.join(&c.directory)));
        sink
    });

    Ok(orchestrator
        .with_provider(Arc::new(provider))
        .with_credential_sink(sink))
}
