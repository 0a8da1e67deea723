//! Pipewright CLI Entry Point
//!
//! Runs a workflow to completion and prints its outcome.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! pipewright workflow.yaml
//!
//! # With inputs and workflow options
//! pipewright workflow.yaml inputs.json --options options.json
//!
//! # Keep independent calls running after a failure
//! pipewright workflow.yaml --fail-slow --max-retries 2
//!
//! # Pick up unfinished workflows from a file store
//! pipewright --config engine.yaml --restart
//! ```

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use pipewright::backend::BackendRegistry;
use pipewright::config::{EngineConfig, StoreConfig};
use pipewright::execution::{CallExecutionStatus, WorkflowManager, WorkflowSnapshot};
use pipewright::store::{FileStore, MemoryStore, Store};
use pipewright::workflow::{load_sources, FailureMode, WorkflowId, WorkflowState};
use pipewright::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<PathBuf>,
    inputs_path: Option<PathBuf>,
    options_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    backend: Option<String>,
    fail_slow: bool,
    max_retries: Option<u32>,
    restart: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: pipewright [OPTIONS] <WORKFLOW_FILE> [INPUTS_JSON]");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML file");
    println!("  [INPUTS_JSON]       Optional JSON file with workflow inputs");
    println!();
    println!("Options:");
    println!("  --options PATH      JSON file with workflow options");
    println!("  --config PATH       Engine configuration YAML file");
    println!("  --backend NAME      Default backend for calls");
    println!("  --fail-slow         Keep independent calls running after a failure");
    println!("  --max-retries N     Retry budget for calls that declare none");
    println!("  --restart           Resume unfinished workflows from the store");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  pipewright pipeline.yaml");
    println!("  pipewright pipeline.yaml inputs.json --fail-slow");
    println!("  pipewright --config engine.yaml --restart");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--fail-slow" => {
                config.fail_slow = true;
            }
            "--restart" => {
                config.restart = true;
            }
            "--options" => {
                i += 1;
                config.options_path = Some(PathBuf::from(value(i, "--options")?));
            }
            "--config" => {
                i += 1;
                config.config_path = Some(PathBuf::from(value(i, "--config")?));
            }
            "--backend" => {
                i += 1;
                config.backend = Some(value(i, "--backend")?);
            }
            "--max-retries" => {
                i += 1;
                let raw = value(i, "--max-retries")?;
                config.max_retries = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid retry count: {}", raw))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = Some(PathBuf::from(arg)),
                    1 => config.inputs_path = Some(PathBuf::from(arg)),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.workflow_path.is_none() && !config.restart {
        return Err("a workflow file is required".to_string());
    }

    Ok(config)
}

/// Loads the engine configuration and applies command-line overrides.
fn engine_config(cli: &Config) -> Result<EngineConfig, Box<dyn Error>> {
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(backend) = &cli.backend {
        config.default_backend = backend.clone();
    }
    if cli.fail_slow {
        config.failure_mode = FailureMode::FailSlow;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    config.validate()?;
    Ok(config)
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>, Box<dyn Error>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::File { path } => {
            info!("Using file store at {}", path.display());
            Ok(Arc::new(FileStore::open(path.clone()).await?))
        }
    }
}

fn colored_state(state: WorkflowState) -> String {
    let text = state.to_string();
    match state {
        WorkflowState::Succeeded => text.green().bold().to_string(),
        WorkflowState::Failed => text.red().bold().to_string(),
        WorkflowState::Aborted | WorkflowState::Aborting => text.yellow().bold().to_string(),
        WorkflowState::Submitted | WorkflowState::Running => text,
    }
}

fn colored_status(status: &CallExecutionStatus) -> String {
    let text = status.name();
    match status {
        CallExecutionStatus::Done(_) => text.green().to_string(),
        CallExecutionStatus::Failed(_) => text.red().to_string(),
        CallExecutionStatus::Aborted => text.yellow().to_string(),
        _ => text.dimmed().to_string(),
    }
}

/// Prints the outcome of one workflow run.
fn print_report(snapshot: &WorkflowSnapshot) {
    println!();
    println!("{} {} ({})", "Workflow".bold(), snapshot.name, snapshot.id);
    println!("State: {}", colored_state(snapshot.state));

    println!();
    println!("{}", "Calls:".bold());
    for (instance, call) in &snapshot.calls {
        println!(
            "  {:<32} {:<10} attempt {}",
            instance.to_string(),
            colored_status(&call.status),
            call.attempt
        );
    }

    if let Some(outputs) = &snapshot.outputs {
        println!();
        println!("{}", "Outputs:".bold());
        for (name, value) in outputs {
            println!("  {} = {}", name, value);
        }
    }

    if !snapshot.failures.is_empty() {
        println!();
        println!("{}", "Failures:".bold());
        for failure in &snapshot.failures {
            println!("  {}", failure.to_string().red());
        }
    }

    if !snapshot.logs.is_empty() {
        println!();
        println!("{}", "Logs:".bold());
        for logs in snapshot.logs.values() {
            println!("  {}", logs.key);
            println!("    stdout: {}", logs.stdout.display());
            println!("    stderr: {}", logs.stderr.display());
        }
    }

    print!("{}", snapshot.timeline.gantt_chart());
}

/// Main application entry point. Returns whether every workflow succeeded.
async fn run() -> Result<bool, Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let config = engine_config(&cli)?;
    let store = open_store(&config.store).await?;
    let backends = BackendRegistry::from_config(&config);
    let manager = WorkflowManager::new(config, backends, store);

    let mut ids: Vec<WorkflowId> = Vec::new();
    if cli.restart {
        let restarted = manager.restart().await?;
        info!("Restarted {} unfinished workflows", restarted.len());
        ids.extend(restarted);
    }

    if let Some(path) = &cli.workflow_path {
        let sources = load_sources(path, cli.inputs_path.as_deref(), cli.options_path.as_deref())
            .map_err(|e| {
                error!("Failed to load workflow: {}", e);
                format!("Could not load workflow from '{}': {}", path.display(), e)
            })?;
        let id = manager.submit(sources).await?;
        info!("Workflow submitted: {}", id);
        ids.push(id);
    }

    let mut succeeded = true;
    for id in ids {
        let snapshot = tokio::select! {
            snapshot = manager.wait(id) => snapshot?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting running workflows");
                manager.shutdown().await;
                manager.wait(id).await?
            }
        };
        print_report(&snapshot);
        succeeded &= snapshot.state == WorkflowState::Succeeded;
    }

    Ok(succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
