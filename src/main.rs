//! access-pipeline CLI
//!
//! Computes network distances from every origin to each destination class
//! and reports whether the run reached its completion goal.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use access_pipeline::config::EngineKind;
use access_pipeline::haversine::HaversineEngine;
use access_pipeline::license::TokenPool;
use access_pipeline::osrm::OsrmEngine;
use access_pipeline::{
    Config, MemoryCatalog, PartitionCatalog, ResultStore, RoutingEngine, RunController, RunStatus,
    completion_goal,
};

#[derive(Parser)]
#[command(name = "access-pipeline")]
#[command(about = "Network distances from origins to destination classes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Show progress and run log entries needing review
    Status,

    /// Validate configuration and catalog
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None | Some(Commands::Run) => run_command(&cli.config, cli.workers),
        Some(Commands::Status) => status_command(&cli.config).map(|()| ExitCode::SUCCESS),
        Some(Commands::Validate) => validate_command(&cli.config).map(|()| ExitCode::SUCCESS),
        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(&output).map(|()| ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path, workers: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if let Some(workers) = workers {
        config.pool.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn load_catalog(config: &Config) -> Result<MemoryCatalog> {
    tracing::info!("Loading catalog from {}", config.catalog.path);
    let catalog = MemoryCatalog::load_sqlite(&config.catalog)
        .with_context(|| format!("failed to load catalog from {}", config.catalog.path))?;
    tracing::info!(
        partitions = catalog.list_partitions().len(),
        origins = catalog.origin_count(),
        "Catalog loaded"
    );
    Ok(catalog)
}

fn run_command(config_path: &Path, workers: Option<usize>) -> Result<ExitCode> {
    let config = load_config(config_path, workers)?;
    let catalog = load_catalog(&config)?;

    let licenses = TokenPool::new(config.licenses());
    let wait = Duration::from_secs(config.routing.license_wait_secs);

    let verdict = match config.routing.engine {
        EngineKind::Osrm => {
            let engine = OsrmEngine::new(config.routing.osrm.clone()).with_licenses(licenses, wait);
            execute(&config, &catalog, &engine)?
        }
        EngineKind::Haversine => {
            let engine = HaversineEngine::new(config.routing.circuity).with_licenses(licenses, wait);
            execute(&config, &catalog, &engine)?
        }
    };

    Ok(ExitCode::from(verdict))
}

fn execute<E: RoutingEngine>(config: &Config, catalog: &MemoryCatalog, engine: &E) -> Result<u8> {
    let report = RunController::new(config, catalog, engine).run()?;
    println!("{}", report.verdict);
    Ok(report.verdict.exit_code())
}

fn status_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, None)?;
    let catalog = load_catalog(&config)?;
    let goal = completion_goal(&catalog, &config.classes);

    let store = ResultStore::open(&config.store)?;
    store.bootstrap()?;
    let processed = store.progress().current()?;

    println!("\n=== Progress ===");
    println!("Origins: {}", goal.origins);
    println!("Eligible classes: {}", goal.eligible.len());
    if !goal.skipped.is_empty() {
        println!("Skipped classes: {}", goal.skipped.join(", "));
    }
    println!("Processed: {processed}/{}", goal.total);

    println!("\n=== Run Log ===");
    for (status, count) in store.run_log_summary()? {
        println!("{status:<28}{count}");
    }

    for status in [RunStatus::NoSolution, RunStatus::Error] {
        let entries = store.run_log_by_status(status)?;
        if entries.is_empty() {
            continue;
        }
        println!("\n=== Review: {status} ===");
        for entry in entries {
            println!(
                "partition {} / {}: solved {}, unresolved {}{}",
                entry.partition_id,
                entry.dest_class,
                entry.solved,
                entry.unresolved,
                entry.message.map(|m| format!(" ({m})")).unwrap_or_default()
            );
        }
    }
    println!();
    Ok(())
}

fn validate_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, None)?;
    let catalog = load_catalog(&config)?;
    let goal = completion_goal(&catalog, &config.classes);
    for name in &goal.skipped {
        println!("Class '{name}' has too few destinations and will be skipped");
    }
    println!(
        "Configuration is valid: {} origins, {} eligible classes, goal {}",
        goal.origins,
        goal.eligible.len(),
        goal.total
    );
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = Config::sample().to_yaml()?;
    let contents = format!(
        "# access-pipeline configuration\n\
         # classes[].mode is 'closest' (nearest destination) or 'within' (every destination within cutoff_m)\n\
         # routing.engine is 'osrm' or 'haversine'\n\n{yaml}"
    );
    std::fs::write(output, contents)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        let cli = Cli::try_parse_from(["access-pipeline"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
    }

    #[test]
    fn test_cli_parse_worker_override() {
        let cli = Cli::try_parse_from(["access-pipeline", "run", "-w", "8", "-c", "region.yaml"]).expect("parse");
        assert_eq!(cli.workers, Some(8));
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_generated_config_loads() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("config.yaml");
        generate_config_command(&path).expect("generate");
        let config = load_config(&path, Some(2)).expect("load");
        assert_eq!(config.pool.workers, 2);
    }
}
