//! Migration Engine - Main entry point
//!
//! Thin wrapper over the library: loads SQL manifests from a directory and
//! drives a [`MigrationManager`] backed by a SQLite database.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use migration_engine::cli::{Cli, Commands};
use migration_engine::config::EngineConfig;
use migration_engine::engine::{BatchReport, ExecutionResult, MigrationManager};
use migration_engine::ledger::SqliteStore;
use migration_engine::logic::resolver;
use migration_engine::manifest;
use migration_engine::shutdown::{self, StopSignal};
use migration_engine::unit::MigrationUnit;

/// Initialize tracing; logs go to stderr so `--json` output stays clean
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Pick a backup destination that does not exist yet
fn backup_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("backup");
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, stamp, ext),
        None => format!("{}-{}", stem, stamp),
    };
    path.with_file_name(name)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    let mark = if result.success { "✓" } else { "✗" };
    let mut line = format!("{} {} ({} ms)", mark, result.id, result.duration_ms);
    if result.dry_run {
        line.push_str(" [dry run]");
    }
    if result.rolled_back {
        line.push_str(" [revert attempted]");
    }
    println!("{}", line);
    if let Some(err) = &result.error {
        println!("    {}", err);
    }
}

fn print_batch(report: &BatchReport) {
    if report.results.is_empty() {
        println!("Nothing to apply");
    }
    for result in &report.results {
        print_result(result);
    }
    if let Some(halt) = &report.halt {
        println!("Batch {}", halt);
    }
}

/// Run one command; `Ok(false)` means the command completed but failed
fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;

    let stop = StopSignal::new();
    if let Err(e) = shutdown::init_signal_handlers(stop.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let store = Arc::new(
        SqliteStore::open_with_table(&config.database, &config.ledger_table)
            .with_context(|| format!("Failed to open database {:?}", config.database))?
            .with_lock_name(config.lock_name.clone()),
    );

    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()))
        .with_config(config.clone())
        .with_stop_signal(stop);
    if let Some(backup) = config.backup_path.clone() {
        let store = store.clone();
        manager = manager.with_before_batch(move |ids| {
            let dest = backup_destination(&backup);
            info!(backup = %dest.display(), pending = ids.len(), "Backing up database");
            store
                .backup_to(&dest)
                .with_context(|| format!("Failed to back up database to {:?}", dest))?;
            Ok(())
        });
    }
    manager.initialize()?;

    if cli.command == Commands::Validate {
        return validate_manifests(&manager, &config, cli.json);
    }

    if cli.command.needs_manifests() {
        for unit in manifest::load_from_directory(&config.migrations_dir)? {
            manager.register(unit)?;
        }
    }

    match cli.command {
        Commands::Init => {
            if cli.json {
                print_json(&serde_json::json!({ "initialized": true, "table": config.ledger_table }))?;
            } else {
                println!("✓ Ledger '{}' ready in {:?}", config.ledger_table, config.database);
            }
            Ok(true)
        }
        Commands::Run => {
            let report = manager.run_pending(cli.dry_run)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_batch(&report);
            }
            Ok(report.is_success())
        }
        Commands::RunOne { id } => {
            let result = manager.run_one(&id, cli.dry_run)?;
            if cli.json {
                print_json(&result)?;
            } else {
                print_result(&result);
            }
            Ok(result.success)
        }
        Commands::Rollback { id } => {
            if cli.dry_run {
                println!("Would roll back {} (dry run)", id);
                return Ok(true);
            }
            let result = manager.rollback(&id)?;
            if cli.json {
                print_json(&result)?;
            } else {
                print_result(&result);
            }
            Ok(result.success)
        }
        Commands::Status => {
            let report = manager.status()?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "total: {}  applied: {}  pending: {}  unresolved: {}  failed: {}",
                    report.total, report.applied, report.pending, report.unresolved, report.failed
                );
                for unit in &report.per_unit {
                    println!(
                        "  {:<12} {:<8} {} ({} v{})",
                        unit.state.to_string(),
                        unit.kind.to_string(),
                        unit.id,
                        unit.name,
                        unit.version
                    );
                }
                if let Some(block) = manager.blocked() {
                    println!("✗ Blocked by failed rollback of '{}': {}", block.migration_id, block.reason);
                }
            }
            Ok(true)
        }
        Commands::History => {
            let events = manager.history()?;
            if cli.json {
                print_json(&events)?;
            } else {
                for event in &events {
                    println!("{}", event);
                }
            }
            Ok(true)
        }
        Commands::Unlock => {
            match manager.lock_info()? {
                Some(info) => {
                    manager.force_unlock()?;
                    println!("✓ Released lock held by '{}'", info.holder_id);
                }
                None => println!("No lock held"),
            }
            Ok(true)
        }
        Commands::ClearBlock { id } => {
            manager.clear_block(&id)?;
            println!("✓ Cleared block for '{}'", id);
            Ok(true)
        }
        Commands::Validate => Ok(true),
    }
}

#[derive(Serialize)]
struct ManifestValidation {
    id: String,
    valid: bool,
    applied: bool,
    errors: Vec<String>,
}

/// Validate every manifest, then check the dependency graph as a whole
fn validate_manifests(manager: &MigrationManager, config: &EngineConfig, json: bool) -> Result<bool> {
    let manifests = manifest::load_from_directory(&config.migrations_dir)?;
    let mut results = Vec::with_capacity(manifests.len());
    for unit in &manifests {
        // Applied manifests only get the static checks
        let applied = manager.ledger().is_applied(&unit.descriptor.id)?;
        let errors = if applied {
            let mut errors = unit.descriptor.structural_errors();
            errors.extend(unit.validation_errors());
            errors
        } else {
            manager.validate(unit)?.errors
        };
        results.push(ManifestValidation {
            id: unit.descriptor.id.clone(),
            valid: errors.is_empty(),
            applied,
            errors,
        });
    }

    let descriptors: Vec<_> = manifests.iter().map(|m| &m.descriptor).collect();
    let mut graph_error = None;
    let mut seen = std::collections::HashSet::new();
    for d in &descriptors {
        if !seen.insert(d.id.as_str()) {
            graph_error = Some(format!("Duplicate migration id: {}", d.id));
        }
    }
    if graph_error.is_none() {
        if let Err(e) = resolver::resolve(&descriptors, &Default::default()) {
            graph_error = Some(migration_engine::EngineError::from(e).to_string());
        }
    }

    let valid = graph_error.is_none() && results.iter().all(|r| r.valid);
    if json {
        print_json(&serde_json::json!({
            "valid": valid,
            "manifests": results,
            "graph_error": graph_error,
        }))?;
    } else {
        for r in &results {
            if r.valid {
                println!("✓ {}{}", r.id, if r.applied { " (applied)" } else { "" });
            } else {
                println!("✗ {}: {}", r.id, r.errors.join("; "));
            }
        }
        if let Some(err) = &graph_error {
            println!("✗ {}", err);
        }
    }
    Ok(valid)
}
