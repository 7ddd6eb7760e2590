use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::EngineConfig;

/// Migration Engine - ordered, dependency-aware database migrations
#[derive(Parser, Debug)]
#[command(name = "migration-engine")]
#[command(about = "Apply, roll back and inspect migrations recorded in a durable ledger")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database holding the ledger (overrides the config file)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory of JSON migration manifests (overrides the config file)
    #[arg(long, global = true)]
    pub migrations: Option<PathBuf>,

    /// Dry-run mode: report what would run without applying anything.
    ///
    /// No migration body runs, no lock is taken and the ledger is not
    /// written.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Copy the database to this file before a batch mutates it
    #[arg(long, global = true)]
    pub backup: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Ensure the ledger tables exist
    Init,
    /// Apply all pending migrations
    Run,
    /// Apply a single migration
    RunOne {
        /// Migration id
        id: String,
    },
    /// Revert an applied migration
    Rollback {
        /// Migration id
        id: String,
    },
    /// Show applied/pending/unresolved counts and per-migration state
    Status,
    /// Show the audit log
    History,
    /// Statically validate all manifests
    Validate,
    /// Force-release a stale advisory lock
    Unlock,
    /// Acknowledge a failed revert after manual repair
    ClearBlock {
        /// Migration id named in the block
        id: String,
    },
}

impl Commands {
    /// Whether the command needs the manifest directory loaded
    pub fn needs_manifests(&self) -> bool {
        matches!(
            self,
            Self::Run | Self::RunOne { .. } | Self::Rollback { .. } | Self::Status | Self::Validate
        )
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Apply flag overrides on top of file/default configuration
    pub fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(migrations) = &self.migrations {
            config.migrations_dir = migrations.clone();
        }
        if let Some(backup) = &self.backup {
            config.backup_path = Some(backup.clone());
        }
    }
}
