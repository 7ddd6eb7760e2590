//! Migration Engine Library
//!
//! Registers discrete changes to a persistent store, orders them by declared
//! dependencies, applies them one at a time and records each success in a
//! durable ledger.

pub mod cli;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logic;
pub mod manifest;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod unit;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use descriptor::{DescriptorBuilder, MigrationDescriptor, MigrationKind};
pub use engine::{BatchReport, ExecutionResult, HaltReason, MigrationManager, ValidationReport};
pub use error::{EngineError, Result};
pub use ledger::{AuditEvent, AuditEventKind, LedgerEntry, LedgerStore, MemoryStore, TargetStore};
#[cfg(feature = "sqlite")]
pub use ledger::SqliteStore;
pub use logic::status::{StatusReport, UnitState, UnitStatus};
pub use manifest::{ManifestError, SqlMigration};
pub use registry::MigrationRegistry;
pub use shutdown::StopSignal;
pub use state::{MigrationState, StateTransitionError};
pub use unit::{FnMigration, MigrationContext, MigrationUnit, StepFn, step};
