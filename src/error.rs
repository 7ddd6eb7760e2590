//! Error handling module for the migration engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Module-level errors (`StoreError`, `ResolveError`, `ManifestError`,
//! `StateTransitionError`) convert into [`EngineError`] so every public
//! operation of the coordinator returns the same `Result` alias.

use thiserror::Error;

use crate::ledger::StoreError;
use crate::manifest::ManifestError;
use crate::logic::resolver::ResolveError;
use crate::state::StateTransitionError;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Two units share an id (registration-time)
    #[error("Duplicate migration id: {id}")]
    DuplicateId { id: String },

    /// A declared dependency has no registered unit
    #[error("Migration '{id}' depends on unregistered migration '{missing}'")]
    DependencyUnresolved { id: String, missing: String },

    /// A resolution pass made no progress while units were still pending
    #[error("Dependency cycle detected among: {}", remaining.join(", "))]
    DependencyCycle { remaining: Vec<String> },

    /// A unit's apply failed
    #[error("Migration '{id}' failed: {source:#}")]
    Execution {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A unit's revert failed after its apply had already failed
    #[error(
        "Rollback of migration '{id}' failed (apply error: {apply_error}; revert error: {revert_error}); manual intervention required"
    )]
    Rollback {
        id: String,
        apply_error: String,
        revert_error: String,
    },

    /// A descriptor failed static checks
    #[error("Validation error for '{id}': {}", errors.join("; "))]
    Validation { id: String, errors: Vec<String> },

    /// No unit with this id is registered
    #[error("Migration '{id}' is not registered")]
    NotRegistered { id: String },

    /// The unit already has an unrevoked ledger entry
    #[error("Migration '{id}' is already applied")]
    AlreadyApplied { id: String },

    /// The unit has no unrevoked ledger entry to roll back
    #[error("Migration '{id}' is not applied")]
    NotApplied { id: String },

    /// Dependencies of a single-unit run are not applied yet
    #[error("Migration '{id}' has unapplied dependencies: {}", missing.join(", "))]
    DependenciesUnsatisfied { id: String, missing: Vec<String> },

    /// Explicit rollback requested for a unit without a revert
    #[error("Migration '{id}' does not support rollback")]
    RollbackUnsupported { id: String },

    /// Explicit rollback would orphan applied dependents
    #[error("Cannot roll back '{id}': applied dependents {}", dependents.join(", "))]
    DependentsApplied { id: String, dependents: Vec<String> },

    /// A previous revert failure has not been cleared by an operator
    #[error("Engine is blocked by failed rollback of '{id}': {reason}")]
    Blocked { id: String, reason: String },

    /// `clear_block` named a unit that is not blocking the engine
    #[error("No failed rollback of '{id}' is blocking the engine")]
    NotBlocked { id: String },

    /// Another coordinator holds the advisory lock
    #[error("Migration lock is held by '{holder}' until {expires_at}")]
    LockHeld { holder: String, expires_at: String },

    /// The before-batch hook refused to continue
    #[error("Before-batch hook failed: {0:#}")]
    Hook(anyhow::Error),

    /// Ledger or target store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Manifest loading failure
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Invalid run state transition (internal consistency)
    #[error("State error: {0}")]
    Transition(#[from] StateTransitionError),

}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

// Convenient error constructors
impl EngineError {
    /// Create a validation error for a single problem
    pub fn validation(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            id: id.into(),
            errors: vec![msg.into()],
        }
    }

    /// Returns true for errors raised before any store mutation
    /// (registration, validation and resolution mistakes).
    pub fn is_configuration_mistake(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId { .. }
                | Self::DependencyUnresolved { .. }
                | Self::DependencyCycle { .. }
                | Self::Validation { .. }
        )
    }
}

impl From<ResolveError> for EngineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unresolved { id, missing } => Self::DependencyUnresolved { id, missing },
            ResolveError::Cycle { remaining } => Self::DependencyCycle { remaining },
        }
    }
}
