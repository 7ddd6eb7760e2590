//! Migration unit contract.
//!
//! A migration unit is one discrete change plus an optional compensating
//! action. Units are supplied by the integrator; the coordinator only decides
//! when (and whether) `apply` and `revert` run.
//!
//! # Contract
//!
//! - `apply()`: performs the change against the target store. Called at most
//!   once per descriptor id; the coordinator enforces this via the ledger.
//! - `revert()`: best-effort compensation, only called when the descriptor
//!   declares `supports_rollback`.
//! - `dependencies_satisfied()`: by default checks the ledger for an active
//!   entry per declared dependency. Override for cross-store checks.
//!
//! # Example
//!
//! ```
//! use migration_engine::descriptor::MigrationDescriptor;
//! use migration_engine::unit::FnMigration;
//!
//! let descriptor = MigrationDescriptor::builder("0001_users", "Create users")
//!     .reversible()
//!     .build()
//!     .unwrap();
//!
//! let unit = FnMigration::new(descriptor, |ctx| {
//!     ctx.target().execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY)")?;
//!     Ok(())
//! })
//! .with_revert(|ctx| {
//!     ctx.target().execute_batch("DROP TABLE users")?;
//!     Ok(())
//! });
//! # let _ = unit;
//! ```

use std::fmt;

use crate::descriptor::MigrationDescriptor;
use crate::error::{EngineError, Result};
use crate::ledger::{LedgerStore, StoreError, TargetStore};

/// Explicit context handed to every unit call.
#[derive(Clone, Copy)]
pub struct MigrationContext<'a> {
    ledger: &'a dyn LedgerStore,
    target: &'a dyn TargetStore,
    dry_run: bool,
}

impl<'a> MigrationContext<'a> {
    pub fn new(ledger: &'a dyn LedgerStore, target: &'a dyn TargetStore, dry_run: bool) -> Self {
        Self {
            ledger,
            target,
            dry_run,
        }
    }

    /// Read access to the ledger
    #[inline]
    pub fn ledger(&self) -> &'a dyn LedgerStore {
        self.ledger
    }

    /// The store the unit mutates
    #[inline]
    pub fn target(&self) -> &'a dyn TargetStore {
        self.target
    }

    #[inline]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

impl fmt::Debug for MigrationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// Trait implemented by every migration.
pub trait MigrationUnit {
    /// Immutable metadata for this unit
    fn descriptor(&self) -> &MigrationDescriptor;

    /// Apply the change.
    fn apply(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<()>;

    /// Undo the change.
    ///
    /// Only invoked when `descriptor().supports_rollback` is true.
    fn revert(&self, _ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!(
            "migration '{}' does not implement revert",
            self.descriptor().id
        )
    }

    /// Whether every declared dependency has an active ledger entry.
    fn dependencies_satisfied(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> std::result::Result<bool, StoreError> {
        for dep in &self.descriptor().dependencies {
            if !ctx.ledger().is_applied(dep)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unit-specific static checks beyond the descriptor's own
    fn validation_errors(&self) -> Vec<String> {
        Vec::new()
    }
}

impl fmt::Debug for dyn MigrationUnit + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MigrationUnit")
            .field(&self.descriptor().id)
            .finish()
    }
}

/// Boxed apply/revert step
pub type StepFn = Box<dyn Fn(&MigrationContext<'_>) -> anyhow::Result<()>>;

/// Box a closure as a [`StepFn`]
pub fn step<F>(f: F) -> StepFn
where
    F: Fn(&MigrationContext<'_>) -> anyhow::Result<()> + 'static,
{
    Box::new(f)
}

/// Closure-backed migration unit
pub struct FnMigration {
    descriptor: MigrationDescriptor,
    apply: StepFn,
    revert: Option<StepFn>,
}

impl FnMigration {
    /// Create a unit without a revert step
    pub fn new<F>(descriptor: MigrationDescriptor, apply: F) -> Self
    where
        F: Fn(&MigrationContext<'_>) -> anyhow::Result<()> + 'static,
    {
        Self {
            descriptor,
            apply: Box::new(apply),
            revert: None,
        }
    }

    /// Attach a revert step
    pub fn with_revert<F>(mut self, revert: F) -> Self
    where
        F: Fn(&MigrationContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.revert = Some(Box::new(revert));
        self
    }

    /// Build a unit from optional parts, rejecting a descriptor whose
    /// `supports_rollback` disagrees with the presence of `revert`.
    pub fn from_parts(
        descriptor: MigrationDescriptor,
        apply: StepFn,
        revert: Option<StepFn>,
    ) -> Result<Self> {
        let unit = Self {
            descriptor,
            apply,
            revert,
        };
        let errors = unit.validation_errors();
        if let Some(first) = errors.into_iter().next() {
            return Err(EngineError::validation(&unit.descriptor.id, first));
        }
        Ok(unit)
    }

    #[inline]
    pub fn has_revert(&self) -> bool {
        self.revert.is_some()
    }
}

impl fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMigration")
            .field("descriptor", &self.descriptor)
            .field("has_revert", &self.revert.is_some())
            .finish_non_exhaustive()
    }
}

impl MigrationUnit for FnMigration {
    fn descriptor(&self) -> &MigrationDescriptor {
        &self.descriptor
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        (self.apply)(ctx)
    }

    fn revert(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        match &self.revert {
            Some(revert) => revert(ctx),
            None => anyhow::bail!(
                "migration '{}' does not implement revert",
                self.descriptor.id
            ),
        }
    }

    fn validation_errors(&self) -> Vec<String> {
        match (self.descriptor.supports_rollback, self.revert.is_some()) {
            (true, false) => vec!["supports_rollback is set but no revert step was provided".into()],
            (false, true) => vec!["a revert step was provided but supports_rollback is false".into()],
            _ => Vec::new(),
        }
    }
}
