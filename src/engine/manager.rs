//! Execution coordinator
//!
//! [`MigrationManager`] owns the registry and drives every unit through
//! resolve → apply → ledger write, reverting and halting on failure.
//!
//! # Design
//!
//! - **Explicit injection**: the ledger and target stores are passed in; the
//!   context handed to units is built per call
//! - **Sequential**: one unit at a time, in resolved order
//! - **Halt on failure**: the first failed unit stops the batch; its result
//!   is returned, never raised
//! - **Single writer**: non-dry-run batches read the pending set and run
//!   under the ledger's advisory lock, renewing the lease before each unit
//! - **Operator block**: a failed revert leaves the target in an unknown
//!   state, so every later mutation is refused until [`MigrationManager::clear_block`]
//!
//! # Example
//!
//! ```
//! use migration_engine::descriptor::MigrationDescriptor;
//! use migration_engine::engine::MigrationManager;
//! use migration_engine::ledger::MemoryStore;
//! use migration_engine::unit::FnMigration;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
//! manager.initialize().unwrap();
//!
//! let descriptor = MigrationDescriptor::builder("0001_users", "Create users").build().unwrap();
//! manager
//!     .register(FnMigration::new(descriptor, |ctx| {
//!         ctx.target().execute_batch("CREATE TABLE users (id INTEGER)")?;
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let report = manager.run_pending(false).unwrap();
//! assert!(report.is_success());
//! assert_eq!(manager.status().unwrap().applied, 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::descriptor::MigrationDescriptor;
use crate::error::{EngineError, Result};
use crate::ledger::{
    AuditEvent, AuditEventKind, LedgerEntry, LedgerStore, LockAttempt, LockInfo, TargetStore,
};
use crate::logic::resolver;
use crate::logic::status::{StatusReport, StatusReporter};
use crate::registry::MigrationRegistry;
use crate::shutdown::StopSignal;
use crate::state::{MigrationState, UnitRun};
use crate::unit::{FnMigration, MigrationContext, MigrationUnit, StepFn};

/// Hook run once before a non-dry-run batch touches the target store.
/// Receives the ids about to run.
pub type BeforeBatchHook = Box<dyn Fn(&[String]) -> anyhow::Result<()>>;

// ============================================================================
// Result Types
// ============================================================================

/// Outcome of running (or reverting) one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// A revert was attempted as part of this run
    pub rolled_back: bool,
    pub dry_run: bool,
    /// Number of `apply` invocations (0 for dry-run and rollbacks)
    pub attempts: u32,
    /// Revert failure text, when the compensating action failed too
    pub rollback_error: Option<String>,
}

impl ExecutionResult {
    fn synthetic(id: &str) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            error: None,
            duration_ms: 0,
            rolled_back: false,
            dry_run: true,
            attempts: 0,
            rollback_error: None,
        }
    }

    fn halt_reason(&self) -> Option<HaltReason> {
        if self.success {
            None
        } else if self.rollback_error.is_some() {
            Some(HaltReason::RollbackFailed { id: self.id.clone() })
        } else {
            Some(HaltReason::Failed { id: self.id.clone() })
        }
    }
}

/// Why a batch stopped before running every resolved unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// A unit's apply failed
    Failed { id: String },
    /// A unit's apply failed and its revert failed too
    RollbackFailed { id: String },
    /// A stop was requested; `before` is the first unit not started
    Cancelled { before: String },
    /// The lease expired mid-batch and another coordinator took the lock
    LockLost { before: String, holder: String },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { id } => write!(f, "halted after '{}' failed", id),
            Self::RollbackFailed { id } => {
                write!(f, "halted after '{}' failed and could not be reverted", id)
            }
            Self::Cancelled { before } => write!(f, "cancelled before '{}'", before),
            Self::LockLost { before, holder } => {
                write!(f, "lost the migration lock to '{}' before '{}'", holder, before)
            }
        }
    }
}

/// Results of one `run_pending` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<ExecutionResult>,
    pub halt: Option<HaltReason>,
}

impl BatchReport {
    /// True when every resolved unit ran and succeeded
    pub fn is_success(&self) -> bool {
        self.halt.is_none()
    }

    pub fn applied_count(&self) -> usize {
        self.results.iter().filter(|r| r.success && !r.dry_run).count()
    }
}

/// Outcome of [`MigrationManager::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// A failed revert awaiting operator acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorBlock {
    pub migration_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Advisory Lock Guard
// ============================================================================

/// Holds the ledger lock; releases it on drop
struct LockGuard<'a> {
    ledger: &'a dyn LedgerStore,
    holder: &'a str,
}

impl<'a> LockGuard<'a> {
    fn acquire(
        ledger: &'a dyn LedgerStore,
        holder: &'a str,
        config: &EngineConfig,
    ) -> Result<Self> {
        match ledger.try_lock(holder, config.lock_ttl())? {
            LockAttempt::Acquired => {
                tracing::debug!(holder, "Acquired migration lock");
                Ok(Self { ledger, holder })
            }
            LockAttempt::Held(info) => Err(EngineError::LockHeld {
                holder: info.holder_id,
                expires_at: info.expires_at.to_rfc3339(),
            }),
        }
    }
}

impl LockGuard<'_> {
    /// Extend the lease for another `ttl`. Returns the new holder if the
    /// lease expired and was taken over.
    fn renew(&self, ttl: std::time::Duration) -> Result<Option<LockInfo>> {
        match self.ledger.try_lock(self.holder, ttl)? {
            LockAttempt::Acquired => Ok(None),
            LockAttempt::Held(info) => Ok(Some(info)),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.ledger.unlock(self.holder) {
            Ok(()) => tracing::debug!(holder = self.holder, "Released migration lock"),
            Err(e) => tracing::warn!(holder = self.holder, "Failed to release migration lock: {}", e),
        }
    }
}

// ============================================================================
// Unit Execution
// ============================================================================

/// Borrowed pieces needed to run one unit
struct Executor<'a> {
    ledger: &'a dyn LedgerStore,
    target: &'a dyn TargetStore,
    max_attempts: u32,
}

impl Executor<'_> {
    fn context(&self) -> MigrationContext<'_> {
        MigrationContext::new(self.ledger, self.target, false)
    }

    /// Append an audit event without letting a failed write interrupt the
    /// unit's state handling
    fn record_event(&self, id: &str, kind: AuditEventKind, detail: Option<String>) {
        if let Err(e) = self.ledger.append_event(&AuditEvent::new(id, kind, detail)) {
            tracing::error!(migration = %id, event = %kind, "Failed to write audit event: {}", e);
        }
    }

    fn failed_result(id: &str, error: String, attempts: u32, started: Instant) -> ExecutionResult {
        ExecutionResult {
            id: id.to_string(),
            success: false,
            error: Some(error),
            duration_ms: elapsed_ms(started),
            rolled_back: false,
            dry_run: false,
            attempts,
            rollback_error: None,
        }
    }

    /// Apply one unit. Execution failures become a failed result; only
    /// ledger-write and state errors are returned as `Err`.
    fn apply(&self, unit: &dyn MigrationUnit, run: &mut UnitRun) -> Result<ExecutionResult> {
        let descriptor = unit.descriptor();
        let id = descriptor.id.as_str();
        let ctx = self.context();
        let started = Instant::now();

        if !run.current().is_runnable() {
            *run = UnitRun::new(id);
        }
        run.transition_to(MigrationState::Running)?;
        tracing::info!(migration = %id, kind = %descriptor.kind, "Applying migration");

        // Nothing ran, so there is nothing to revert
        if !unit.dependencies_satisfied(&ctx)? {
            let error = EngineError::Execution {
                id: id.to_string(),
                source: anyhow::anyhow!("declared dependencies are not satisfied"),
            }
            .to_string();
            run.fail(error.clone())?;
            self.record_event(id, AuditEventKind::Failed, Some(error.clone()));
            tracing::warn!(migration = %id, "{}", error);
            return Ok(Self::failed_result(id, error, 0, started));
        }

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match unit.apply(&ctx) {
                Ok(()) => break Ok(()),
                Err(e) if attempts < self.max_attempts => {
                    tracing::warn!(migration = %id, attempt = attempts, "Apply failed, retrying: {:#}", e);
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ledger.record_applied(&LedgerEntry::applied(descriptor, Utc::now())) {
                    run.fail(format!("ledger write failed: {}", e))?;
                    return Err(e.into());
                }
                run.transition_to(MigrationState::Applied)?;
                self.record_event(id, AuditEventKind::Applied, None);

                let duration_ms = elapsed_ms(started);
                tracing::info!(migration = %id, duration_ms, attempts, "Applied migration");
                Ok(ExecutionResult {
                    id: id.to_string(),
                    success: true,
                    error: None,
                    duration_ms,
                    rolled_back: false,
                    dry_run: false,
                    attempts,
                    rollback_error: None,
                })
            }
            Err(source) => {
                let apply_error = format!("{:#}", source);
                let error = EngineError::Execution {
                    id: id.to_string(),
                    source,
                }
                .to_string();
                run.fail(apply_error.clone())?;
                tracing::warn!(migration = %id, attempts, "{}", error);

                let mut result = Self::failed_result(id, error, attempts, started);
                let failed_detail = apply_error.clone();
                let mut rollback_detail = None;

                if descriptor.supports_rollback {
                    result.rolled_back = true;
                    match unit.revert(&ctx) {
                        Ok(()) => {
                            tracing::info!(migration = %id, "Reverted failed migration");
                        }
                        Err(revert) => {
                            let revert_error = format!("{:#}", revert);
                            let err = EngineError::Rollback {
                                id: id.to_string(),
                                apply_error,
                                revert_error: revert_error.clone(),
                            };
                            tracing::error!(migration = %id, "{}", err);
                            rollback_detail = Some(err.to_string());
                            result.error = Some(err.to_string());
                            result.rollback_error = Some(revert_error);
                        }
                    }
                } else {
                    tracing::warn!(
                        migration = %id,
                        "Migration does not support rollback; manual intervention may be required"
                    );
                }

                self.record_event(id, AuditEventKind::Failed, Some(failed_detail));
                if let Some(detail) = rollback_detail {
                    self.record_event(id, AuditEventKind::RollbackFailed, Some(detail));
                }

                result.duration_ms = elapsed_ms(started);
                Ok(result)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn default_holder_id() -> String {
    format!("pid-{}-{}", std::process::id(), Utc::now().timestamp_millis())
}

// ============================================================================
// Coordinator
// ============================================================================

/// Registers units and executes them against a ledger and a target store
pub struct MigrationManager {
    ledger: Box<dyn LedgerStore>,
    target: Box<dyn TargetStore>,
    registry: MigrationRegistry,
    config: EngineConfig,
    stop: StopSignal,
    before_batch: Option<BeforeBatchHook>,
    holder_id: String,
    runs: HashMap<String, UnitRun>,
    block: Option<OperatorBlock>,
}

impl MigrationManager {
    pub fn new(ledger: Box<dyn LedgerStore>, target: Box<dyn TargetStore>) -> Self {
        Self {
            ledger,
            target,
            registry: MigrationRegistry::new(),
            config: EngineConfig::default(),
            stop: StopSignal::new(),
            before_batch: None,
            holder_id: default_holder_id(),
            runs: HashMap::new(),
            block: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_before_batch<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[String]) -> anyhow::Result<()> + 'static,
    {
        self.before_batch = Some(Box::new(hook));
        self
    }

    /// Identify this coordinator in the advisory lock row
    pub fn with_lock_holder(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    /// Ensure the ledger exists and restore any persisted operator block.
    /// Safe to call on every startup.
    pub fn initialize(&mut self) -> Result<()> {
        self.ledger.ensure_schema()?;

        let mut block = None;
        for event in self.ledger.events()? {
            match event.event {
                AuditEventKind::RollbackFailed => {
                    block = Some(OperatorBlock {
                        migration_id: event.migration_id,
                        reason: event.detail.unwrap_or_default(),
                        at: event.at,
                    });
                }
                AuditEventKind::BlockCleared
                    if block.as_ref().is_some_and(|b| b.migration_id == event.migration_id) =>
                {
                    block = None;
                }
                _ => {}
            }
        }
        if let Some(b) = &block {
            tracing::error!(migration = %b.migration_id, "Engine is blocked by an unacknowledged failed rollback");
        }
        self.block = block;

        tracing::debug!(registered = self.registry.len(), "Migration engine initialized");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a unit. Fails with `Validation` or `DuplicateId`.
    pub fn register<U: MigrationUnit + 'static>(&mut self, unit: U) -> Result<()> {
        self.register_boxed(Box::new(unit))
    }

    pub fn register_boxed(&mut self, unit: Box<dyn MigrationUnit>) -> Result<()> {
        let id = unit.descriptor().id.clone();
        self.registry.register(unit)?;
        tracing::debug!(migration = %id, "Registered migration");
        Ok(())
    }

    /// Register a closure-backed unit
    pub fn register_fn(
        &mut self,
        descriptor: MigrationDescriptor,
        apply: StepFn,
        revert: Option<StepFn>,
    ) -> Result<()> {
        self.register(FnMigration::from_parts(descriptor, apply, revert)?)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Apply every pending unit in dependency order.
    ///
    /// Resolution errors are returned before anything runs. Unit failures are
    /// reported in the batch, which halts at the first one.
    pub fn run_pending(&mut self, dry_run: bool) -> Result<BatchReport> {
        if !dry_run {
            self.ensure_not_blocked()?;
        }

        if dry_run {
            let ids = self.pending_ids()?.1;
            tracing::info!(pending = ids.len(), dry_run, "Running pending migrations");
            for id in &ids {
                tracing::info!(migration = %id, "Would apply migration (dry run)");
            }
            return Ok(BatchReport {
                results: ids.iter().map(|id| ExecutionResult::synthetic(id)).collect(),
                halt: None,
            });
        }

        // The pending set is only read under the lock
        let guard = LockGuard::acquire(self.ledger.as_ref(), &self.holder_id, &self.config)?;
        let (order, ids) = self.pending_ids()?;
        tracing::info!(pending = ids.len(), dry_run, "Running pending migrations");
        if ids.is_empty() {
            return Ok(BatchReport::default());
        }

        if let Some(hook) = &self.before_batch {
            hook(ids.as_slice()).map_err(EngineError::Hook)?;
        }

        let executor = Executor {
            ledger: self.ledger.as_ref(),
            target: self.target.as_ref(),
            max_attempts: self.config.max_apply_attempts.max(1),
        };

        let mut report = BatchReport::default();
        for (&position, id) in order.iter().zip(&ids) {
            if self.stop.is_requested() {
                tracing::warn!(migration = %id, "Stop requested; halting batch");
                report.halt = Some(HaltReason::Cancelled { before: id.clone() });
                break;
            }
            if let Some(info) = guard.renew(self.config.lock_ttl())? {
                tracing::error!(migration = %id, holder = %info.holder_id, "Migration lock was taken over; halting batch");
                report.halt = Some(HaltReason::LockLost {
                    before: id.clone(),
                    holder: info.holder_id,
                });
                break;
            }
            let Some(unit) = self.registry.at(position) else {
                continue;
            };

            let run = self
                .runs
                .entry(id.clone())
                .or_insert_with(|| UnitRun::new(id.as_str()));
            let result = executor.apply(unit, run)?;

            if let Some(halt) = result.halt_reason() {
                if let Some(revert_error) = &result.rollback_error {
                    self.block = Some(OperatorBlock {
                        migration_id: id.clone(),
                        reason: revert_error.clone(),
                        at: Utc::now(),
                    });
                }
                tracing::warn!(migration = %id, "Batch {}", halt);
                report.results.push(result);
                report.halt = Some(halt);
                break;
            }
            report.results.push(result);
        }

        tracing::info!(
            applied = report.applied_count(),
            halted = report.halt.is_some(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Apply a single unit whose dependencies are already applied.
    pub fn run_one(&mut self, id: &str, dry_run: bool) -> Result<ExecutionResult> {
        if !dry_run {
            self.ensure_not_blocked()?;
        }
        let unit = self.registry.get(id).ok_or_else(|| EngineError::NotRegistered {
            id: id.to_string(),
        })?;
        let descriptor = unit.descriptor();
        if let Some(missing) = descriptor
            .dependencies
            .iter()
            .find(|dep| !self.registry.contains(dep))
        {
            return Err(EngineError::DependencyUnresolved {
                id: id.to_string(),
                missing: missing.clone(),
            });
        }

        // Ledger checks below must see what a concurrent coordinator committed
        let _guard = if dry_run {
            None
        } else {
            Some(LockGuard::acquire(self.ledger.as_ref(), &self.holder_id, &self.config)?)
        };
        if self.ledger.is_applied(id)? {
            return Err(EngineError::AlreadyApplied { id: id.to_string() });
        }
        let mut missing = Vec::new();
        for dep in &descriptor.dependencies {
            if !self.ledger.is_applied(dep)? {
                missing.push(dep.clone());
            }
        }
        let ctx = MigrationContext::new(self.ledger.as_ref(), self.target.as_ref(), dry_run);
        if !missing.is_empty() || !unit.dependencies_satisfied(&ctx)? {
            return Err(EngineError::DependenciesUnsatisfied {
                id: id.to_string(),
                missing,
            });
        }

        if dry_run {
            tracing::info!(migration = %id, "Would apply migration (dry run)");
            return Ok(ExecutionResult::synthetic(id));
        }

        if let Some(hook) = &self.before_batch {
            hook(std::slice::from_ref(&id.to_string())).map_err(EngineError::Hook)?;
        }

        let executor = Executor {
            ledger: self.ledger.as_ref(),
            target: self.target.as_ref(),
            max_attempts: self.config.max_apply_attempts.max(1),
        };
        let run = self
            .runs
            .entry(id.to_string())
            .or_insert_with(|| UnitRun::new(id));
        let result = executor.apply(unit, run)?;

        if let Some(revert_error) = &result.rollback_error {
            self.block = Some(OperatorBlock {
                migration_id: id.to_string(),
                reason: revert_error.clone(),
                at: Utc::now(),
            });
        }
        Ok(result)
    }

    /// Explicitly revert an applied unit and mark its ledger entry.
    ///
    /// A failing revert is reported as a failed result and leaves the
    /// ledger untouched.
    pub fn rollback(&mut self, id: &str) -> Result<ExecutionResult> {
        self.ensure_not_blocked()?;
        let unit = self.registry.get(id).ok_or_else(|| EngineError::NotRegistered {
            id: id.to_string(),
        })?;
        if !unit.descriptor().supports_rollback {
            return Err(EngineError::RollbackUnsupported { id: id.to_string() });
        }
        if !self.ledger.is_applied(id)? {
            return Err(EngineError::NotApplied { id: id.to_string() });
        }
        let mut dependents = Vec::new();
        for d in self.registry.dependents_of(id) {
            if self.ledger.is_applied(&d.id)? {
                dependents.push(d.id.clone());
            }
        }
        if !dependents.is_empty() {
            return Err(EngineError::DependentsApplied {
                id: id.to_string(),
                dependents,
            });
        }

        let _guard = LockGuard::acquire(self.ledger.as_ref(), &self.holder_id, &self.config)?;
        if let Some(hook) = &self.before_batch {
            hook(std::slice::from_ref(&id.to_string())).map_err(EngineError::Hook)?;
        }

        let ctx = MigrationContext::new(self.ledger.as_ref(), self.target.as_ref(), false);
        let run = self
            .runs
            .entry(id.to_string())
            .or_insert_with(|| UnitRun::starting_at(id, MigrationState::Applied));
        if run.current() != MigrationState::Applied {
            *run = UnitRun::starting_at(id, MigrationState::Applied);
        }

        tracing::info!(migration = %id, "Rolling back migration");
        let started = Instant::now();
        match unit.revert(&ctx) {
            Ok(()) => {
                self.ledger.mark_rolled_back(id, Utc::now())?;
                self.ledger
                    .append_event(&AuditEvent::new(id, AuditEventKind::RolledBack, None))?;
                run.transition_to(MigrationState::RolledBack)?;
                let duration_ms = elapsed_ms(started);
                tracing::info!(migration = %id, duration_ms, "Rolled back migration");
                Ok(ExecutionResult {
                    id: id.to_string(),
                    success: true,
                    error: None,
                    duration_ms,
                    rolled_back: true,
                    dry_run: false,
                    attempts: 0,
                    rollback_error: None,
                })
            }
            Err(e) => {
                let revert_error = format!("{:#}", e);
                tracing::error!(migration = %id, "Rollback failed: {}", revert_error);
                self.ledger.append_event(&AuditEvent::new(
                    id,
                    AuditEventKind::Failed,
                    Some(format!("revert failed: {}", revert_error)),
                ))?;
                Ok(ExecutionResult {
                    id: id.to_string(),
                    success: false,
                    error: Some(format!("Rollback of '{}' failed: {}", id, revert_error)),
                    duration_ms: elapsed_ms(started),
                    rolled_back: true,
                    dry_run: false,
                    attempts: 0,
                    rollback_error: Some(revert_error),
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Point-in-time applied/pending/unresolved view
    pub fn status(&self) -> Result<StatusReport> {
        let failures: HashMap<String, String> = self
            .runs
            .values()
            .filter(|run| run.current() == MigrationState::Failed)
            .filter_map(|run| run.last_error().map(|e| (run.id().to_string(), e.to_string())))
            .collect();
        Ok(StatusReporter::new(&self.registry, self.ledger.as_ref()).report(&failures)?)
    }

    /// Static checks plus "not already applied"
    pub fn validate(&self, unit: &dyn MigrationUnit) -> Result<ValidationReport> {
        let descriptor = unit.descriptor();
        let mut errors = descriptor.structural_errors();
        errors.extend(unit.validation_errors());
        if !descriptor.id.trim().is_empty() && self.ledger.is_applied(&descriptor.id)? {
            errors.push(format!("'{}' is already applied", descriptor.id));
        }
        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
        })
    }

    /// Audit log in sequence order
    pub fn history(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.ledger.events()?)
    }

    /// Current operator block, if any
    pub fn blocked(&self) -> Option<&OperatorBlock> {
        self.block.as_ref()
    }

    /// Acknowledge a failed revert after manual repair
    pub fn clear_block(&mut self, id: &str) -> Result<()> {
        match &self.block {
            Some(block) if block.migration_id == id => {
                self.ledger
                    .append_event(&AuditEvent::new(id, AuditEventKind::BlockCleared, None))?;
                self.block = None;
                tracing::info!(migration = %id, "Operator block cleared");
                Ok(())
            }
            _ => Err(EngineError::NotBlocked { id: id.to_string() }),
        }
    }

    /// Current advisory lock row
    pub fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.ledger.lock_info()?)
    }

    /// Remove a stale advisory lock regardless of holder
    pub fn force_unlock(&self) -> Result<()> {
        if let Some(info) = self.ledger.lock_info()? {
            tracing::warn!(holder = %info.holder_id, "Force-releasing migration lock");
        }
        Ok(self.ledger.force_unlock()?)
    }

    /// Resolved positions and ids of units without an active ledger entry
    fn pending_ids(&self) -> Result<(Vec<usize>, Vec<String>)> {
        let applied = self.ledger.applied_ids()?;
        let descriptors = self.registry.descriptors();
        let order = resolver::resolve(&descriptors, &applied)?;
        let ids = order.iter().map(|&i| descriptors[i].id.clone()).collect();
        Ok((order, ids))
    }

    fn ensure_not_blocked(&self) -> Result<()> {
        match &self.block {
            Some(block) => Err(EngineError::Blocked {
                id: block.migration_id.clone(),
                reason: block.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager")
            .field("registry", &self.registry)
            .field("holder_id", &self.holder_id)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}
