//! Coordinator integration tests against the in-memory store
//!
//! These tests verify:
//! - Dependency ordering and idempotent re-runs
//! - Dry-run purity
//! - Halt-on-failure with and without revert
//! - Explicit rollback and re-application
//! - Operator blocks, advisory locking, retries and cancellation
//! - Ledger write failures and concurrent coordinators

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use migration_engine::descriptor::MigrationDescriptor;
use migration_engine::engine::{HaltReason, MigrationManager};
use migration_engine::ledger::{
    AuditEvent, AuditEventKind, LedgerEntry, LedgerStore, LockAttempt, LockInfo, MemoryStore,
    StoreError,
};
use migration_engine::logic::status::UnitState;
use migration_engine::shutdown::StopSignal;
use migration_engine::unit::{FnMigration, MigrationContext, MigrationUnit, step};
use migration_engine::{EngineConfig, EngineError};

type Calls = Arc<Mutex<Vec<String>>>;

fn setup() -> (Arc<MemoryStore>, MigrationManager) {
    let store = Arc::new(MemoryStore::new());
    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
    manager.initialize().expect("Should initialize");
    (store, manager)
}

fn descriptor(id: &str, deps: &[&str], reversible: bool) -> MigrationDescriptor {
    let mut builder = MigrationDescriptor::builder(id, format!("Migration {id}"));
    for dep in deps {
        builder = builder.depends_on(*dep);
    }
    if reversible {
        builder = builder.reversible();
    }
    builder.build().expect("Should build")
}

/// Unit that records "apply:<id>" / "revert:<id>" and optionally fails
fn recording(id: &str, deps: &[&str], calls: &Calls, fail_apply: bool) -> FnMigration {
    let apply_calls = calls.clone();
    let apply_id = id.to_string();
    FnMigration::new(descriptor(id, deps, false), move |_| {
        apply_calls.lock().unwrap().push(format!("apply:{apply_id}"));
        if fail_apply {
            anyhow::bail!("apply of {apply_id} exploded");
        }
        Ok(())
    })
}

fn reversible(id: &str, deps: &[&str], calls: &Calls, fail_apply: bool, fail_revert: bool) -> FnMigration {
    let apply_calls = calls.clone();
    let revert_calls = calls.clone();
    let apply_id = id.to_string();
    let revert_id = id.to_string();
    FnMigration::new(descriptor(id, deps, true), move |_| {
        apply_calls.lock().unwrap().push(format!("apply:{apply_id}"));
        if fail_apply {
            anyhow::bail!("apply of {apply_id} exploded");
        }
        Ok(())
    })
    .with_revert(move |_| {
        revert_calls.lock().unwrap().push(format!("revert:{revert_id}"));
        if fail_revert {
            anyhow::bail!("revert of {revert_id} exploded");
        }
        Ok(())
    })
}

fn calls() -> Calls {
    Arc::new(Mutex::new(Vec::new()))
}

fn recorded(calls: &Calls) -> Vec<String> {
    calls.lock().unwrap().clone()
}

// =============================================================================
// Ordering and Idempotence
// =============================================================================

#[test]
fn test_dependency_chain_registered_in_reverse() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("C", &["B"], &calls, false)).unwrap();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert!(report.is_success());
    assert_eq!(recorded(&calls), vec!["apply:A", "apply:B", "apply:C"]);

    let status = manager.status().unwrap();
    assert_eq!((status.applied, status.pending), (3, 0));
}

#[test]
fn test_second_run_applies_nothing() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    assert_eq!(manager.run_pending(false).unwrap().applied_count(), 2);
    let second = manager.run_pending(false).unwrap();
    assert!(second.results.is_empty());
    assert_eq!(recorded(&calls).len(), 2);
}

#[test]
fn test_ledger_survives_new_coordinator() {
    let store = Arc::new(MemoryStore::new());
    let calls = calls();
    {
        let mut first = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
        first.initialize().unwrap();
        first.register(recording("A", &[], &calls, false)).unwrap();
        first.run_pending(false).unwrap();
    }

    let mut second = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
    second.initialize().unwrap();
    second.register(recording("A", &[], &calls, false)).unwrap();
    assert!(second.run_pending(false).unwrap().results.is_empty());
    assert_eq!(recorded(&calls), vec!["apply:A"]);
}

#[test]
fn test_initialize_twice() {
    let (store, mut manager) = setup();
    manager.initialize().expect("Second initialize");
    assert!(store.schema_ready());
}

// =============================================================================
// Resolution Errors
// =============================================================================

#[test]
fn test_missing_dependency_runs_nothing() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    manager.register(recording("B", &["ghost"], &calls, false)).unwrap();

    let err = manager.run_pending(false).unwrap_err();
    assert!(matches!(
        err,
        EngineError::DependencyUnresolved { ref id, ref missing } if id == "B" && missing == "ghost"
    ));
    assert!(recorded(&calls).is_empty());
    assert!(store.entries().unwrap().is_empty());

    let status = manager.status().unwrap();
    assert_eq!((status.pending, status.unresolved), (1, 1));
}

#[test]
fn test_cycle_is_reported() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("X", &["Y"], &calls, false)).unwrap();
    manager.register(recording("Y", &["X"], &calls, false)).unwrap();

    let err = manager.run_pending(false).unwrap_err();
    assert!(matches!(err, EngineError::DependencyCycle { ref remaining } if remaining.len() == 2));
    assert!(recorded(&calls).is_empty());
}

#[test]
fn test_duplicate_registration() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    let err = manager.register(recording("A", &[], &calls, false)).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId { .. }));
    assert!(err.is_configuration_mistake());
}

// =============================================================================
// Dry Run
// =============================================================================

#[test]
fn test_dry_run_is_pure() {
    let hook_calls = calls();
    let store = Arc::new(MemoryStore::new());
    let hook_log = hook_calls.clone();
    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()))
        .with_before_batch(move |_| {
            hook_log.lock().unwrap().push("hook".into());
            Ok(())
        });
    manager.initialize().unwrap();

    let calls = calls();
    manager.register(reversible("A", &[], &calls, false, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    let report = manager.run_pending(true).unwrap();
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.success && r.dry_run && !r.rolled_back));
    assert!(recorded(&calls).is_empty());
    assert!(recorded(&hook_calls).is_empty());
    assert!(store.entries().unwrap().is_empty());
    assert!(store.events().unwrap().is_empty());
    assert!(store.lock_info().unwrap().is_none());
}

#[test]
fn test_run_one_dry_run() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();

    let result = manager.run_one("A", true).unwrap();
    assert!(result.success && result.dry_run);
    assert!(!store.is_applied("A").unwrap());
}

// =============================================================================
// Failure Handling
// =============================================================================

#[test]
fn test_halt_on_failure_mid_batch() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("M1", &[], &calls, false)).unwrap();
    manager.register(recording("M2", &[], &calls, false)).unwrap();
    manager.register(recording("M3", &[], &calls, true)).unwrap();
    manager.register(recording("M4", &[], &calls, false)).unwrap();
    manager.register(recording("M5", &[], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.halt, Some(HaltReason::Failed { id: "M3".into() }));
    assert_eq!(recorded(&calls), vec!["apply:M1", "apply:M2", "apply:M3"]);

    assert!(store.is_applied("M1").unwrap());
    assert!(store.is_applied("M2").unwrap());
    assert!(!store.is_applied("M3").unwrap());
    assert!(store.entry("M3").unwrap().is_none());
}

#[test]
fn test_failure_without_rollback_support() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, true)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.results.len(), 1);
    let result = &report.results[0];
    assert_eq!(result.id, "A");
    assert!(!result.success);
    assert!(!result.rolled_back);
    assert!(result.error.as_deref().unwrap().contains("exploded"));

    let status = manager.status().unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.failed, 1);
    assert_eq!(status.per_unit[0].state, UnitState::Pending);
    assert!(status.per_unit[0].last_error.is_some());
}

#[test]
fn test_failure_with_revert() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(reversible("A", &[], &calls, true, false)).unwrap();
    manager.register(recording("B", &[], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].rolled_back);
    assert!(report.results[0].rollback_error.is_none());
    assert_eq!(recorded(&calls), vec!["apply:A", "revert:A"]);
    assert!(manager.blocked().is_none());

    let kinds: Vec<AuditEventKind> = store.events().unwrap().iter().map(|e| e.event).collect();
    assert_eq!(kinds, vec![AuditEventKind::Failed]);
}

#[test]
fn test_failed_unit_is_retried_next_batch() {
    let (store, mut manager) = setup();
    let fail = Arc::new(Mutex::new(true));
    let flag = fail.clone();
    manager
        .register(FnMigration::new(descriptor("A", &[], false), move |_| {
            if *flag.lock().unwrap() {
                anyhow::bail!("not yet");
            }
            Ok(())
        }))
        .unwrap();

    assert!(!manager.run_pending(false).unwrap().is_success());
    *fail.lock().unwrap() = false;
    let report = manager.run_pending(false).unwrap();
    assert!(report.is_success());
    assert!(store.is_applied("A").unwrap());
    assert_eq!(manager.status().unwrap().failed, 0);
}

#[test]
fn test_target_statement_failure_becomes_result() {
    let (store, mut manager) = setup();
    store.reject_statements_containing("DROP");
    manager
        .register(FnMigration::new(descriptor("A", &[], false), |ctx| {
            ctx.target().execute_batch("DROP TABLE users")?;
            Ok(())
        }))
        .unwrap();

    let report = manager.run_pending(false).unwrap();
    assert!(!report.results[0].success);
    assert!(report.results[0].error.as_deref().unwrap().contains("rejected statement"));
}

// =============================================================================
// Rollback Errors and Operator Blocks
// =============================================================================

#[test]
fn test_revert_failure_blocks_until_cleared() {
    let store = Arc::new(MemoryStore::new());
    let calls = calls();
    {
        let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
        manager.initialize().unwrap();
        manager.register(reversible("A", &[], &calls, true, true)).unwrap();

        let report = manager.run_pending(false).unwrap();
        assert_eq!(report.halt, Some(HaltReason::RollbackFailed { id: "A".into() }));
        let result = &report.results[0];
        let error = result.error.as_deref().unwrap();
        assert!(error.contains("apply of A exploded"));
        assert!(error.contains("revert of A exploded"));
        assert!(result.rollback_error.is_some());

        assert!(matches!(
            manager.run_pending(false).unwrap_err(),
            EngineError::Blocked { ref id, .. } if id == "A"
        ));
    }

    // The block survives a restart
    let mut restarted = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
    restarted.initialize().unwrap();
    restarted.register(reversible("A", &[], &calls, false, false)).unwrap();
    assert_eq!(restarted.blocked().map(|b| b.migration_id.as_str()), Some("A"));
    assert!(matches!(
        restarted.run_one("A", false).unwrap_err(),
        EngineError::Blocked { .. }
    ));

    // Dry runs stay available while blocked
    assert!(restarted.run_pending(true).is_ok());

    restarted.clear_block("A").unwrap();
    assert!(restarted.run_pending(false).unwrap().is_success());

    let mut again = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()));
    again.initialize().unwrap();
    assert!(again.blocked().is_none());
}

// =============================================================================
// Single-Unit Runs
// =============================================================================

#[test]
fn test_run_one_enforces_dependencies() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    assert!(matches!(
        manager.run_one("B", false).unwrap_err(),
        EngineError::DependenciesUnsatisfied { ref missing, .. } if missing == &vec!["A".to_string()]
    ));
    assert!(matches!(
        manager.run_one("nope", false).unwrap_err(),
        EngineError::NotRegistered { .. }
    ));

    assert!(manager.run_one("A", false).unwrap().success);
    assert!(matches!(
        manager.run_one("A", false).unwrap_err(),
        EngineError::AlreadyApplied { .. }
    ));
    assert!(manager.run_one("B", false).unwrap().success);
    assert_eq!(recorded(&calls), vec!["apply:A", "apply:B"]);
}

#[test]
fn test_run_one_unregistered_dependency() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("B", &["ghost"], &calls, false)).unwrap();
    assert!(matches!(
        manager.run_one("B", false).unwrap_err(),
        EngineError::DependencyUnresolved { .. }
    ));
}

// =============================================================================
// Explicit Rollback
// =============================================================================

#[test]
fn test_rollback_then_reapply() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(reversible("A", &[], &calls, false, false)).unwrap();
    manager.run_pending(false).unwrap();

    let result = manager.rollback("A").unwrap();
    assert!(result.success && result.rolled_back);
    let entry = store.entry("A").unwrap().unwrap();
    assert!(entry.rolled_back_at.is_some());

    let status = manager.status().unwrap();
    assert_eq!((status.applied, status.pending, status.rolled_back), (0, 1, 1));

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.applied_count(), 1);
    assert_eq!(recorded(&calls), vec!["apply:A", "revert:A", "apply:A"]);
    assert!(store.is_applied("A").unwrap());
}

#[test]
fn test_rollback_preconditions() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("plain", &[], &calls, false)).unwrap();
    manager.register(reversible("A", &[], &calls, false, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    assert!(matches!(
        manager.rollback("A").unwrap_err(),
        EngineError::NotApplied { .. }
    ));
    manager.run_pending(false).unwrap();

    assert!(matches!(
        manager.rollback("plain").unwrap_err(),
        EngineError::RollbackUnsupported { .. }
    ));
    assert!(matches!(
        manager.rollback("A").unwrap_err(),
        EngineError::DependentsApplied { ref dependents, .. } if dependents == &vec!["B".to_string()]
    ));
}

#[test]
fn test_failed_manual_rollback_leaves_ledger() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(reversible("A", &[], &calls, false, true)).unwrap();
    manager.run_pending(false).unwrap();

    let result = manager.rollback("A").unwrap();
    assert!(!result.success);
    assert!(store.is_applied("A").unwrap());
    assert!(manager.blocked().is_none());
}

// =============================================================================
// Registration Helpers and Validation
// =============================================================================

#[test]
fn test_register_fn_checks_rollback_flag() {
    let (_store, mut manager) = setup();
    let err = manager
        .register_fn(descriptor("A", &[], true), step(|_| Ok(())), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));

    manager
        .register_fn(descriptor("A", &[], true), step(|_| Ok(())), Some(step(|_| Ok(()))))
        .unwrap();
    assert!(manager.registry().contains("A"));
}

// =============================================================================
// Locking, Retries, Cancellation
// =============================================================================

#[test]
fn test_lock_held_by_other_coordinator() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    assert_eq!(
        store.try_lock("other-host", std::time::Duration::from_secs(60)).unwrap(),
        LockAttempt::Acquired
    );

    let err = manager.run_pending(false).unwrap_err();
    assert!(matches!(err, EngineError::LockHeld { ref holder, .. } if holder == "other-host"));
    assert!(recorded(&calls).is_empty());

    manager.force_unlock().unwrap();
    assert!(manager.run_pending(false).unwrap().is_success());
}

#[test]
fn test_expired_lock_is_taken_over() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    store.try_lock("crashed-host", std::time::Duration::ZERO).unwrap();

    assert!(manager.run_pending(false).unwrap().is_success());
    assert!(store.lock_info().unwrap().is_none());
}

#[test]
fn test_retry_policy_invokes_apply_up_to_limit() {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        max_apply_attempts: 3,
        ..EngineConfig::default()
    };
    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()))
        .with_config(config);
    manager.initialize().unwrap();

    let calls = calls();
    manager.register(recording("A", &[], &calls, true)).unwrap();
    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.results[0].attempts, 3);
    assert_eq!(recorded(&calls).len(), 3);

    let attempts = Arc::new(Mutex::new(0u32));
    let counter = attempts.clone();
    manager
        .register(FnMigration::new(descriptor("flaky", &[], false), move |_| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n < 2 {
                anyhow::bail!("transient");
            }
            Ok(())
        }))
        .unwrap();
    let result = manager.run_one("flaky", false).unwrap();
    assert!(result.success);
    assert_eq!(result.attempts, 2);
}

#[test]
fn test_stop_signal_halts_between_units() {
    let store = Arc::new(MemoryStore::new());
    let stop = StopSignal::new();
    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()))
        .with_stop_signal(stop.clone());
    manager.initialize().unwrap();

    let trip = stop.clone();
    manager
        .register(FnMigration::new(descriptor("A", &[], false), move |_| {
            trip.request_stop();
            Ok(())
        }))
        .unwrap();
    let calls = calls();
    manager.register(recording("B", &[], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.halt, Some(HaltReason::Cancelled { before: "B".into() }));
    assert!(store.is_applied("A").unwrap());
    assert!(recorded(&calls).is_empty());
}

#[test]
fn test_history_records_audit_trail() {
    let (_store, mut manager) = setup();
    let calls = calls();
    manager.register(reversible("A", &[], &calls, false, false)).unwrap();
    manager.run_pending(false).unwrap();
    manager.rollback("A").unwrap();

    let kinds: Vec<AuditEventKind> = manager.history().unwrap().iter().map(|e| e.event).collect();
    assert_eq!(kinds, vec![AuditEventKind::Applied, AuditEventKind::RolledBack]);
}

// =============================================================================
// Ledger Faults and Concurrent Coordinators
// =============================================================================

type LockHook = Box<dyn FnOnce(&MemoryStore)>;

/// Ledger over a `MemoryStore` that can fail audit writes and run a hook
/// the first time the lock is requested
struct FaultyLedger {
    inner: Arc<MemoryStore>,
    failing_events: Vec<AuditEventKind>,
    on_first_lock: Mutex<Option<LockHook>>,
}

impl FaultyLedger {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_events: Vec::new(),
            on_first_lock: Mutex::new(None),
        }
    }

    fn failing_events(mut self, kinds: &[AuditEventKind]) -> Self {
        self.failing_events = kinds.to_vec();
        self
    }

    /// Simulate another coordinator finishing work just before we lock
    fn before_first_lock<F: FnOnce(&MemoryStore) + 'static>(self, f: F) -> Self {
        *self.on_first_lock.lock().unwrap() = Some(Box::new(f));
        self
    }
}

impl LedgerStore for FaultyLedger {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema()
    }
    fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.entries()
    }
    fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        self.inner.entry(id)
    }
    fn record_applied(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.inner.record_applied(entry)
    }
    fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.mark_rolled_back(id, at)
    }
    fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        if self.failing_events.contains(&event.event) {
            return Err(StoreError::Statement("audit disk full".into()));
        }
        self.inner.append_event(event)
    }
    fn events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.events()
    }
    fn try_lock(&self, holder_id: &str, ttl: Duration) -> Result<LockAttempt, StoreError> {
        let hook = self.on_first_lock.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.try_lock(holder_id, ttl)
    }
    fn unlock(&self, holder_id: &str) -> Result<(), StoreError> {
        self.inner.unlock(holder_id)
    }
    fn force_unlock(&self) -> Result<(), StoreError> {
        self.inner.force_unlock()
    }
    fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        self.inner.lock_info()
    }
}

fn faulty_manager(store: &Arc<MemoryStore>, ledger: FaultyLedger) -> MigrationManager {
    let mut manager = MigrationManager::new(Box::new(ledger), Box::new(store.clone()));
    manager.initialize().expect("Should initialize");
    manager
}

fn mark_applied(store: &MemoryStore, descriptor: &MigrationDescriptor) {
    store
        .record_applied(&LedgerEntry::applied(descriptor, Utc::now()))
        .expect("Should record");
}

#[test]
fn test_pending_set_is_read_after_locking() {
    let store = Arc::new(MemoryStore::new());
    let done_elsewhere = descriptor("A", &[], false);
    let ledger = FaultyLedger::new(store.clone())
        .before_first_lock(move |inner| mark_applied(inner, &done_elsewhere));
    let mut manager = faulty_manager(&store, ledger);

    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();
    manager.register(recording("B", &["A"], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert!(report.is_success());
    let ids: Vec<&str> = report.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["B"]);
    assert_eq!(recorded(&calls), vec!["apply:B"]);
}

#[test]
fn test_run_one_checks_ledger_after_locking() {
    let store = Arc::new(MemoryStore::new());
    let done_elsewhere = descriptor("A", &[], false);
    let ledger = FaultyLedger::new(store.clone())
        .before_first_lock(move |inner| mark_applied(inner, &done_elsewhere));
    let mut manager = faulty_manager(&store, ledger);

    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();

    assert!(matches!(
        manager.run_one("A", false).unwrap_err(),
        EngineError::AlreadyApplied { .. }
    ));
    assert!(recorded(&calls).is_empty());
    assert!(store.lock_info().unwrap().is_none());
}

#[test]
fn test_revert_runs_when_failure_event_cannot_be_written() {
    let store = Arc::new(MemoryStore::new());
    let ledger = FaultyLedger::new(store.clone()).failing_events(&[AuditEventKind::Failed]);
    let mut manager = faulty_manager(&store, ledger);

    let calls = calls();
    manager.register(reversible("A", &[], &calls, true, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.halt, Some(HaltReason::Failed { id: "A".into() }));
    assert!(report.results[0].rolled_back);
    assert_eq!(recorded(&calls), vec!["apply:A", "revert:A"]);
    assert!(manager.blocked().is_none());
    assert!(!store.is_applied("A").unwrap());
}

#[test]
fn test_failed_revert_blocks_even_without_audit_log() {
    let store = Arc::new(MemoryStore::new());
    let ledger = FaultyLedger::new(store.clone())
        .failing_events(&[AuditEventKind::Failed, AuditEventKind::RollbackFailed]);
    let mut manager = faulty_manager(&store, ledger);

    let calls = calls();
    manager.register(reversible("A", &[], &calls, true, true)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.halt, Some(HaltReason::RollbackFailed { id: "A".into() }));
    assert_eq!(recorded(&calls), vec!["apply:A", "revert:A"]);
    assert_eq!(manager.blocked().unwrap().migration_id, "A");
}

#[test]
fn test_applied_unit_settles_when_audit_write_fails() {
    let store = Arc::new(MemoryStore::new());
    let ledger = FaultyLedger::new(store.clone()).failing_events(&[AuditEventKind::Applied]);
    let mut manager = faulty_manager(&store, ledger);

    let calls = calls();
    manager.register(recording("A", &[], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert!(report.is_success());
    assert!(store.is_applied("A").unwrap());

    let status = manager.status().unwrap();
    assert_eq!(status.applied, 1);
    assert_eq!(status.failed, 0);
    assert!(manager.run_pending(false).unwrap().results.is_empty());
}

/// Unit whose own dependency check rejects it, e.g. a cross-store check
struct GatedUnit {
    descriptor: MigrationDescriptor,
    calls: Calls,
}

impl MigrationUnit for GatedUnit {
    fn descriptor(&self) -> &MigrationDescriptor {
        &self.descriptor
    }

    fn apply(&self, _ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("apply:gated".into());
        Ok(())
    }

    fn revert(&self, _ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("revert:gated".into());
        anyhow::bail!("nothing to revert")
    }

    fn dependencies_satisfied(&self, _ctx: &MigrationContext<'_>) -> Result<bool, StoreError> {
        Ok(false)
    }
}

#[test]
fn test_unsatisfied_dependencies_skip_revert() {
    let (store, mut manager) = setup();
    let calls = calls();
    manager
        .register(GatedUnit {
            descriptor: descriptor("gated", &[], true),
            calls: calls.clone(),
        })
        .unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(report.halt, Some(HaltReason::Failed { id: "gated".into() }));
    let result = &report.results[0];
    assert!(!result.rolled_back);
    assert_eq!(result.attempts, 0);
    assert!(result.rollback_error.is_none());
    assert!(recorded(&calls).is_empty());
    assert!(manager.blocked().is_none());
    assert!(!store.is_applied("gated").unwrap());
}

#[test]
fn test_lease_renewed_between_units() {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        lock_ttl_secs: 1,
        ..EngineConfig::default()
    };
    let mut manager = MigrationManager::new(Box::new(store.clone()), Box::new(store.clone()))
        .with_config(config);
    manager.initialize().unwrap();

    manager
        .register(FnMigration::new(descriptor("slow", &[], false), |_| {
            std::thread::sleep(Duration::from_millis(1100));
            Ok(())
        }))
        .unwrap();
    let intruder = store.clone();
    let attempt = Arc::new(Mutex::new(None));
    let seen = attempt.clone();
    manager
        .register(FnMigration::new(descriptor("next", &["slow"], false), move |_| {
            let result = intruder.try_lock("intruder", Duration::from_secs(60))?;
            *seen.lock().unwrap() = Some(result);
            Ok(())
        }))
        .unwrap();

    assert!(manager.run_pending(false).unwrap().is_success());
    assert!(matches!(
        attempt.lock().unwrap().take(),
        Some(LockAttempt::Held(ref info)) if info.holder_id != "intruder"
    ));
}

#[test]
fn test_batch_halts_when_lock_is_taken_over() {
    let (store, mut manager) = setup();
    let usurper = store.clone();
    manager
        .register(FnMigration::new(descriptor("A", &[], false), move |_| {
            // Lease expired and another coordinator took over
            usurper.force_unlock()?;
            usurper.try_lock("usurper", Duration::from_secs(60))?;
            Ok(())
        }))
        .unwrap();
    let calls = calls();
    manager.register(recording("B", &[], &calls, false)).unwrap();

    let report = manager.run_pending(false).unwrap();
    assert_eq!(
        report.halt,
        Some(HaltReason::LockLost {
            before: "B".into(),
            holder: "usurper".into(),
        })
    );
    assert!(store.is_applied("A").unwrap());
    assert!(recorded(&calls).is_empty());
    assert_eq!(store.lock_info().unwrap().unwrap().holder_id, "usurper");

    let ids: HashSet<String> = store.applied_ids().unwrap();
    assert_eq!(ids.len(), 1);
}
