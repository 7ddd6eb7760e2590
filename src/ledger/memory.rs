//! In-memory ledger and target store.
//!
//! Backs tests and embedders that keep their own durable record. The store
//! also records every statement executed against it so tests can assert what
//! a batch did, and can be told to reject statements matching a pattern.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{AuditEvent, LedgerEntry, LedgerStore, LockAttempt, LockInfo, StoreError, TargetStore};

#[derive(Debug, Default)]
struct Inner {
    schema_ready: bool,
    entries: BTreeMap<String, LedgerEntry>,
    events: Vec<AuditEvent>,
    lock: Option<LockInfo>,
    statements: Vec<String>,
    reject_patterns: Vec<String>,
}

/// Mutex-guarded in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.statements.clone())
            .unwrap_or_default()
    }

    /// Make `execute_batch` fail for any statement containing `pattern`
    pub fn reject_statements_containing(&self, pattern: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reject_patterns.push(pattern.into());
        }
    }

    /// Stop rejecting statements
    pub fn clear_rejections(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reject_patterns.clear();
        }
    }

    /// Whether `ensure_schema` has run
    pub fn schema_ready(&self) -> bool {
        self.inner.lock().map(|inner| inner.schema_ready).unwrap_or(false)
    }
}

impl LedgerStore for MemoryStore {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.lock()?.schema_ready = true;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner.lock()?;
        let mut entries: Vec<LedgerEntry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.inner.lock()?.entries.get(id).cloned())
    }

    fn record_applied(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        if inner.entries.get(&entry.id).is_some_and(LedgerEntry::is_active) {
            return Err(StoreError::DuplicateEntry {
                id: entry.id.clone(),
            });
        }
        let mut row = entry.clone();
        row.rolled_back_at = None;
        inner.entries.insert(row.id.clone(), row);
        Ok(())
    }

    fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingEntry { id: id.to_string() })?;
        if entry.rolled_back_at.is_some() {
            return Err(StoreError::AlreadyRolledBack { id: id.to_string() });
        }
        entry.rolled_back_at = Some(at);
        Ok(())
    }

    fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        let mut stored = event.clone();
        stored.seq = inner.events.len() as i64 + 1;
        inner.events.push(stored);
        Ok(())
    }

    fn events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self.inner.lock()?.events.clone())
    }

    fn try_lock(&self, holder_id: &str, ttl: Duration) -> Result<LockAttempt, StoreError> {
        let mut inner = self.inner.lock()?;
        if let Some(existing) = &inner.lock {
            if existing.holder_id != holder_id && !existing.is_expired() {
                return Ok(LockAttempt::Held(existing.clone()));
            }
        }
        inner.lock = Some(LockInfo::new(holder_id, ttl));
        Ok(LockAttempt::Acquired)
    }

    fn unlock(&self, holder_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        if inner.lock.as_ref().is_some_and(|l| l.holder_id == holder_id) {
            inner.lock = None;
        }
        Ok(())
    }

    fn force_unlock(&self) -> Result<(), StoreError> {
        self.inner.lock()?.lock = None;
        Ok(())
    }

    fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        Ok(self.inner.lock()?.lock.clone())
    }
}

impl TargetStore for MemoryStore {
    fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        if let Some(pattern) = inner.reject_patterns.iter().find(|p| sql.contains(p.as_str())) {
            return Err(StoreError::Statement(format!(
                "rejected statement matching '{}'",
                pattern
            )));
        }
        inner.statements.push(sql.to_string());
        Ok(())
    }
}
