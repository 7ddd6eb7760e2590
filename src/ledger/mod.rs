//! Ledger modules: the durable record of which migrations have run.
//!
//! The ledger is the sole source of truth for "has this unit run". Backends
//! implement [`LedgerStore`] (entries, audit log, advisory lock) and usually
//! [`TargetStore`] as well, since migrations typically mutate the same
//! database that records them.
//!
//! - `memory`: in-process backend for tests and embedding
//! - `sqlite`: durable backend on a SQLite database file

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::descriptor::{MigrationDescriptor, MigrationKind};

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "migrations_ledger";

/// Whether `name` can be interpolated as a table identifier
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Errors raised by ledger and target stores
#[derive(Error, Debug)]
pub enum StoreError {
    /// Inserting an entry for an id that already has an unrevoked entry
    #[error("Ledger already has an active entry for '{id}'")]
    DuplicateEntry { id: String },

    /// No entry exists for the id
    #[error("Ledger has no entry for '{id}'")]
    MissingEntry { id: String },

    /// The entry was already marked rolled back
    #[error("Ledger entry for '{id}' is already rolled back")]
    AlreadyRolledBack { id: String },

    /// A stored row could not be decoded
    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    /// A shared connection or in-memory table mutex was poisoned
    #[error("Store mutex poisoned")]
    Poisoned,

    /// Ledger table name is not a plain identifier
    #[error("Invalid ledger table name: '{0}'")]
    InvalidTableName(String),

    /// Statement rejected by the target store
    #[error("Statement failed: {0}")]
    Statement(String),

    /// SQLite backend error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// One row of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: MigrationKind,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Build the entry recorded when `descriptor` is applied at `applied_at`
    pub fn applied(descriptor: &MigrationDescriptor, applied_at: DateTime<Utc>) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            kind: descriptor.kind,
            applied_at,
            rolled_back_at: None,
        }
    }

    /// An entry without `rolled_back_at` means the unit's effects are present
    #[inline]
    pub fn is_active(&self) -> bool {
        self.rolled_back_at.is_none()
    }
}

/// Kind of audit log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditEventKind {
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
    BlockCleared,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence assigned by the store (0 until stored)
    pub seq: i64,
    pub migration_id: String,
    pub event: AuditEventKind,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(migration_id: impl Into<String>, event: AuditEventKind, detail: Option<String>) -> Self {
        Self {
            seq: 0,
            migration_id: migration_id.into(),
            event,
            at: Utc::now(),
            detail,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {}",
            self.seq,
            self.at.to_rfc3339(),
            self.event,
            self.migration_id
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Advisory lock row contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for `holder_id` valid for `ttl` from now.
    pub fn new(holder_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300)),
        }
    }

    /// Returns whether this lock has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// Lock is now held by the caller
    Acquired,
    /// Lock is held by someone else and has not expired
    Held(LockInfo),
}

/// Durable record of applied migrations.
///
/// All methods take `&self`; backends use interior mutability so a single
/// store can be shared between the coordinator and the context handed to
/// units.
pub trait LedgerStore {
    /// Create the backing tables if they do not exist. Must be idempotent.
    fn ensure_schema(&self) -> Result<(), StoreError>;

    /// All entries, ordered by `applied_at` then id
    fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Entry for a single id
    fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, StoreError>;

    /// Record a successful application.
    ///
    /// Fails with [`StoreError::DuplicateEntry`] if an unrevoked entry exists.
    /// A rolled-back entry is re-armed in place.
    fn record_applied(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Set `rolled_back_at` on an active entry.
    fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append an audit event
    fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// All audit events in sequence order
    fn events(&self) -> Result<Vec<AuditEvent>, StoreError>;

    /// Try to take the advisory lock, taking over an expired one.
    fn try_lock(&self, holder_id: &str, ttl: Duration) -> Result<LockAttempt, StoreError>;

    /// Release the lock if held by `holder_id`
    fn unlock(&self, holder_id: &str) -> Result<(), StoreError>;

    /// Remove the lock regardless of holder
    fn force_unlock(&self) -> Result<(), StoreError>;

    /// Current lock row, if any
    fn lock_info(&self) -> Result<Option<LockInfo>, StoreError>;

    /// Whether `id` has an unrevoked entry
    fn is_applied(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.entry(id)?.is_some_and(|e| e.is_active()))
    }

    /// Ids with unrevoked entries
    fn applied_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(LedgerEntry::is_active)
            .map(|e| e.id)
            .collect())
    }
}

/// The store migrations mutate.
pub trait TargetStore {
    /// Execute one or more statements atomically.
    fn execute_batch(&self, sql: &str) -> Result<(), StoreError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for std::sync::Arc<T> {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        (**self).ensure_schema()
    }
    fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).entries()
    }
    fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        (**self).entry(id)
    }
    fn record_applied(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        (**self).record_applied(entry)
    }
    fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_rolled_back(id, at)
    }
    fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        (**self).append_event(event)
    }
    fn events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        (**self).events()
    }
    fn try_lock(&self, holder_id: &str, ttl: Duration) -> Result<LockAttempt, StoreError> {
        (**self).try_lock(holder_id, ttl)
    }
    fn unlock(&self, holder_id: &str) -> Result<(), StoreError> {
        (**self).unlock(holder_id)
    }
    fn force_unlock(&self) -> Result<(), StoreError> {
        (**self).force_unlock()
    }
    fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        (**self).lock_info()
    }
}

impl<T: TargetStore + ?Sized> TargetStore for std::sync::Arc<T> {
    fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        (**self).execute_batch(sql)
    }
}
