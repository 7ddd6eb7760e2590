//! SQLite ledger and target store.
//!
//! Creates three tables on `ensure_schema`:
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `<ledger>` | one row per applied (or rolled back) migration |
//! | `<ledger>_audit` | append-only event log |
//! | `<ledger>_lock` | advisory lock row, one per lock name |
//!
//! All creation statements use `IF NOT EXISTS`, so concurrent processes can
//! initialize the same database file. Writes that read-then-modify take an
//! immediate transaction so two processes cannot interleave them.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};

use super::{
    AuditEvent, AuditEventKind, DEFAULT_LEDGER_TABLE, LedgerEntry, LedgerStore, LockAttempt,
    LockInfo, StoreError, TargetStore, is_valid_table_name,
};

/// Default advisory lock name
pub const DEFAULT_LOCK_NAME: &str = "migrations";

/// How long a connection waits on a locked database file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    table: String,
    lock_name: String,
}

impl SqliteStore {
    /// Open (or create) a database file using the default ledger table
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_table(path, DEFAULT_LEDGER_TABLE)
    }

    /// Open (or create) a database file using a custom ledger table name
    pub fn open_with_table(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, table)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_LEDGER_TABLE)
    }

    fn from_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        if !is_valid_table_name(table) {
            return Err(StoreError::InvalidTableName(table.to_string()));
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
        })
    }

    /// Use a different advisory lock name
    pub fn with_lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = name.into();
        self
    }

    /// Ledger table name
    pub fn table(&self) -> &str {
        &self.table
    }

    fn audit_table(&self) -> String {
        format!("{}_audit", self.table)
    }

    fn lock_table(&self) -> String {
        format!("{}_lock", self.table)
    }

    /// Number of tables named `name` (0 or 1)
    pub fn table_count(&self, name: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Copy the whole database to `dest` (which must not exist yet)
    pub fn backup_to(&self, dest: impl AsRef<Path>) -> Result<(), StoreError> {
        let dest = dest.as_ref().to_string_lossy().into_owned();
        let conn = self.conn.lock()?;
        conn.execute("VACUUM INTO ?1", [dest])?;
        Ok(())
    }

    /// Run a closure against the raw connection (for units needing queries)
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock()?;
        Ok(f(&conn)?)
    }
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(LedgerEntry, String)> {
    let kind: String = row.get(3)?;
    Ok((
        LedgerEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            kind: Default::default(),
            applied_at: row.get(4)?,
            rolled_back_at: row.get(5)?,
        },
        kind,
    ))
}

fn decode_entry((mut entry, kind): (LedgerEntry, String)) -> Result<LedgerEntry, StoreError> {
    entry.kind = kind
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown kind '{}' for '{}'", kind, entry.id)))?;
    Ok(entry)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl LedgerStore for SqliteStore {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ledger} (
                 id             TEXT PRIMARY KEY,
                 name           TEXT NOT NULL,
                 version        TEXT NOT NULL,
                 kind           TEXT NOT NULL,
                 applied_at     TIMESTAMP NOT NULL,
                 rolled_back_at TIMESTAMP NULL
             );
             CREATE TABLE IF NOT EXISTS {audit} (
                 seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                 migration_id TEXT NOT NULL,
                 event        TEXT NOT NULL,
                 at           TIMESTAMP NOT NULL,
                 detail       TEXT NULL
             );
             CREATE TABLE IF NOT EXISTS {lock} (
                 name        TEXT PRIMARY KEY,
                 holder_id   TEXT NOT NULL,
                 acquired_at TIMESTAMP NOT NULL,
                 expires_at  TIMESTAMP NOT NULL
             );",
            ledger = self.table,
            audit = self.audit_table(),
            lock = self.lock_table(),
        ))?;
        tracing::debug!(table = %self.table, "Ledger schema ensured");
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, version, kind, applied_at, rolled_back_at FROM {} ORDER BY applied_at, id",
            self.table
        ))?;
        let rows = stmt.query_map([], parse_entry_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(decode_entry(row?)?);
        }
        Ok(entries)
    }

    fn entry(&self, id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, name, version, kind, applied_at, rolled_back_at FROM {} WHERE id = ?1",
                    self.table
                ),
                [id],
                parse_entry_row,
            )
            .optional()?;
        row.map(decode_entry).transpose()
    }

    fn record_applied(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<Option<DateTime<Utc>>> = tx
            .query_row(
                &format!("SELECT rolled_back_at FROM {} WHERE id = ?1", self.table),
                [&entry.id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(None) => {
                return Err(StoreError::DuplicateEntry {
                    id: entry.id.clone(),
                });
            }
            Some(Some(_)) => {
                tx.execute(
                    &format!(
                        "UPDATE {} SET name = ?2, version = ?3, kind = ?4, applied_at = ?5, rolled_back_at = NULL WHERE id = ?1",
                        self.table
                    ),
                    params![
                        entry.id,
                        entry.name,
                        entry.version,
                        entry.kind.to_string(),
                        entry.applied_at
                    ],
                )?;
            }
            None => {
                let inserted = tx.execute(
                    &format!(
                        "INSERT INTO {} (id, name, version, kind, applied_at, rolled_back_at) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                        self.table
                    ),
                    params![
                        entry.id,
                        entry.name,
                        entry.version,
                        entry.kind.to_string(),
                        entry.applied_at
                    ],
                );
                match inserted {
                    Err(e) if is_constraint_violation(&e) => {
                        return Err(StoreError::DuplicateEntry {
                            id: entry.id.clone(),
                        });
                    }
                    other => {
                        other?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn mark_rolled_back(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<Option<DateTime<Utc>>> = tx
            .query_row(
                &format!("SELECT rolled_back_at FROM {} WHERE id = ?1", self.table),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => return Err(StoreError::MissingEntry { id: id.to_string() }),
            Some(Some(_)) => return Err(StoreError::AlreadyRolledBack { id: id.to_string() }),
            Some(None) => {}
        }
        tx.execute(
            &format!(
                "UPDATE {} SET rolled_back_at = ?2 WHERE id = ?1 AND rolled_back_at IS NULL",
                self.table
            ),
            params![id, at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (migration_id, event, at, detail) VALUES (?1, ?2, ?3, ?4)",
                self.audit_table()
            ),
            params![
                event.migration_id,
                event.event.to_string(),
                event.at,
                event.detail
            ],
        )?;
        Ok(())
    }

    fn events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT seq, migration_id, event, at, detail FROM {} ORDER BY seq",
            self.audit_table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, migration_id, event, at, detail) = row?;
            let event: AuditEventKind = event
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("unknown audit event '{}'", event)))?;
            events.push(AuditEvent {
                seq,
                migration_id,
                event,
                at,
                detail,
            });
        }
        Ok(events)
    }

    fn try_lock(&self, holder_id: &str, ttl: Duration) -> Result<LockAttempt, StoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                &format!(
                    "SELECT holder_id, acquired_at, expires_at FROM {} WHERE name = ?1",
                    self.lock_table()
                ),
                [&self.lock_name],
                |row| {
                    Ok(LockInfo {
                        holder_id: row.get(0)?,
                        acquired_at: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;

        if let Some(info) = existing {
            if info.holder_id != holder_id && !info.is_expired() {
                return Ok(LockAttempt::Held(info));
            }
            if info.holder_id != holder_id {
                tracing::warn!(previous = %info.holder_id, "Taking over expired migration lock");
            }
        }

        let info = LockInfo::new(holder_id, ttl);
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (name, holder_id, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                self.lock_table()
            ),
            params![self.lock_name, info.holder_id, info.acquired_at, info.expires_at],
        )?;
        tx.commit()?;
        Ok(LockAttempt::Acquired)
    }

    fn unlock(&self, holder_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE name = ?1 AND holder_id = ?2",
                self.lock_table()
            ),
            params![self.lock_name, holder_id],
        )?;
        Ok(())
    }

    fn force_unlock(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", self.lock_table()),
            [&self.lock_name],
        )?;
        Ok(())
    }

    fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        let conn = self.conn.lock()?;
        let info = conn
            .query_row(
                &format!(
                    "SELECT holder_id, acquired_at, expires_at FROM {} WHERE name = ?1",
                    self.lock_table()
                ),
                [&self.lock_name],
                |row| {
                    Ok(LockInfo {
                        holder_id: row.get(0)?,
                        acquired_at: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }
}

impl TargetStore for SqliteStore {
    /// Runs the statements inside one transaction; a failing statement leaves
    /// no partial changes. Batches must not contain their own BEGIN/COMMIT.
    fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.commit()?;
        Ok(())
    }
}
