//! Status reporter
//!
//! Composes the registry and the ledger into a point-in-time view. Read-only:
//! the reporter never writes to the ledger.
//!
//! # Unit States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `applied` | active ledger entry |
//! | `pending` | no active entry, dependencies satisfiable |
//! | `rolled_back` | entry exists with `rolled_back_at` set; counted as pending |
//! | `unresolved` | depends on a missing id or sits on a cycle |

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::descriptor::MigrationKind;
use crate::ledger::{LedgerEntry, LedgerStore, StoreError};
use crate::logic::resolver;
use crate::registry::MigrationRegistry;

/// Reported state of one registered unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnitState {
    Applied,
    Pending,
    RolledBack,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: MigrationKind,
    pub state: UnitState,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Error from the last failed attempt in this process
    pub last_error: Option<String>,
}

/// Per-kind counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub per_unit: Vec<UnitStatus>,
}

impl StatusReport {
    /// Group applied/pending counts by migration kind
    pub fn counts_by_kind(&self) -> BTreeMap<MigrationKind, KindCounts> {
        let mut counts: BTreeMap<MigrationKind, KindCounts> = BTreeMap::new();
        for unit in &self.per_unit {
            let entry = counts.entry(unit.kind).or_default();
            entry.total += 1;
            match unit.state {
                UnitState::Applied => entry.applied += 1,
                UnitState::Pending | UnitState::RolledBack => entry.pending += 1,
                UnitState::Unresolved => {}
            }
        }
        counts
    }

    /// Status of a single unit
    pub fn unit(&self, id: &str) -> Option<&UnitStatus> {
        self.per_unit.iter().find(|u| u.id == id)
    }
}

/// Read-only view over a registry and a ledger
pub struct StatusReporter<'a> {
    registry: &'a MigrationRegistry,
    ledger: &'a dyn LedgerStore,
}

impl<'a> StatusReporter<'a> {
    pub fn new(registry: &'a MigrationRegistry, ledger: &'a dyn LedgerStore) -> Self {
        Self { registry, ledger }
    }

    /// Build the report. `failures` maps ids to the error text of their
    /// last failed attempt.
    pub fn report(&self, failures: &HashMap<String, String>) -> Result<StatusReport, StoreError> {
        let entries: HashMap<String, LedgerEntry> = self
            .ledger
            .entries()?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let descriptors = self.registry.descriptors();
        let stuck = resolver::unresolvable(&descriptors);

        let mut report = StatusReport {
            total: descriptors.len(),
            applied: 0,
            pending: 0,
            unresolved: 0,
            failed: 0,
            rolled_back: 0,
            per_unit: Vec::with_capacity(descriptors.len()),
        };

        for d in descriptors {
            let entry = entries.get(&d.id);
            let state = match entry {
                Some(e) if e.is_active() => UnitState::Applied,
                _ if stuck.contains(&d.id) => UnitState::Unresolved,
                Some(_) => UnitState::RolledBack,
                None => UnitState::Pending,
            };
            let last_error = match state {
                UnitState::Applied => None,
                _ => failures.get(&d.id).cloned(),
            };

            match state {
                UnitState::Applied => report.applied += 1,
                UnitState::Unresolved => report.unresolved += 1,
                UnitState::RolledBack => {
                    report.pending += 1;
                    report.rolled_back += 1;
                }
                UnitState::Pending => report.pending += 1,
            }
            if last_error.is_some() && state != UnitState::Unresolved {
                report.failed += 1;
            }

            report.per_unit.push(UnitStatus {
                id: d.id.clone(),
                name: d.name.clone(),
                version: d.version.clone(),
                kind: d.kind,
                state,
                applied_at: entry.map(|e| e.applied_at),
                rolled_back_at: entry.and_then(|e| e.rolled_back_at),
                last_error,
            });
        }

        Ok(report)
    }
}
