//! Dependency resolver
//!
//! Orders the pending subset of the registered units so that every unit
//! runs after the units it depends on.
//!
//! # Design
//!
//! - **Pure logic**: no I/O; the caller passes the applied-id set
//! - **Deterministic**: ties are broken by registration order
//! - **Loud failure**: an unknown dependency or a stuck pass is an error,
//!   never a silent skip
//!
//! # Resolution Rules
//!
//! | Situation | Result |
//! |-----------|--------|
//! | dependency id not registered | `Unresolved` for the first offending unit |
//! | unit already applied | omitted from the output |
//! | every dependency applied or scheduled earlier | scheduled in this pass |
//! | pass schedules nothing, units remain | `Cycle` with the stuck ids |

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::descriptor::MigrationDescriptor;

/// Reasons the resolver refuses to produce an order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("'{id}' depends on unregistered '{missing}'")]
    Unresolved { id: String, missing: String },

    #[error("no progress possible for: {}", remaining.join(", "))]
    Cycle { remaining: Vec<String> },
}

// ============================================================================
// Ordering
// ============================================================================

/// Compute the run order of pending units.
///
/// `descriptors` must be in registration order. Returns indices into
/// `descriptors` for every unit without an entry in `applied`.
pub fn resolve(
    descriptors: &[&MigrationDescriptor],
    applied: &HashSet<String>,
) -> Result<Vec<usize>, ResolveError> {
    let registered: HashSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();

    for d in descriptors {
        if let Some(missing) = d
            .dependencies
            .iter()
            .find(|dep| !registered.contains(dep.as_str()))
        {
            return Err(ResolveError::Unresolved {
                id: d.id.clone(),
                missing: missing.clone(),
            });
        }
    }

    let mut pending: Vec<usize> = (0..descriptors.len())
        .filter(|&i| !applied.contains(&descriptors[i].id))
        .collect();
    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let mut deferred = Vec::new();
        for &i in &pending {
            let d = descriptors[i];
            let ready = d
                .dependencies
                .iter()
                .all(|dep| applied.contains(dep) || scheduled.contains(dep.as_str()));
            if ready {
                scheduled.insert(d.id.as_str());
                order.push(i);
            } else {
                deferred.push(i);
            }
        }

        if deferred.len() == pending.len() {
            return Err(ResolveError::Cycle {
                remaining: deferred.iter().map(|&i| descriptors[i].id.clone()).collect(),
            });
        }
        pending = deferred;
    }

    Ok(order)
}

// ============================================================================
// Unresolvable Units
// ============================================================================

/// Ids whose dependencies can never be satisfied.
///
/// A unit is unresolvable when it depends, directly or transitively, on an
/// unregistered id or on a unit caught in a cycle. Units on the cycle itself
/// are included.
pub fn unresolvable(descriptors: &[&MigrationDescriptor]) -> BTreeSet<String> {
    let by_id: HashMap<&str, &MigrationDescriptor> =
        descriptors.iter().map(|d| (d.id.as_str(), *d)).collect();

    // Fixed point: a unit is satisfiable once all its deps are satisfiable.
    let mut satisfiable: HashSet<&str> = HashSet::new();
    loop {
        let before = satisfiable.len();
        for d in descriptors {
            if satisfiable.contains(d.id.as_str()) {
                continue;
            }
            let ok = d.dependencies.iter().all(|dep| {
                by_id.contains_key(dep.as_str()) && satisfiable.contains(dep.as_str())
            });
            if ok {
                satisfiable.insert(d.id.as_str());
            }
        }
        if satisfiable.len() == before {
            break;
        }
    }

    descriptors
        .iter()
        .filter(|d| !satisfiable.contains(d.id.as_str()))
        .map(|d| d.id.clone())
        .collect()
}
