//! In-process registry of migration units
//!
//! Keeps units in registration order (the resolver's tie-breaker) with an id
//! index for lookups. Units are immutable once registered.

use std::collections::HashMap;

use crate::descriptor::MigrationDescriptor;
use crate::error::{EngineError, Result};
use crate::unit::MigrationUnit;

/// Ordered collection of registered units
#[derive(Default)]
pub struct MigrationRegistry {
    units: Vec<Box<dyn MigrationUnit>>,
    index: HashMap<String, usize>,
}

impl MigrationRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a unit.
    ///
    /// # Errors
    ///
    /// - `Validation` if the descriptor or the unit fail static checks
    /// - `DuplicateId` if a unit with the same id is already registered
    pub fn register(&mut self, unit: Box<dyn MigrationUnit>) -> Result<()> {
        let descriptor = unit.descriptor();
        let mut errors = descriptor.structural_errors();
        errors.extend(unit.validation_errors());
        if !errors.is_empty() {
            return Err(EngineError::Validation {
                id: descriptor.id.clone(),
                errors,
            });
        }

        if self.index.contains_key(&descriptor.id) {
            return Err(EngineError::DuplicateId {
                id: descriptor.id.clone(),
            });
        }

        self.index.insert(descriptor.id.clone(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    /// Get a unit by id
    pub fn get(&self, id: &str) -> Option<&dyn MigrationUnit> {
        self.index.get(id).map(|&i| self.units[i].as_ref())
    }

    /// Unit at a registration position
    pub fn at(&self, position: usize) -> Option<&dyn MigrationUnit> {
        self.units.get(position).map(|u| u.as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All units in registration order
    pub fn iter(&self) -> impl Iterator<Item = &dyn MigrationUnit> {
        self.units.iter().map(|u| u.as_ref())
    }

    /// All descriptors in registration order
    pub fn descriptors(&self) -> Vec<&MigrationDescriptor> {
        self.units.iter().map(|u| u.descriptor()).collect()
    }

    /// Registered ids that declare `id` as a dependency
    pub fn dependents_of(&self, id: &str) -> Vec<&MigrationDescriptor> {
        self.units
            .iter()
            .map(|u| u.descriptor())
            .filter(|d| d.depends_on(id))
            .collect()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.units.iter().map(|u| &u.descriptor().id))
            .finish()
    }
}
