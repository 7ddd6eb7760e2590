//! Migration descriptors
//!
//! Every migration unit carries an immutable [`MigrationDescriptor`]: its id,
//! display metadata, classification and declared dependencies. Descriptors are
//! validated structurally before a unit can be registered.
//!
//! # Descriptor Format
//!
//! Descriptors serialize to JSON with the following structure:
//! ```json
//! {
//!   "id": "0002_add_email_index",
//!   "name": "Add email index",
//!   "version": "1.1.0",
//!   "kind": "schema",
//!   "dependencies": ["0001_create_users"],
//!   "supports_rollback": true,
//!   "author": "platform-team"
//! }
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{EngineError, Result};

/// Classification of a migration, used for filtering and reporting only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MigrationKind {
    /// DDL changes (tables, columns, indexes)
    #[default]
    Schema,
    /// Backfills and data rewrites
    Data,
    /// Configuration rows
    Config,
    /// Feature rollouts
    Feature,
}

/// Immutable metadata attached to each migration unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    /// Globally unique identifier; primary key in the ledger
    pub id: String,

    /// Human-readable label
    pub name: String,

    /// Display/audit version; never used for ordering
    pub version: String,

    #[serde(default)]
    pub kind: MigrationKind,

    /// Ids that must be applied before this unit may run
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// When false the coordinator never attempts a revert
    #[serde(default)]
    pub supports_rollback: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl MigrationDescriptor {
    /// Create a new descriptor builder
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(id, name)
    }

    /// Run the static checks and collect every problem found.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        } else if self.id.chars().any(char::is_whitespace) {
            errors.push(format!("id '{}' must not contain whitespace", self.id));
        }
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            errors.push("version must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.trim().is_empty() {
                errors.push("dependency id must not be empty".to_string());
            } else if dep == &self.id {
                errors.push(format!("'{}' cannot depend on itself", self.id));
            } else if !seen.insert(dep.as_str()) {
                errors.push(format!("duplicate dependency: {}", dep));
            }
        }

        errors
    }

    /// Validate the descriptor, failing with [`EngineError::Validation`].
    pub fn validate(&self) -> Result<()> {
        let errors = self.structural_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation {
                id: self.id.clone(),
                errors,
            })
        }
    }

    /// Whether this unit declares `id` as a dependency
    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|d| d == id)
    }
}

/// Parse a kind name, reporting the allowed set on failure
pub fn parse_kind(value: &str) -> Result<MigrationKind> {
    value.parse().map_err(|_| {
        EngineError::validation(
            value,
            format!("kind '{}' is not one of schema, data, config, feature", value),
        )
    })
}

/// Builder for creating MigrationDescriptor instances
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    id: String,
    name: String,
    version: String,
    kind: MigrationKind,
    dependencies: Vec<String>,
    supports_rollback: bool,
    created_at: Option<DateTime<Utc>>,
    author: Option<String>,
}

impl DescriptorBuilder {
    /// Create a new builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0".to_string(),
            kind: MigrationKind::Schema,
            dependencies: Vec::new(),
            supports_rollback: false,
            created_at: None,
            author: None,
        }
    }

    /// Set version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set classification
    pub fn kind(mut self, kind: MigrationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a dependency on another migration id
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Mark the unit as providing a revert
    pub fn reversible(mut self) -> Self {
        self.supports_rollback = true;
        self
    }

    /// Set provenance timestamp
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Build the descriptor
    pub fn build(self) -> Result<MigrationDescriptor> {
        let descriptor = MigrationDescriptor {
            id: self.id,
            name: self.name,
            version: self.version,
            kind: self.kind,
            dependencies: self.dependencies,
            supports_rollback: self.supports_rollback,
            created_at: self.created_at,
            author: self.author,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
