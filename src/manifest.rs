//! SQL migration manifests
//!
//! A manifest is a JSON file embedding a descriptor plus the SQL to run.
//! Loaded manifests become [`SqlMigration`] units executed through
//! [`TargetStore::execute_batch`](crate::ledger::TargetStore::execute_batch).
//!
//! # Manifest Format
//!
//! ```json
//! {
//!   "id": "0002_add_email_index",
//!   "name": "Add email index",
//!   "version": "1.1.0",
//!   "kind": "schema",
//!   "dependencies": ["0001_create_users"],
//!   "supports_rollback": true,
//!   "apply_sql": "CREATE INDEX idx_users_email ON users(email);",
//!   "revert_sql": "DROP INDEX idx_users_email;"
//! }
//! ```
//!
//! `supports_rollback` must match the presence of `revert_sql`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::MigrationDescriptor;
use crate::unit::{MigrationContext, MigrationUnit};

/// Errors that can occur while loading manifests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// Manifest directory does not exist
    #[error("Manifest directory not found: {path}")]
    DirectoryNotFound { path: String },

    /// Invalid manifest format
    #[error("Invalid manifest {file}: {reason}")]
    InvalidFormat { file: String, reason: String },

    /// IO error reading a manifest
    #[error("Failed to read manifest: {reason}")]
    IoError { reason: String },
}

impl From<std::io::Error> for ManifestError {
    fn from(err: std::io::Error) -> Self {
        ManifestError::IoError {
            reason: err.to_string(),
        }
    }
}

/// SQL-bodied migration unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlMigration {
    #[serde(flatten)]
    pub descriptor: MigrationDescriptor,

    pub apply_sql: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_sql: Option<String>,

    /// File the manifest was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl SqlMigration {
    pub fn new(descriptor: MigrationDescriptor, apply_sql: impl Into<String>) -> Self {
        Self {
            descriptor,
            apply_sql: apply_sql.into(),
            revert_sql: None,
            source: None,
        }
    }

    pub fn with_revert_sql(mut self, sql: impl Into<String>) -> Self {
        self.revert_sql = Some(sql.into());
        self
    }

    /// Load a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Self::parse(json, "<inline>")
    }

    /// Load a manifest from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut manifest = Self::parse(&content, &path.display().to_string())?;
        manifest.source = Some(path.to_path_buf());
        Ok(manifest)
    }

    fn parse(json: &str, file: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json).map_err(|e| ManifestError::InvalidFormat {
            file: file.to_string(),
            reason: e.to_string(),
        })?;
        if manifest.apply_sql.trim().is_empty() {
            return Err(ManifestError::InvalidFormat {
                file: file.to_string(),
                reason: "apply_sql must not be empty".into(),
            });
        }
        Ok(manifest)
    }
}

impl MigrationUnit for SqlMigration {
    fn descriptor(&self) -> &MigrationDescriptor {
        &self.descriptor
    }

    fn apply(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        ctx.target().execute_batch(&self.apply_sql)?;
        Ok(())
    }

    fn revert(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<()> {
        match &self.revert_sql {
            Some(sql) => {
                ctx.target().execute_batch(sql)?;
                Ok(())
            }
            None => anyhow::bail!("migration '{}' has no revert_sql", self.descriptor.id),
        }
    }

    fn validation_errors(&self) -> Vec<String> {
        let has_revert = self.revert_sql.as_ref().is_some_and(|s| !s.trim().is_empty());
        match (self.descriptor.supports_rollback, has_revert) {
            (true, false) => vec!["supports_rollback is set but revert_sql is missing".into()],
            (false, true) => vec!["revert_sql is present but supports_rollback is false".into()],
            _ => Vec::new(),
        }
    }
}

/// Load every `*.json` manifest in `dir`, ordered by file name.
pub fn load_from_directory(dir: impl AsRef<Path>) -> Result<Vec<SqlMigration>, ManifestError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(ManifestError::DirectoryNotFound {
            path: dir.display().to_string(),
        });
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let manifests = paths
        .iter()
        .map(SqlMigration::from_file)
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(dir = %dir.display(), count = manifests.len(), "Loaded migration manifests");
    Ok(manifests)
}
