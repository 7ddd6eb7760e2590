//! Engine configuration file handling.
//!
//! Settings are stored as JSON. Every field has a default, so a partial file
//! (or none at all) is valid. CLI flags override file values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::{DEFAULT_LEDGER_TABLE, is_valid_table_name};

/// Coordinator and CLI settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database holding the ledger (and the migrated data)
    pub database: PathBuf,

    /// Directory of JSON migration manifests
    pub migrations_dir: PathBuf,

    pub ledger_table: String,

    /// Times `apply` is invoked before a unit is declared failed
    pub max_apply_attempts: u32,

    pub lock_ttl_secs: u64,

    pub lock_name: String,

    /// Copy the database here before each non-dry-run batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("migrations.db"),
            migrations_dir: PathBuf::from("migrations"),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            max_apply_attempts: 1,
            lock_ttl_secs: 300,
            lock_name: "migrations".to_string(),
            backup_path: None,
        }
    }
}

impl EngineConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !is_valid_table_name(&self.ledger_table) {
            anyhow::bail!(
                "Ledger table '{}' must start with a letter or underscore and contain only letters, numbers and underscores",
                self.ledger_table
            );
        }
        if self.max_apply_attempts == 0 {
            anyhow::bail!("max_apply_attempts must be at least 1");
        }
        if self.lock_ttl_secs == 0 {
            anyhow::bail!("lock_ttl_secs must be greater than 0");
        }
        if self.lock_name.trim().is_empty() {
            anyhow::bail!("lock_name must not be empty");
        }
        if self.database.as_os_str().is_empty() {
            anyhow::bail!("database path must be specified");
        }
        Ok(())
    }

    #[inline]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_apply_attempts": 3}"#).expect("Should parse");
        assert_eq!(config.max_apply_attempts, 3);
        assert_eq!(config.ledger_table, DEFAULT_LEDGER_TABLE);
    }

    #[test]
    fn test_save_and_load() {
        let file = NamedTempFile::new().expect("temp file");
        let config = EngineConfig {
            ledger_table: "schema_history".into(),
            backup_path: Some(PathBuf::from("backup.db")),
            ..EngineConfig::default()
        };
        config.save_to_file(file.path()).expect("save");
        let loaded = EngineConfig::load_from_file(file.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_table = EngineConfig {
            ledger_table: "drop table".into(),
            ..EngineConfig::default()
        };
        assert!(bad_table.validate().is_err());

        let zero_attempts = EngineConfig {
            max_apply_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(zero_attempts.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = EngineConfig::load_from_file("/nonexistent/engine.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration"));
    }
}
