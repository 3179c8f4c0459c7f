//! Cache configuration.
//!
//! Caching is purely a performance concern: every policy, including
//! [`CachePolicy::Disabled`], yields byte-identical reads.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::OpenError;

/// Default resident byte budget of one cache tier (16 MiB).
pub const DEFAULT_CACHE_BUDGET: usize = 16 * 1024 * 1024;

/// Eviction strategy shared by every cache tier of an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Drop the whole tier once it would exceed its entry budget.
    #[default]
    ClearOnFull,
    /// Evict the least recently used entry.
    Lru,
    /// Never keep anything.
    Disabled,
}

/// Per-tier byte budgets and the eviction policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub policy: CachePolicy,
    /// Budget of the decoded-sector tier.
    pub sector_budget: usize,
    /// Budget of the raw-cluster tier.
    pub cluster_budget: usize,
    /// Budget of the second-level table tier.
    pub table_budget: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::ClearOnFull,
            sector_budget: DEFAULT_CACHE_BUDGET,
            cluster_budget: DEFAULT_CACHE_BUDGET,
            table_budget: DEFAULT_CACHE_BUDGET,
        }
    }
}

impl CacheConfig {
    /// A configuration that caches nothing.
    pub fn disabled() -> Self {
        Self {
            policy: CachePolicy::Disabled,
            ..Self::default()
        }
    }

    /// Parses a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// [`OpenError::InvalidConfig`] on malformed JSON or a zero budget.
    pub fn from_json_str(json: &str) -> Result<Self, OpenError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| OpenError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            OpenError::InvalidConfig(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), OpenError> {
        if self.policy == CachePolicy::Disabled {
            return Ok(());
        }
        for (name, budget) in [
            ("sector_budget", self.sector_budget),
            ("cluster_budget", self.cluster_budget),
            ("table_budget", self.table_budget),
        ] {
            if budget == 0 {
                return Err(OpenError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "policy": "lru", "table_budget": 4096 }"#)
            .unwrap();
        assert_eq!(config.policy, CachePolicy::Lru);
        assert_eq!(config.table_budget, 4096);
        assert_eq!(config.sector_budget, DEFAULT_CACHE_BUDGET);
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "cluster_budget": 0 }"#),
            Err(OpenError::InvalidConfig(_))
        ));
        // A disabled cache never allocates, so its budgets do not matter.
        assert!(CacheConfig::from_json_str(r#"{ "policy": "disabled", "cluster_budget": 0 }"#)
            .is_ok());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "policy": "fifo" }"#),
            Err(OpenError::InvalidConfig(_))
        ));
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = CacheConfig {
            policy: CachePolicy::Lru,
            sector_budget: 1024,
            ..CacheConfig::default()
        };
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(CacheConfig::from_json_file(&path).unwrap(), config);
    }
}
