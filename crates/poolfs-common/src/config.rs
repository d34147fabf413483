//! Configuration types for poolfs
//!
//! Configuration is read from a TOML (or any format the `config` crate
//! recognizes) file, with `POOLFS__SECTION__KEY` environment overrides.

use crate::error::{Error, Result};
use crate::types::{Identity, LogLevel, PoolKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "POOLFS";

/// Root configuration for poolfs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace engine tuning
    pub namespace: NamespaceConfig,
    /// Identity recorded on created entries
    pub identity: Identity,
    /// Pools registered at startup
    pub pools: Vec<PoolConfig>,
}

impl Config {
    /// Load configuration from a file, applying environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.namespace.validate()?;
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(Error::invalid_argument("pool name cannot be empty"));
            }
            if pool.kind == PoolKind::Metadata && pool.quota != 0 {
                return Err(Error::invalid_argument(format!(
                    "metadata pool {} cannot carry a quota",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}

/// Namespace engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Upper bound on the directory entry cache footprint (bytes)
    pub dir_cache_max_size: usize,
    /// Invalidated/total ratio that triggers cache compaction
    pub dir_compact_ratio: f32,
    /// Stripe granularity for file content (bytes)
    pub file_stripe_size: u64,
    /// Serialize writers per inode with an exclusive lock
    pub file_locking: bool,
    /// Lease attached to store-level file locks (seconds)
    pub lock_lease_secs: u64,
    /// Engine log verbosity
    pub log_level: LogLevel,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            dir_cache_max_size: 1024 * 1024,   // 1 MiB
            dir_compact_ratio: 0.2,
            file_stripe_size: 32 * 1024 * 1024, // 32 MiB
            file_locking: true,
            lock_lease_secs: 120,
            log_level: LogLevel::None,
        }
    }
}

impl NamespaceConfig {
    /// Reject zero sizes and out-of-range ratios
    pub fn validate(&self) -> Result<()> {
        if self.dir_cache_max_size == 0 {
            return Err(Error::invalid_argument("dir_cache_max_size must be positive"));
        }
        validate_compact_ratio(self.dir_compact_ratio)?;
        if self.file_stripe_size == 0 {
            return Err(Error::invalid_argument("file_stripe_size must be positive"));
        }
        if self.lock_lease_secs == 0 {
            return Err(Error::invalid_argument("lock_lease_secs must be positive"));
        }
        Ok(())
    }

    /// Lease attached to store-level file locks
    #[must_use]
    pub const fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

/// Check that a compaction ratio lies in (0, 1]
pub fn validate_compact_ratio(ratio: f32) -> Result<()> {
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "dir_compact_ratio must be in (0, 1], got {ratio}"
        )))
    }
}

/// A pool registered at startup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Data or metadata pool
    pub kind: PoolKind,
    /// Pool name in the object store
    pub name: String,
    /// Path prefix governed by the pool
    pub prefix: String,
    /// Size quota in bytes (data pools only, 0 = unlimited)
    #[serde(default)]
    pub quota: u64,
}
