//! Cache configuration.

use crate::{ConfigError, ConfigResult};
use std::time::Duration;

/// Default staleness window protecting recently used rulesets from eviction.
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(300);

/// Default cap on variable-variations kept per hierarchy level.
pub const DEFAULT_VARIATION_THRESHOLD: usize = 10;

/// Default bounded-retry cap for busy transaction begins.
pub const DEFAULT_BUSY_RETRY_CAP: u32 = 50;

/// Default durable-store map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 256;

/// Configuration for the two-tier hierarchy cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Durable-store size cap in bytes. `None` disables eviction.
    pub size_limit: Option<u64>,
    /// When limiting size, only evict rulesets idle for at least this long.
    pub stale_window: Duration,
    /// Whether size limiting skips rulesets inside the staleness window.
    pub remove_only_stale: bool,
    /// Maximum variable-variations kept per hierarchy level after merge.
    pub variation_threshold: usize,
    /// Retry cap for transaction begins hitting a busy store.
    pub busy_retry_cap: u32,
    /// Durable-store map size in megabytes.
    pub map_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: None,
            stale_window: DEFAULT_STALE_WINDOW,
            remove_only_stale: true,
            variation_threshold: DEFAULT_VARIATION_THRESHOLD,
            busy_retry_cap: DEFAULT_BUSY_RETRY_CAP,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl CacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable-store size cap in bytes.
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Set the staleness window.
    pub fn with_stale_window(mut self, window: Duration) -> Self {
        self.stale_window = window;
        self
    }

    /// Allow or forbid evicting rulesets inside the staleness window.
    pub fn with_remove_only_stale(mut self, only_stale: bool) -> Self {
        self.remove_only_stale = only_stale;
        self
    }

    /// Set the per-level variation cap.
    pub fn with_variation_threshold(mut self, threshold: usize) -> Self {
        self.variation_threshold = threshold;
        self
    }

    /// Set the busy-retry cap.
    pub fn with_busy_retry_cap(mut self, cap: u32) -> Self {
        self.busy_retry_cap = cap;
        self
    }

    /// Set the durable-store map size in megabytes.
    pub fn with_map_size_mb(mut self, mb: usize) -> Self {
        self.map_size_mb = mb;
        self
    }

    /// Validate knob combinations.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.variation_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "variation_threshold".to_string(),
                value: "0".to_string(),
                reason: "at least one variation must be kept per level".to_string(),
            });
        }
        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "durable store needs a non-zero map size".to_string(),
            });
        }
        if let Some(limit) = self.size_limit {
            if limit == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "size_limit".to_string(),
                    value: "0".to_string(),
                    reason: "a zero cap would evict every ruleset".to_string(),
                });
            }
        }
        Ok(())
    }
}
