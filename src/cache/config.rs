//! Cache configuration.
//!
//! Controls the document cache, delete debouncing and write suppression via
//! the `[cache]` table of `flusso.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_BACKFILL_DEBOUNCE_MS: u64 = 100;
const DEFAULT_SUPPRESSION_TTL_MS: u64 = 2000;
const DEFAULT_LOCK_STRIPES: usize = 64;

/// Cache configuration from `flusso.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reads from and keep the document cache.
    pub enabled: bool,
    /// Log cache purges at warn level instead of debug.
    pub debug: bool,
    /// Window (ms) over which deletes on one entry are batched before refilling.
    pub backfill_debounce_ms: u64,
    /// Lifetime (ms) of a writer suppression record.
    pub suppression_ttl_ms: u64,
    /// Drop a suppression record once its change has been dispatched.
    pub release_suppression_after_dispatch: bool,
    /// Delete a cache entry when its last subscriber leaves.
    pub evict_on_last_detach: bool,
    /// Number of striped locks serializing entry mutations.
    pub lock_stripes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            backfill_debounce_ms: DEFAULT_BACKFILL_DEBOUNCE_MS,
            suppression_ttl_ms: DEFAULT_SUPPRESSION_TTL_MS,
            release_suppression_after_dispatch: true,
            evict_on_last_detach: true,
            lock_stripes: DEFAULT_LOCK_STRIPES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            debug: settings.debug,
            backfill_debounce_ms: settings.backfill_debounce_ms,
            suppression_ttl_ms: settings.suppression_ttl_ms,
            release_suppression_after_dispatch: settings.release_suppression_after_dispatch,
            evict_on_last_detach: settings.evict_on_last_detach,
            lock_stripes: settings.lock_stripes,
        }
    }
}

impl CacheConfig {
    /// Configuration with the document cache turned off; change feeds still run.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn backfill_debounce(&self) -> Duration {
        Duration::from_millis(self.backfill_debounce_ms)
    }

    pub fn suppression_ttl(&self) -> Duration {
        Duration::from_millis(self.suppression_ttl_ms)
    }

    /// Returns the lock stripe count as NonZeroUsize, clamping to 1 if zero.
    pub fn lock_stripes_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.lock_stripes).unwrap_or(NonZeroUsize::MIN)
    }
}
