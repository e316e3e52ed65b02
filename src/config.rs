//! Engine configuration.
//!
//! All tunables live in one explicit [`CoreConfig`] value that the embedder
//! constructs, validates once, and passes by reference to each subsystem at
//! construction time. Subsystems never mutate it and there is no process-wide
//! configuration state.

use thiserror::Error;

/// How the engine picks victims when the memory budget is exceeded.
///
/// The `AllKeys*` policies consider every key in a database; the `Volatile*`
/// policies only consider keys that carry an expiry. `NoEviction` refuses to
/// evict and instead surfaces memory pressure to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Never evict; report memory pressure instead.
    NoEviction,
    /// Sampled least-recently-used over all keys.
    AllKeysLru,
    /// Sampled least-frequently-used over all keys.
    AllKeysLfu,
    /// Uniformly random over all keys.
    AllKeysRandom,
    /// Sampled least-recently-used over keys with an expiry.
    VolatileLru,
    /// Sampled least-frequently-used over keys with an expiry.
    VolatileLfu,
    /// Uniformly random over keys with an expiry.
    VolatileRandom,
    /// Soonest-expiring first, over keys with an expiry.
    VolatileTtl,
}

impl EvictionPolicy {
    /// True for the two LRU policies.
    pub fn is_lru(self) -> bool {
        matches!(self, Self::AllKeysLru | Self::VolatileLru)
    }

    /// True for the two LFU policies.
    pub fn is_lfu(self) -> bool {
        matches!(self, Self::AllKeysLfu | Self::VolatileLfu)
    }

    /// True for the two random policies.
    pub fn is_random(self) -> bool {
        matches!(self, Self::AllKeysRandom | Self::VolatileRandom)
    }

    /// True when victim selection goes through the sampled candidate pool
    /// (LRU, LFU, and TTL policies).
    pub fn uses_pool(self) -> bool {
        self.is_lru() || self.is_lfu() || self == Self::VolatileTtl
    }

    /// True when candidates are drawn from the whole keyspace rather than
    /// from the expiring subset.
    pub fn is_all_keys(self) -> bool {
        matches!(self, Self::AllKeysLru | Self::AllKeysLfu | Self::AllKeysRandom)
    }
}

/// Configuration rejected by [`CoreConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_memory_samples must be in 1..=64, got {0}")]
    SamplesOutOfRange(usize),

    #[error("reactor_set_size must be positive")]
    ZeroSetSize,

    #[error("lfu_decay_time of 0 disables decay; lfu policies need at least 1 minute")]
    ZeroLfuDecay,
}

/// Configuration for the engine core.
///
/// `max_memory == 0` disables the budget entirely: `ensure_headroom` becomes
/// a no-op and no eviction ever happens.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Memory ceiling in bytes. 0 means unlimited.
    pub max_memory: u64,

    /// Victim-selection policy applied when the ceiling is exceeded.
    pub max_memory_policy: EvictionPolicy,

    /// Keys sampled per database per candidate-pool refill (1..=64).
    pub max_memory_samples: usize,

    /// LFU counter growth dampening factor. Higher values make the
    /// logarithmic counter saturate more slowly.
    pub lfu_log_factor: u32,

    /// Minutes between LFU counter decrements.
    pub lfu_decay_time: u64,

    /// When true, evicted values are released on the lazy-free worker
    /// instead of inline on the core thread.
    pub lazy_free_on_eviction: bool,

    /// Capacity of the reactor's fd-indexed event table.
    pub reactor_set_size: usize,

    /// Allows the hash tables to grow and shrink on their own. Even when
    /// false, a table more than 5x overloaded is still forced to grow.
    pub rehash_enabled: bool,

    /// Replicas normally mirror the master exactly and skip local eviction.
    pub replica_ignore_max_memory: bool,

    /// Whether this instance is a replica of another.
    pub is_replica: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            max_memory_policy: EvictionPolicy::NoEviction,
            max_memory_samples: 5,
            lfu_log_factor: 10,
            lfu_decay_time: 1,
            lazy_free_on_eviction: false,
            reactor_set_size: 1024,
            rehash_enabled: true,
            replica_ignore_max_memory: true,
            is_replica: false,
        }
    }
}

impl CoreConfig {
    /// Checks the cross-field constraints the individual subsystems assume.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_samples == 0 || self.max_memory_samples > 64 {
            return Err(ConfigError::SamplesOutOfRange(self.max_memory_samples));
        }
        if self.reactor_set_size == 0 {
            return Err(ConfigError::ZeroSetSize);
        }
        if self.max_memory_policy.is_lfu() && self.lfu_decay_time == 0 {
            return Err(ConfigError::ZeroLfuDecay);
        }
        Ok(())
    }
}
