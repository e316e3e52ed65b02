//! # Eviction Engine
//!
//! Keeps the dataset inside the configured memory budget with a **sampled**
//! approximation of LRU/LFU rather than exact bookkeeping: when the budget
//! is exceeded, a handful of keys per database is sampled, scored, and fed
//! into a small sorted candidate pool; the worst-scoring live candidate is
//! deleted, and the loop repeats until enough bytes are credited back.
//!
//! ## Scores
//!
//! Higher score = better eviction candidate:
//!
//! - **LRU**: estimated idle time in milliseconds, from the entry's 24-bit
//!   wrapping clock stamp.
//! - **LFU**: `255 − counter`, where the counter is read with decay applied
//!   (but never written back during sampling — the entry's stored counter
//!   only changes on real access).
//! - **TTL**: `u64::MAX − expiry`, so sooner-expiring keys rank higher.
//!
//! ## The pool
//!
//! The [`EvictionPool`] holds up to 16 candidates sorted ascending by score
//! and persists across calls, so good candidates found in one pass still
//! compete in the next. Pool entries keep their own key copies (inline up to
//! 255 bytes) and may go stale when the key is deleted by other means; the
//! pick step tolerates and discards stale entries.
//!
//! ## Accounting caveat
//!
//! With lazy free enabled, the value's bytes are only credited back when the
//! background worker drops it, so `freed` under-counts while jobs are in
//! flight. Two mitigations, both intentional: every 16th lazy deletion
//! re-checks the real budget standing, and when the loop cannot reach its
//! target it waits out the lazy-free queue in 1 ms slices before declaring
//! memory pressure.

use std::cell::Cell;
use std::thread;
use std::time::Duration;

use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info};

use crate::background::{BackgroundWorkers, JobKind};
use crate::config::{CoreConfig, EvictionPolicy};
use crate::db::{Db, Key};
use crate::mem::{MemoryUsage, memory_state};
use crate::object::{AccessMeta, LFU_INIT_VAL, LRU_CLOCK_MAX, LRU_CLOCK_RESOLUTION_MS, Object};
use crate::util::{unix_millis, unix_seconds};


/// Candidate pool capacity.
pub const EVICTION_POOL_SIZE: usize = 16;

/// Key bytes stored inline in a pool entry; longer keys spill to the heap.
pub const POOL_KEY_INLINE: usize = 256;

// ------------------------------------------------------------------------------------------------
// LRU clock
// ------------------------------------------------------------------------------------------------

/// Cached coarse clock for LRU stamps: wall time divided by the clock
/// resolution, truncated to 24 bits.
///
/// The cache is refreshed by a maintenance timer (at least once per
/// resolution tick) so the hot read path never takes a time syscall;
/// [`LruClock::set`] installs an externally computed value.
pub struct LruClock {
    cached: Cell<u32>,
}

impl LruClock {
    pub fn new() -> Self {
        Self {
            cached: Cell::new(Self::compute()),
        }
    }

    /// The clock value for the current wall time.
    pub fn compute() -> u32 {
        ((unix_millis() / LRU_CLOCK_RESOLUTION_MS) & LRU_CLOCK_MAX as u64) as u32
    }

    /// Re-reads the wall clock into the cache.
    pub fn refresh(&self) {
        self.cached.set(Self::compute());
    }

    /// Installs a clock value directly.
    pub fn set(&self, ticks: u32) {
        self.cached.set(ticks & LRU_CLOCK_MAX);
    }

    /// The cached clock value.
    pub fn now(&self) -> u32 {
        self.cached.get()
    }
}

impl Default for LruClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the entry was last stamped, treating at most one wrap
/// of the 24-bit clock as legitimate.
pub fn estimate_idle(meta: AccessMeta, clock_now: u32) -> u64 {
    let stamp = meta.lru_stamp();
    let ticks = if clock_now >= stamp {
        clock_now - stamp
    } else {
        clock_now + (LRU_CLOCK_MAX - stamp)
    };
    ticks as u64 * LRU_CLOCK_RESOLUTION_MS
}

// ------------------------------------------------------------------------------------------------
// LFU counter
// ------------------------------------------------------------------------------------------------

/// Current unix time in minutes, truncated to 16 bits — the "last decrement
/// time" format stored next to the LFU counter.
pub fn lfu_time_in_minutes() -> u16 {
    ((unix_seconds() / 60) & 0xFFFF) as u16
}

/// Minutes elapsed since `ldt`, assuming at most one 16-bit wrap.
pub fn lfu_time_elapsed(ldt: u16, now_minutes: u16) -> u64 {
    if now_minutes >= ldt {
        (now_minutes - ldt) as u64
    } else {
        65535 - ldt as u64 + now_minutes as u64
    }
}

/// Probabilistically increments the logarithmic counter: the higher it
/// already is, the less likely the increment. Saturates at 255.
pub fn lfu_log_incr(counter: u8, log_factor: u32) -> u8 {
    if counter == 255 {
        return 255;
    }
    let r: f64 = rand::random();
    let baseval = (counter as f64 - LFU_INIT_VAL as f64).max(0.0);
    let p = 1.0 / (baseval * log_factor as f64 + 1.0);
    if r < p { counter + 1 } else { counter }
}

/// Reads the counter with time decay applied: one decrement per elapsed
/// `decay_minutes` period, floored at zero. Pure — the stored meta is not
/// updated; decay only persists when the entry is actually accessed.
pub fn lfu_decr_and_return(meta: AccessMeta, now_minutes: u16, decay_minutes: u64) -> u8 {
    let counter = meta.lfu_counter();
    let periods = if decay_minutes > 0 {
        lfu_time_elapsed(meta.lfu_decr_minute(), now_minutes) / decay_minutes
    } else {
        0
    };
    if periods == 0 {
        counter
    } else {
        counter.saturating_sub(periods.min(255) as u8)
    }
}

// ------------------------------------------------------------------------------------------------
// Access-meta hooks
// ------------------------------------------------------------------------------------------------

/// Access meta for a freshly created object under the configured policy.
pub fn initial_access(cfg: &CoreConfig, clock: &LruClock) -> AccessMeta {
    if cfg.max_memory_policy.is_lfu() {
        AccessMeta::new_lfu(lfu_time_in_minutes())
    } else {
        AccessMeta::new_lru(clock.now())
    }
}

/// The on-read update hook: stamps the LRU clock, or applies pending LFU
/// decay and then the probabilistic increment.
pub fn touch(meta: &mut AccessMeta, cfg: &CoreConfig, clock: &LruClock) {
    if cfg.max_memory_policy.is_lfu() {
        let now_minutes = lfu_time_in_minutes();
        let counter = lfu_decr_and_return(*meta, now_minutes, cfg.lfu_decay_time);
        meta.set_lfu(now_minutes, lfu_log_incr(counter, cfg.lfu_log_factor));
    } else {
        meta.set_lru_stamp(clock.now());
    }
}

// ------------------------------------------------------------------------------------------------
// Eviction pool
// ------------------------------------------------------------------------------------------------

/// A candidate queued for eviction. The key is a copy: the entry may
/// outlive the key it names.
pub struct PoolEntry {
    pub score: u64,
    pub key: SmallVec<[u8; POOL_KEY_INLINE]>,
    pub db_id: usize,
}

/// Fixed-capacity candidate buffer, sorted ascending by score.
#[derive(Default)]
pub struct EvictionPool {
    entries: Vec<PoolEntry>,
}

impl EvictionPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(EVICTION_POOL_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidates in ascending score order.
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    /// Tries to admit a candidate, keeping the pool sorted. While there is
    /// room every candidate enters at its rank; once full, only a candidate
    /// beating the current maximum enters, displacing the minimum.
    pub fn offer(&mut self, score: u64, key: &[u8], db_id: usize) {
        if self.entries.len() < EVICTION_POOL_SIZE {
            let at = self.entries.partition_point(|e| e.score < score);
            self.entries.insert(
                at,
                PoolEntry {
                    score,
                    key: SmallVec::from_slice(key),
                    db_id,
                },
            );
            return;
        }

        let current_max = self.entries[self.entries.len() - 1].score;
        if score > current_max {
            self.entries.remove(0);
            self.entries.push(PoolEntry {
                score,
                key: SmallVec::from_slice(key),
                db_id,
            });
        }
    }

    /// Removes and returns the highest-scoring candidate.
    pub fn pop_best(&mut self) -> Option<PoolEntry> {
        self.entries.pop()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Evictor
// ------------------------------------------------------------------------------------------------

/// Returned when the budget is exceeded and the policy cannot (or may not)
/// free enough. Command dispatch is expected to refuse memory-growing
/// writes while this persists. Never fatal.
#[derive(Debug, Error)]
#[error("memory budget exceeded: {logical} bytes used of {max_memory} allowed")]
pub struct MemoryPressure {
    pub logical: u64,
    pub max_memory: u64,
}

/// Collaborator notifications for each eviction: expiry/delete propagation,
/// keyspace notifications, metrics.
pub trait EvictionHooks {
    fn on_evict(&mut self, db_id: usize, key: &[u8]);
}

/// No-op hooks.
pub struct NoHooks;

impl EvictionHooks for NoHooks {
    fn on_evict(&mut self, _db_id: usize, _key: &[u8]) {}
}

/// Owns the candidate pool and the round-robin cursor of the random
/// policies. One per engine, living on the core thread.
#[derive(Default)]
pub struct Evictor {
    pool: EvictionPool,
    next_random_db: usize,
    evicted_keys: u64,
}

impl Evictor {
    pub fn new() -> Self {
        Self {
            pool: EvictionPool::new(),
            next_random_db: 0,
            evicted_keys: 0,
        }
    }

    /// Total keys evicted over the lifetime of this evictor.
    pub fn evicted_keys(&self) -> u64 {
        self.evicted_keys
    }

    pub fn pool(&self) -> &EvictionPool {
        &self.pool
    }

    /// Samples one database into the pool, scoring each key per the policy.
    /// For the volatile policies candidates come from the expires dict; LRU
    /// and LFU scores still read the stored object from the main dict.
    pub fn populate(&mut self, db: &Db, cfg: &CoreConfig, clock: &LruClock) {
        Self::populate_into(&mut self.pool, db, cfg, clock);
    }

    fn populate_into(pool: &mut EvictionPool, db: &Db, cfg: &CoreConfig, clock: &LruClock) {
        let policy = cfg.max_memory_policy;
        if policy.is_all_keys() {
            for (key, obj) in db.keys.sample(cfg.max_memory_samples) {
                pool.offer(Self::score_object(obj, cfg, clock), key, db.id);
            }
            return;
        }

        for (key, expiry) in db.expires.sample(cfg.max_memory_samples) {
            let score = if policy == EvictionPolicy::VolatileTtl {
                u64::MAX - *expiry
            } else {
                match db.keys.peek(key) {
                    Some(obj) => Self::score_object(obj, cfg, clock),
                    // Expiry without a live entry: sampling raced a delete.
                    None => continue,
                }
            };
            pool.offer(score, key, db.id);
        }
    }

    fn score_object(obj: &Object, cfg: &CoreConfig, clock: &LruClock) -> u64 {
        if cfg.max_memory_policy.is_lru() {
            estimate_idle(obj.access, clock.now())
        } else {
            255 - lfu_decr_and_return(obj.access, lfu_time_in_minutes(), cfg.lfu_decay_time) as u64
        }
    }

    /// Brings memory usage back under `cfg.max_memory`, evicting keys per
    /// the configured policy. `dbs` must be indexed by database id
    /// (`dbs[i].id == i`).
    ///
    /// Returns `Ok` when already under budget, when enough was freed, or
    /// when the replica bypass applies; [`MemoryPressure`] otherwise.
    pub fn ensure_headroom(
        &mut self,
        dbs: &mut [Db],
        mem: &dyn MemoryUsage,
        workers: &BackgroundWorkers,
        cfg: &CoreConfig,
        clock: &LruClock,
        hooks: &mut dyn EvictionHooks,
    ) -> Result<(), MemoryPressure> {
        // Replicas mirror their master byte-for-byte; the master's own
        // evictions arrive as replicated deletes.
        if cfg.is_replica && cfg.replica_ignore_max_memory {
            return Ok(());
        }

        let state = memory_state(mem, cfg.max_memory);
        if !state.over_budget {
            return Ok(());
        }
        let to_free = state.to_free;
        let mut freed = 0u64;
        let mut keys_freed = 0u64;

        if cfg.max_memory_policy != EvictionPolicy::NoEviction {
            while freed < to_free {
                let best = self.select_victim(dbs, cfg, clock);
                let Some((db_id, key)) = best else {
                    // Nothing evictable remains under this policy.
                    break;
                };

                let snapshot = mem.used_bytes();
                let db = &mut dbs[db_id];
                if cfg.lazy_free_on_eviction {
                    db.remove_async(&key, workers);
                } else {
                    db.remove_sync(&key);
                }
                freed += snapshot.saturating_sub(mem.used_bytes());
                self.evicted_keys += 1;
                keys_freed += 1;
                hooks.on_evict(db_id, &key);
                debug!(db = db_id, freed, to_free, "evicted key");

                // Lazy deletions release most bytes on the worker, so the
                // inline delta under-counts; periodically consult the real
                // standing and stop early once it is satisfied.
                if cfg.lazy_free_on_eviction
                    && keys_freed % 16 == 0
                    && !memory_state(mem, cfg.max_memory).over_budget
                {
                    freed = to_free;
                }
            }
        }

        if freed >= to_free {
            info!(freed, keys_freed, "memory budget restored");
            return Ok(());
        }

        // Last resort: in-flight lazy-free jobs may still return enough
        // bytes. Wait them out in small slices, re-checking as we go.
        while workers.pending(JobKind::LazyFree) > 0 {
            if !memory_state(mem, cfg.max_memory).over_budget {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        let state = memory_state(mem, cfg.max_memory);
        if !state.over_budget {
            return Ok(());
        }

        debug!(
            logical = state.logical,
            max_memory = cfg.max_memory,
            "unable to restore memory budget"
        );
        Err(MemoryPressure {
            logical: state.logical,
            max_memory: cfg.max_memory,
        })
    }

    /// Picks the next victim under the configured policy, or None when no
    /// database has an evictable key.
    fn select_victim(
        &mut self,
        dbs: &[Db],
        cfg: &CoreConfig,
        clock: &LruClock,
    ) -> Option<(usize, Key)> {
        if dbs.is_empty() {
            return None;
        }
        let policy = cfg.max_memory_policy;

        if policy.uses_pool() {
            loop {
                // Refill from every database so the choice is global, not
                // biased to whichever db happened to be sampled first.
                let mut total_keys = 0usize;
                for db in dbs.iter() {
                    let keys = if policy.is_all_keys() {
                        db.keys.len()
                    } else {
                        db.expires.len()
                    };
                    if keys == 0 {
                        continue;
                    }
                    Self::populate_into(&mut self.pool, db, cfg, clock);
                    total_keys += keys;
                }
                if total_keys == 0 {
                    return None;
                }

                // Walk candidates best-first; stale entries (key deleted
                // since pooling) are discarded and we keep looking.
                while let Some(entry) = self.pool.pop_best() {
                    let key: Key = entry.key.to_vec();
                    let db = &dbs[entry.db_id];
                    let live = if policy.is_all_keys() {
                        db.keys.contains(&key)
                    } else {
                        db.expires.contains(&key)
                    };
                    if live {
                        return Some((entry.db_id, key));
                    }
                }
                // Pool exhausted without a live candidate: repopulate.
            }
        } else {
            // Random policies: round-robin to the next non-empty database.
            for _ in 0..dbs.len() {
                self.next_random_db = (self.next_random_db + 1) % dbs.len();
                let db = &dbs[self.next_random_db];
                let candidate = if policy.is_all_keys() {
                    db.keys.random_entry().map(|(k, _)| k.clone())
                } else {
                    db.expires.random_entry().map(|(k, _)| k.clone())
                };
                if let Some(key) = candidate {
                    return Some((self.next_random_db, key));
                }
            }
            None
        }
    }
}
