//! # Keyspace
//!
//! A [`Db`] is one logical database: a main dict mapping keys to stored
//! [`Object`]s plus a parallel dict of absolute expiry times. The eviction
//! engine samples one or the other depending on whether the policy considers
//! all keys or only the volatile (expiring) subset.
//!
//! Every mutation keeps the shared [`MemoryMeter`] in sync, so the budget
//! check sees insertions immediately. Synchronous removal credits the whole
//! entry back at once; [`Db::remove_async`] credits the key and bookkeeping
//! bytes inline but ships the value to the lazy-free worker, whose drop
//! credits the value bytes — which is why budget accounting can briefly
//! under-count while lazy-free jobs are in flight.

use std::hash::{BuildHasher, Hasher, RandomState};

use tracing::debug;

use crate::background::{BackgroundWorkers, Job, LazyFreeItem};
use crate::config::CoreConfig;
use crate::dict::{Dict, DictType};
use crate::evict::{self, LruClock};
use crate::mem::MemoryMeter;
use crate::object::{Object, Value};

#[cfg(test)]
mod tests;

/// Keys are opaque byte strings; they may contain NULs.
pub type Key = Vec<u8>;

/// Rough per-entry bookkeeping bytes (node, links, bucket share) charged to
/// the meter on top of key and value payloads.
pub const ENTRY_OVERHEAD: u64 = 64;

/// Byte-string dict type: randomly seeded SipHash per dict, byte equality.
pub struct BytesKeys {
    state: RandomState,
}

impl BytesKeys {
    pub fn new() -> Self {
        Self {
            state: RandomState::new(),
        }
    }
}

impl Default for BytesKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl DictType<Key> for BytesKeys {
    fn hash(&self, key: &Key) -> u64 {
        let mut h = self.state.build_hasher();
        h.write(key);
        h.finish()
    }

    fn key_eq(&self, a: &Key, b: &Key) -> bool {
        a == b
    }
}

/// Main keyspace dict.
pub type KeyDict = Dict<Key, Object, BytesKeys>;

/// Expiry dict: key → absolute expiry in unix milliseconds.
pub type ExpireDict = Dict<Key, u64, BytesKeys>;

/// One logical database.
pub struct Db {
    pub id: usize,
    pub keys: KeyDict,
    pub expires: ExpireDict,
    meter: MemoryMeter,
    rehash_enabled: bool,
}

impl Db {
    pub fn new(id: usize, cfg: &CoreConfig, meter: MemoryMeter) -> Self {
        Self {
            id,
            keys: Dict::with_resize(BytesKeys::new(), cfg.rehash_enabled),
            expires: Dict::with_resize(BytesKeys::new(), cfg.rehash_enabled),
            meter,
            rehash_enabled: cfg.rehash_enabled,
        }
    }

    pub fn meter(&self) -> &MemoryMeter {
        &self.meter
    }

    fn entry_bytes(key: &[u8], obj: &Object) -> u64 {
        key.len() as u64 + ENTRY_OVERHEAD + obj.mem_size() as u64
    }

    /// Inserts or overwrites a key. The access meta of a fresh object is
    /// initialized per the configured policy (LRU stamp or LFU
    /// minute+counter).
    pub fn put(&mut self, key: Key, value: Value, cfg: &CoreConfig, clock: &LruClock) {
        let obj = Object::new(value, evict::initial_access(cfg, clock));
        let obj_bytes = obj.mem_size() as u64;
        let key_bytes = key.len() as u64;

        let replaced_bytes = self.keys.peek(&key).map(|old| old.mem_size() as u64);
        self.keys.replace(key, obj);
        match replaced_bytes {
            Some(old) => {
                self.meter.sub(old);
                self.meter.add(obj_bytes);
            }
            None => self.meter.add(key_bytes + ENTRY_OVERHEAD + obj_bytes),
        }
    }

    /// The read path collaborators route lookups through: returns the object
    /// and updates its access meta (LRU stamp, or LFU decay-then-increment).
    pub fn lookup_read(&mut self, key: &Key, cfg: &CoreConfig, clock: &LruClock) -> Option<&Object> {
        let obj = self.keys.get_mut(key)?;
        evict::touch(&mut obj.access, cfg, clock);
        Some(&*obj)
    }

    /// Attaches an absolute expiry (unix millis) to an existing key.
    /// Returns false when the key does not exist.
    pub fn set_expire(&mut self, key: &Key, at_unix_ms: u64) -> bool {
        if !self.keys.contains(key) {
            return false;
        }
        let key_bytes = key.len() as u64;
        if self.expires.replace(key.clone(), at_unix_ms) {
            self.meter.add(key_bytes + ENTRY_OVERHEAD);
        }
        true
    }

    pub fn expiry(&self, key: &Key) -> Option<u64> {
        self.expires.peek(key).copied()
    }

    /// Removes a key inline, crediting all its bytes back immediately.
    pub fn remove_sync(&mut self, key: &Key) -> bool {
        let Some((k, obj)) = self.keys.take(key) else {
            return false;
        };
        self.meter.sub(Self::entry_bytes(&k, &obj));
        self.remove_expire_entry(key);
        true
    }

    /// Removes a key, deferring the value release to the lazy-free worker.
    /// Key and bookkeeping bytes are credited inline; the value's bytes only
    /// when the worker drops it.
    pub fn remove_async(&mut self, key: &Key, workers: &BackgroundWorkers) -> bool {
        let Some((k, obj)) = self.keys.take(key) else {
            return false;
        };
        let value_bytes = obj.mem_size() as u64;
        self.meter.sub(k.len() as u64 + ENTRY_OVERHEAD);
        self.remove_expire_entry(key);
        workers.submit(Job::LazyFree(LazyFreeItem::Object(ReclaimedObject {
            obj,
            bytes: value_bytes,
            meter: self.meter.clone(),
        })));
        true
    }

    /// Empties the whole database, shipping both dicts to the lazy-free
    /// worker. Fresh empty dicts take their place immediately.
    pub fn clear_async(&mut self, workers: &BackgroundWorkers) {
        let mut bytes = 0u64;
        let mut cursor = 0u64;
        loop {
            cursor = self
                .keys
                .scan(cursor, |k, o| bytes += Self::entry_bytes(k, o));
            if cursor == 0 {
                break;
            }
        }
        cursor = 0;
        loop {
            cursor = self
                .expires
                .scan(cursor, |k, _| bytes += k.len() as u64 + ENTRY_OVERHEAD);
            if cursor == 0 {
                break;
            }
        }

        let keys = std::mem::replace(
            &mut self.keys,
            Dict::with_resize(BytesKeys::new(), self.rehash_enabled),
        );
        let expires = std::mem::replace(
            &mut self.expires,
            Dict::with_resize(BytesKeys::new(), self.rehash_enabled),
        );
        debug!(db = self.id, bytes, "database handed to lazy-free worker");
        workers.submit(Job::LazyFree(LazyFreeItem::Database(ReclaimedDb {
            keys,
            expires,
            bytes,
            meter: self.meter.clone(),
        })));
    }

    fn remove_expire_entry(&mut self, key: &Key) {
        if let Some((ek, _)) = self.expires.take(key) {
            self.meter.sub(ek.len() as u64 + ENTRY_OVERHEAD);
        }
    }
}

/// A value detached from its keyspace, waiting to be dropped on the
/// lazy-free worker. Dropping credits the value bytes back to the meter.
pub struct ReclaimedObject {
    obj: Object,
    bytes: u64,
    meter: MemoryMeter,
}

impl ReclaimedObject {
    pub fn new(obj: Object, bytes: u64, meter: MemoryMeter) -> Self {
        Self { obj, bytes, meter }
    }
}

impl Drop for ReclaimedObject {
    fn drop(&mut self) {
        self.meter.sub(self.bytes);
    }
}

/// A whole detached keyspace (main + expires dicts) pending background
/// release.
pub struct ReclaimedDb {
    keys: KeyDict,
    expires: ExpireDict,
    bytes: u64,
    meter: MemoryMeter,
}

impl Drop for ReclaimedDb {
    fn drop(&mut self) {
        self.keys.clear();
        self.expires.clear();
        self.meter.sub(self.bytes);
    }
}
