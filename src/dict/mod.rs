//! # Incremental-Rehash Hash Table
//!
//! A chained open-hashing map built for a single-threaded engine core that
//! cannot afford a stop-the-world resize. The table keeps **two** internal
//! bucket vectors: all entries normally live in table 0; during a resize,
//! entries migrate bucket-by-bucket into table 1, and the migration cost is
//! amortized across ordinary operations (every lookup, insert, and delete
//! advances the migration by one bucket) plus an optional timed budget
//! ([`Dict::rehash_for`]) a maintenance timer can spend.
//!
//! ## Rehash lifecycle
//!
//! Growth is triggered on insert once `used >= size` (or, when automatic
//! resizing is disabled, once the load factor exceeds 5): table 1 is
//! allocated at the next power of two ≥ `used * 2` and the rehash cursor
//! starts at bucket 0 of table 0. Each step drains at most one non-empty
//! bucket, skipping a bounded number of empty buckets so a step's worst case
//! stays small. When table 0 empties, table 1 is swapped into its place and
//! the cursor resets to idle.
//!
//! While rehashing: lookups probe table 0 then table 1, inserts always target
//! table 1, deletes check both. A key is only ever in one table.
//!
//! ## Scanning
//!
//! [`Dict::scan`] walks buckets in reverse-bit-increment cursor order over
//! the larger mask, which keeps the guarantee "every entry present for the
//! whole scan is returned at least once" across growths and shrinks that
//! happen between scan calls. Duplicates are possible; omissions are not.
//!
//! ## Sampling
//!
//! [`Dict::random_entry`] and [`Dict::sample`] provide the uniform-ish key
//! sampling the eviction engine builds its candidate pool from; both cover
//! the two tables proportionally while a rehash is in flight.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::debug;


/// Initial bucket count of a freshly used table.
pub const INITIAL_SIZE: usize = 4;

/// Load factor beyond which growth happens even with resizing disabled.
const FORCE_RESIZE_RATIO: usize = 5;

/// Empty buckets a single rehash step may skip, per requested step.
const EMPTY_VISITS_PER_STEP: usize = 10;

/// Hashing and key-equality supplied at construction.
///
/// Equal keys must produce equal hashes, and a key's hash must be stable for
/// the lifetime of the dict. Key and value duplication/destruction are the
/// language's: `Clone` where a caller needs a copy, `Drop` on removal.
pub trait DictType<K> {
    fn hash(&self, key: &K) -> u64;
    fn key_eq(&self, a: &K, b: &K) -> bool;
}

/// Errors surfaced by dict mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DictError {
    #[error("key already present")]
    DuplicateKey,
}

struct Node<K, V> {
    key: K,
    value: V,
    next: Link<K, V>,
}

type Link<K, V> = Option<Box<Node<K, V>>>;

struct Table<K, V> {
    buckets: Vec<Link<K, V>>,
    used: usize,
}

impl<K, V> Table<K, V> {
    fn empty() -> Self {
        Self {
            buckets: Vec::new(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(size, || None);
        Self { buckets, used: 0 }
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Valid only for a non-empty table; callers guard on `size() > 0`.
    fn mask(&self) -> u64 {
        debug_assert!(!self.buckets.is_empty());
        (self.buckets.len() - 1) as u64
    }

    fn reset(&mut self) {
        self.buckets = Vec::new();
        self.used = 0;
    }
}

/// Chained hash table with incremental rehash.
pub struct Dict<K, V, T: DictType<K>> {
    ops: T,
    tables: [Table<K, V>; 2],
    /// Bucket index in table 0 the migration has reached; -1 when idle.
    rehash_cursor: i64,
    resize_enabled: bool,
}

impl<K, V, T: DictType<K>> Dict<K, V, T> {
    pub fn new(ops: T) -> Self {
        Self::with_resize(ops, true)
    }

    pub fn with_resize(ops: T, resize_enabled: bool) -> Self {
        Self {
            ops,
            tables: [Table::empty(), Table::empty()],
            rehash_cursor: -1,
            resize_enabled,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Number of live entries across both tables.
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bucket slots across both tables.
    pub fn capacity(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_cursor != -1
    }

    /// Bucket counts of (table 0, table 1). Table 1 is non-zero only while a
    /// rehash is in flight.
    pub fn table_sizes(&self) -> (usize, usize) {
        (self.tables[0].size(), self.tables[1].size())
    }

    /// Enables or disables automatic growth and shrink. A heavily overloaded
    /// table (load factor > 5) still grows regardless.
    pub fn set_resize(&mut self, enabled: bool) {
        self.resize_enabled = enabled;
    }

    // --------------------------------------------------------------------------------------------
    // Resize & rehash
    // --------------------------------------------------------------------------------------------

    /// Prepares a resize to at least `size` buckets. No-op while a rehash is
    /// already running or when the target would not change the table.
    pub fn expand(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.tables[0].used > size {
            return false;
        }
        let real = size.max(INITIAL_SIZE).next_power_of_two();
        if real == self.tables[0].size() {
            return false;
        }

        let fresh = Table::with_size(real);
        if self.tables[0].size() == 0 {
            // First allocation: no migration needed.
            self.tables[0] = fresh;
        } else {
            self.tables[1] = fresh;
            self.rehash_cursor = 0;
            debug!(
                from = self.tables[0].size(),
                to = real,
                used = self.tables[0].used,
                "incremental rehash started"
            );
        }
        true
    }

    /// Shrinks the table when it is under 10% occupied. Returns whether a
    /// shrink was scheduled.
    pub fn try_shrink(&mut self) -> bool {
        if !self.resize_enabled || self.is_rehashing() {
            return false;
        }
        let size = self.tables[0].size();
        let used = self.tables[0].used;
        if size <= INITIAL_SIZE || used * 100 / size >= 10 {
            return false;
        }
        self.expand(used.max(INITIAL_SIZE))
    }

    /// Performs up to `steps` bucket migrations, visiting at most
    /// `steps * 10` empty buckets. Returns true while migration remains.
    pub fn rehash(&mut self, steps: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        let mut empty_visits = steps * EMPTY_VISITS_PER_STEP;

        for _ in 0..steps {
            if self.tables[0].used == 0 {
                return self.finish_rehash();
            }

            // Skip empty buckets, bounded so a step cannot stall on a large
            // sparse table.
            let mut idx = self.rehash_cursor as usize;
            while self.tables[0].buckets[idx].is_none() {
                idx += 1;
                self.rehash_cursor = idx as i64;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            // Drain the whole chain into table 1.
            let mut link = self.tables[0].buckets[idx].take();
            while let Some(mut node) = link {
                link = node.next.take();
                let h = self.ops.hash(&node.key);
                let dst = (h & self.tables[1].mask()) as usize;
                node.next = self.tables[1].buckets[dst].take();
                self.tables[1].buckets[dst] = Some(node);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_cursor = (idx + 1) as i64;
        }

        if self.tables[0].used == 0 {
            return self.finish_rehash();
        }
        true
    }

    fn finish_rehash(&mut self) -> bool {
        let drained = std::mem::replace(&mut self.tables[1], Table::empty());
        self.tables[0] = drained;
        self.tables[1].reset();
        self.rehash_cursor = -1;
        debug!(size = self.tables[0].size(), "incremental rehash finished");
        false
    }

    /// Migrates buckets in batches of 100 steps until the wall-clock budget
    /// is spent. Returns true while migration remains.
    pub fn rehash_for(&mut self, budget: Duration) -> bool {
        let start = Instant::now();
        while self.rehash(100) {
            if start.elapsed() >= budget {
                return true;
            }
        }
        false
    }

    fn rehash_step(&mut self) {
        if self.is_rehashing() {
            self.rehash(1);
        }
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            self.expand(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (self.resize_enabled || used / size > FORCE_RESIZE_RATIO) {
            self.expand(used * 2);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------------------------------

    /// Inserts a new entry; fails if the key is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), DictError> {
        self.rehash_step();
        if self.peek(&key).is_some() {
            return Err(DictError::DuplicateKey);
        }
        self.expand_if_needed();
        self.push_new(key, value);
        Ok(())
    }

    /// Returns the entry for `key`, inserting `default()` if absent. The
    /// bool is true when an insert happened. An existing value is never
    /// replaced.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> (&mut V, bool) {
        self.rehash_step();
        if let Some((t, idx)) = self.locate(&key) {
            return (self.chain_value_mut(t, idx, &key), false);
        }
        self.expand_if_needed();
        let h = self.ops.hash(&key);
        let t = if self.is_rehashing() { 1 } else { 0 };
        let idx = (h & self.tables[t].mask()) as usize;
        let node = Box::new(Node {
            key,
            value: default(),
            next: self.tables[t].buckets[idx].take(),
        });
        self.tables[t].buckets[idx] = Some(node);
        self.tables[t].used += 1;
        // The fresh node sits at the head of its chain.
        match self.tables[t].buckets[idx].as_deref_mut() {
            Some(node) => (&mut node.value, true),
            None => unreachable!("bucket empty straight after insert"),
        }
    }

    /// Inserts or substitutes. Returns true when the key was newly inserted,
    /// false when an existing value was replaced (the old value is dropped).
    pub fn replace(&mut self, key: K, value: V) -> bool {
        self.rehash_step();
        if let Some((t, idx)) = self.locate(&key) {
            *self.chain_value_mut(t, idx, &key) = value;
            return false;
        }
        self.expand_if_needed();
        self.push_new(key, value);
        true
    }

    /// Removes the entry and drops it. Returns the removed value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.take(key).map(|(_, v)| v)
    }

    /// Unlinks the entry and hands it back to the caller, who controls when
    /// it is dropped (the detach-for-deferred-destruction path).
    pub fn take(&mut self, key: &K) -> Option<(K, V)> {
        if self.is_empty() {
            return None;
        }
        self.rehash_step();
        let h = self.ops.hash(key);
        let tables = if self.is_rehashing() { 2 } else { 1 };

        for t in 0..tables {
            if self.tables[t].size() == 0 {
                continue;
            }
            let idx = (h & self.tables[t].mask()) as usize;

            // Detach the chain and rebuild it without the matching node.
            let mut chain = self.tables[t].buckets[idx].take();
            let mut found: Option<(K, V)> = None;
            let mut rebuilt: Link<K, V> = None;
            while let Some(mut node) = chain {
                chain = node.next.take();
                if found.is_none() && self.ops.key_eq(&node.key, key) {
                    found = Some((node.key, node.value));
                } else {
                    node.next = rebuilt;
                    rebuilt = Some(node);
                }
            }
            self.tables[t].buckets[idx] = rebuilt;
            if found.is_some() {
                self.tables[t].used -= 1;
                return found;
            }
        }
        None
    }

    /// Drops every entry and returns the dict to its pristine state.
    pub fn clear(&mut self) {
        self.tables[0].reset();
        self.tables[1].reset();
        self.rehash_cursor = -1;
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    /// Looks up a key, advancing the incremental rehash by one step.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.rehash_step();
        self.peek(key)
    }

    /// Mutable lookup; also advances the rehash by one step.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.rehash_step();
        let (t, idx) = self.locate(key)?;
        Some(self.chain_value_mut(t, idx, key))
    }

    /// Pure probe: no rehash step, shared borrow. Used where the caller must
    /// keep other borrows alive (e.g. while sampling).
    pub fn peek(&self, key: &K) -> Option<&V> {
        let (t, idx) = self.locate(key)?;
        let mut link = self.tables[t].buckets[idx].as_deref();
        while let Some(node) = link {
            if self.ops.key_eq(&node.key, key) {
                return Some(&node.value);
            }
            link = node.next.as_deref();
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.locate(key).is_some()
    }

    /// Finds the (table, bucket) holding `key`, if present.
    fn locate(&self, key: &K) -> Option<(usize, usize)> {
        if self.is_empty() {
            return None;
        }
        let h = self.ops.hash(key);
        let tables = if self.is_rehashing() { 2 } else { 1 };
        for t in 0..tables {
            if self.tables[t].size() == 0 {
                continue;
            }
            let idx = (h & self.tables[t].mask()) as usize;
            let mut link = self.tables[t].buckets[idx].as_deref();
            while let Some(node) = link {
                if self.ops.key_eq(&node.key, key) {
                    return Some((t, idx));
                }
                link = node.next.as_deref();
            }
        }
        None
    }

    /// Mutable chain walk within an already-located bucket. The key must be
    /// present in that chain.
    fn chain_value_mut(&mut self, t: usize, idx: usize, key: &K) -> &mut V {
        let ops = &self.ops;
        let mut link = self.tables[t].buckets[idx].as_deref_mut();
        while let Some(node) = link {
            if ops.key_eq(&node.key, key) {
                return &mut node.value;
            }
            link = node.next.as_deref_mut();
        }
        unreachable!("located entry vanished from its chain")
    }

    /// Pushes a fresh node at the head of its target bucket. Inserts target
    /// table 1 while rehashing so table 0 can only drain.
    fn push_new(&mut self, key: K, value: V) {
        let h = self.ops.hash(&key);
        let t = if self.is_rehashing() { 1 } else { 0 };
        let idx = (h & self.tables[t].mask()) as usize;
        let node = Box::new(Node {
            key,
            value,
            next: self.tables[t].buckets[idx].take(),
        });
        self.tables[t].buckets[idx] = Some(node);
        self.tables[t].used += 1;
    }

    // --------------------------------------------------------------------------------------------
    // Scan
    // --------------------------------------------------------------------------------------------

    /// Visits one cursor position worth of entries and returns the next
    /// cursor; a full cycle starts and ends at 0.
    ///
    /// The cursor advances by incrementing the *reversed* bits masked by the
    /// larger table, which is what makes an in-progress scan survive growth
    /// and shrink without missing entries. Entries may be visited more than
    /// once across a cycle; every entry that stays present for the whole
    /// cycle is visited at least once.
    pub fn scan(&self, cursor: u64, mut visit: impl FnMut(&K, &V)) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;

        if !self.is_rehashing() {
            let t0 = &self.tables[0];
            let m0 = t0.mask();
            Self::scan_bucket(&t0.buckets[(v & m0) as usize], &mut visit);

            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
            return v;
        }

        // Two live tables: walk the smaller one's bucket, then every bucket
        // of the larger table that expands from it.
        let (small, large) = if self.tables[0].size() <= self.tables[1].size() {
            (&self.tables[0], &self.tables[1])
        } else {
            (&self.tables[1], &self.tables[0])
        };
        let m0 = small.mask();
        let m1 = large.mask();

        Self::scan_bucket(&small.buckets[(v & m0) as usize], &mut visit);
        loop {
            Self::scan_bucket(&large.buckets[(v & m1) as usize], &mut visit);
            v |= !m1;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
            if v & (m0 ^ m1) == 0 {
                break;
            }
        }
        v
    }

    fn scan_bucket(head: &Link<K, V>, visit: &mut impl FnMut(&K, &V)) {
        let mut link = head.as_deref();
        while let Some(node) = link {
            visit(&node.key, &node.value);
            link = node.next.as_deref();
        }
    }

    // --------------------------------------------------------------------------------------------
    // Sampling
    // --------------------------------------------------------------------------------------------

    /// Returns a uniformly-ish random entry, covering both tables during a
    /// rehash. None when empty.
    pub fn random_entry(&self) -> Option<(&K, &V)> {
        if self.is_empty() {
            return None;
        }
        let mut rng = rand::rng();

        // Pick a non-empty bucket.
        let head = loop {
            let head = if self.is_rehashing() {
                // Buckets below the cursor in table 0 are already empty, so
                // draw from the still-populated range of both tables.
                let cursor = self.rehash_cursor as usize;
                let total = self.tables[0].size() + self.tables[1].size();
                let h = cursor + rng.random_range(0..total - cursor);
                if h >= self.tables[0].size() {
                    &self.tables[1].buckets[h - self.tables[0].size()]
                } else {
                    &self.tables[0].buckets[h]
                }
            } else {
                let m = self.tables[0].mask();
                let h = rng.random_range(0..=m) as usize;
                &self.tables[0].buckets[h]
            };
            if head.is_some() {
                break head;
            }
        };

        // Pick uniformly within the chain.
        let mut len = 0;
        let mut link = head.as_deref();
        while let Some(node) = link {
            len += 1;
            link = node.next.as_deref();
        }
        let mut pick = rng.random_range(0..len);
        let mut link = head.as_deref();
        while let Some(node) = link {
            if pick == 0 {
                return Some((&node.key, &node.value));
            }
            pick -= 1;
            link = node.next.as_deref();
        }
        None
    }

    /// Collects up to `count` entries by walking chains from a random bucket
    /// onward. Faster and "random enough" for eviction sampling; not
    /// suitable where exact uniformity matters.
    pub fn sample(&self, count: usize) -> Vec<(&K, &V)> {
        let count = count.min(self.len());
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }
        let mut rng = rand::rng();

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let max_mask = if tables == 2 {
            self.tables[0].mask().max(self.tables[1].mask())
        } else {
            self.tables[0].mask()
        };

        let mut steps = count * 10;
        let mut i = rng.random_range(0..=max_mask) as usize;
        let mut empty_run = 0usize;

        while out.len() < count && steps > 0 {
            steps -= 1;
            for t in 0..tables {
                // While rehashing, indices below the cursor in table 0 hold
                // nothing: jump the cursor forward, or skip the table when
                // the index only exists in the larger table.
                let mut idx = i;
                if tables == 2 && t == 0 && idx < self.rehash_cursor as usize {
                    if idx >= self.tables[1].size() {
                        idx = self.rehash_cursor as usize;
                    } else {
                        continue;
                    }
                }
                if idx >= self.tables[t].size() {
                    continue;
                }

                let mut link = self.tables[t].buckets[idx].as_deref();
                if link.is_none() {
                    empty_run += 1;
                    if empty_run >= 5 && empty_run > count {
                        i = rng.random_range(0..=max_mask) as usize;
                        empty_run = 0;
                    }
                    continue;
                }
                empty_run = 0;
                while let Some(node) = link {
                    out.push((&node.key, &node.value));
                    if out.len() == count {
                        return out;
                    }
                    link = node.next.as_deref();
                }
            }
            i = (i + 1) & max_mask as usize;
        }
        out
    }
}
