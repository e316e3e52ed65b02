//! Memory accounting.
//!
//! The eviction engine never asks the allocator directly; it goes through the
//! [`MemoryUsage`] trait so the embedder can report real allocator numbers,
//! and through it subtract the bytes the core is not responsible for
//! (append-log buffer, replica output buffers).
//!
//! [`MemoryMeter`] is the built-in implementation: an atomic byte counter the
//! keyspace updates on every insert and remove. It is atomic because
//! lazy-freed values credit their bytes back from a background worker thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Memory reporting interface consumed by the eviction engine.
pub trait MemoryUsage {
    /// Total bytes currently in use, as the allocator sees them.
    fn used_bytes(&self) -> u64;

    /// Bytes that should not count against the budget: replica output
    /// buffers plus the append-log buffer, reported by collaborators.
    fn excluded_bytes(&self) -> u64 {
        0
    }
}

/// Shared atomic byte meter. Cloning shares the underlying counters.
#[derive(Clone, Default)]
pub struct MemoryMeter {
    used: Arc<AtomicU64>,
    excluded: Arc<AtomicU64>,
}

impl MemoryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: u64) {
        // Saturate rather than wrap: a disagreement between insert-time and
        // free-time size estimates must not produce an absurd reading.
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Installs the collaborator-reported overhead (append-log + replica
    /// buffers) excluded from the budget.
    pub fn set_excluded(&self, bytes: u64) {
        self.excluded.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryUsage for MemoryMeter {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn excluded_bytes(&self) -> u64 {
        self.excluded.load(Ordering::Relaxed)
    }
}

/// Snapshot of memory standing relative to the configured ceiling.
#[derive(Debug, Clone, Copy)]
pub struct MemoryState {
    /// Raw allocator-reported usage.
    pub used: u64,
    /// Usage minus the excluded overhead — the number the budget applies to.
    pub logical: u64,
    /// Bytes to release to get back under the ceiling (0 when under).
    pub to_free: u64,
    /// `logical / max_memory`; may exceed 1.0 when over budget, 0.0 when the
    /// budget is disabled.
    pub level: f64,
    /// True when a non-zero ceiling is exceeded.
    pub over_budget: bool,
}

/// Computes the budget standing for the given reporter and ceiling.
pub fn memory_state(mem: &dyn MemoryUsage, max_memory: u64) -> MemoryState {
    let used = mem.used_bytes();
    let logical = used.saturating_sub(mem.excluded_bytes());
    let level = if max_memory == 0 {
        0.0
    } else {
        logical as f64 / max_memory as f64
    };
    let over_budget = max_memory != 0 && logical > max_memory;
    MemoryState {
        used,
        logical,
        to_free: if over_budget { logical - max_memory } else { 0 },
        level,
        over_budget,
    }
}
