//! # EmberDB
//!
//! The **in-memory data engine core** of a key-value server: a
//! single-threaded event reactor, an incrementally-rehashed hash table, a
//! small background worker pool, and a sampling LRU/LFU eviction engine that
//! keeps the dataset inside a configured memory budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        core thread                         │
//! │  ┌───────────────┐    timers   ┌───────────────────────┐   │
//! │  │    Reactor    │────────────►│  maintenance (rehash  │   │
//! │  │ (epoll/select)│             │  ticks, clock refresh)│   │
//! │  └──────┬────────┘             └──────────┬────────────┘   │
//! │         │ file events                     │                │
//! │  ┌──────▼────────┐   writes   ┌───────────▼────────────┐   │
//! │  │ command layer │───────────►│   Db (Dict + expires)  │   │
//! │  │ (collaborator)│            └───────────┬────────────┘   │
//! │  └──────┬────────┘  every write           │ sample/delete  │
//! │         └───────────────────►┌────────────▼────────────┐   │
//! │                              │  Evictor (pool, LRU/LFU │   │
//! │                              │  scores, memory budget) │   │
//! │                              └────────────┬────────────┘   │
//! └───────────────────────────────────────────┼────────────────┘
//!                               lazy free     │ close / fsync
//!                            ┌────────────────▼────────────────┐
//!                            │  BackgroundWorkers (one thread  │
//!                            │  per job class, strict FIFO)    │
//!                            └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`dict`] | Chained hash table with incremental rehash, cursor scan, and sampling |
//! | [`reactor`] | Single-threaded event loop: file events, timers, pluggable poll backends |
//! | [`background`] | Per-class worker threads for close/fsync/lazy-free jobs |
//! | [`evict`] | Memory-budget enforcement: LRU clock, LFU counters, candidate pool |
//! | [`db`] | One logical keyspace: main dict + expiry dict + byte accounting |
//! | [`object`] | Stored values and the 24-bit access-meta word |
//! | [`mem`] | Memory accounting trait, shared meter, budget standing reports |
//! | [`config`] | The explicit configuration context passed to every subsystem |
//!
//! ## Key properties
//!
//! - **Non-blocking core.** The only suspension point on the core thread is
//!   the backend poll; rehash work and eviction loops are budgeted, and
//!   anything latency-dangerous (fd close, fsync, big frees) is shipped to
//!   the background workers.
//! - **Amortized rehash.** Hash tables migrate one bucket at a time, paid
//!   for by the operations that touch them plus an optional timed budget
//!   from a maintenance timer.
//! - **Approximate eviction.** No global recency order is maintained;
//!   victims come from small samples ranked in a 16-slot pool, which keeps
//!   eviction O(samples) regardless of dataset size.
//! - **Deterministic dispatch.** Within one reactor iteration: before-sleep
//!   hook, poll, after-sleep hook, file events (read before write unless a
//!   BARRIER registration inverts it per fd), then timers.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use emberdb::background::BackgroundWorkers;
//! use emberdb::config::{CoreConfig, EvictionPolicy};
//! use emberdb::db::Db;
//! use emberdb::evict::{Evictor, LruClock, NoHooks};
//! use emberdb::mem::MemoryMeter;
//! use emberdb::object::Value;
//!
//! let cfg = CoreConfig {
//!     max_memory: 64 * 1024 * 1024,
//!     max_memory_policy: EvictionPolicy::AllKeysLru,
//!     ..CoreConfig::default()
//! };
//! cfg.validate().unwrap();
//!
//! let meter = MemoryMeter::new();
//! let clock = LruClock::new();
//! let workers = BackgroundWorkers::new();
//! let mut dbs = vec![Db::new(0, &cfg, meter.clone())];
//! let mut evictor = Evictor::new();
//!
//! // Write path: insert, then re-establish the budget.
//! dbs[0].put(
//!     b"greeting".to_vec(),
//!     Value::Str(b"hello".to_vec().into_boxed_slice()),
//!     &cfg,
//!     &clock,
//! );
//! evictor
//!     .ensure_headroom(&mut dbs, &meter, &workers, &cfg, &clock, &mut NoHooks)
//!     .unwrap();
//!
//! // Read path: updates the entry's LRU/LFU access metadata.
//! assert!(dbs[0].lookup_read(&b"greeting".to_vec(), &cfg, &clock).is_some());
//! ```
//!
//! Driving the loop — a maintenance timer refreshing the LRU clock and
//! spending a rehash budget, the way a server cron would:
//!
//! ```rust,no_run
//! use emberdb::reactor::{ALL_EVENTS, CALL_AFTER_SLEEP, Reactor, TimerAction};
//!
//! let mut reactor = Reactor::new(1024).unwrap();
//! reactor.create_timer(
//!     100,
//!     Reactor::timer_handler(|_reactor, _id| {
//!         // refresh clocks, spend dict.rehash_for(1ms), roll stats...
//!         TimerAction::Again(100)
//!     }),
//!     None,
//! );
//! reactor.run();
//! ```

#![allow(dead_code)]

pub mod background;
pub mod config;
pub mod db;
pub mod dict;
pub mod evict;
pub mod mem;
pub mod object;
pub mod reactor;

pub(crate) mod util;

pub use background::{BackgroundWorkers, Job, JobKind, LazyFreeItem};
pub use config::{ConfigError, CoreConfig, EvictionPolicy};
pub use db::{Db, Key};
pub use dict::{Dict, DictError, DictType};
pub use evict::{EvictionHooks, Evictor, LruClock, MemoryPressure, NoHooks};
pub use mem::{MemoryMeter, MemoryUsage};
pub use object::{AccessMeta, Object, SharedValue, Value};
pub use reactor::{Reactor, ReactorError, TimerAction};
