//! Integration tests for the engine core's public surface.
//!
//! These tests wire the subsystems together the way an embedding server
//! would — reactor timers driving maintenance, keyspaces charging the shared
//! memory meter, the evictor restoring the budget, and the background
//! workers absorbing deferred frees and fd work. Only the public `emberdb`
//! API is used.
//!
//! ## Coverage areas
//! - **Maintenance loop**: a reactor timer refreshing the LRU clock and
//!   spending an incremental-rehash budget, server-cron style
//! - **Write path**: insert → budget check → eviction → budget restored
//! - **Lazy free**: evictions routed through the background worker, with
//!   the meter converging once the queue drains
//! - **Barrier I/O**: persist-before-reply ordering on a live socket pair
//! - **Append-log fsync**: before-sleep hook handing fsyncs to the workers
//!
//! ## See also
//! - `dict::tests` — hash table unit tests
//! - `reactor::tests` — dispatch-order and timer unit tests
//! - `evict::tests` — pool and policy unit tests

use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use emberdb::background::{BackgroundWorkers, Job, JobKind};
use emberdb::config::{CoreConfig, EvictionPolicy};
use emberdb::db::Db;
use emberdb::dict::Dict;
use emberdb::evict::{Evictor, LruClock, NoHooks};
use emberdb::mem::{MemoryMeter, MemoryUsage, memory_state};
use emberdb::object::Value;
use emberdb::reactor::{
    ALL_EVENTS, BARRIER, CALL_AFTER_SLEEP, FILE_EVENTS, READABLE, Reactor, TimerAction, WRITABLE,
};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn lru_config(max_memory: u64) -> CoreConfig {
    CoreConfig {
        max_memory,
        max_memory_policy: EvictionPolicy::AllKeysLru,
        ..CoreConfig::default()
    }
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

// ================================================================================================
// Maintenance loop
// ================================================================================================

/// # Scenario
/// A server-cron style timer refreshes the LRU clock and spends a rehash
/// budget on a large dict until the migration completes.
///
/// # Starting environment
/// A dict force-grown so an incremental rehash is in flight, owned by the
/// timer closure via `Rc<RefCell<_>>`.
///
/// # Expected behavior
/// The loop stops once the timer observes the rehash finished; all entries
/// survived the migration and the clock cache moved.
#[test]
fn maintenance_timer_drives_rehash_to_completion() {
    let dict: Rc<RefCell<Dict<Vec<u8>, u64, emberdb::db::BytesKeys>>> =
        Rc::new(RefCell::new(Dict::new(emberdb::db::BytesKeys::new())));
    let clock = Rc::new(LruClock::new());
    clock.set(0);

    {
        let mut d = dict.borrow_mut();
        for i in 0..20_000u64 {
            d.insert(format!("key-{i:08}").into_bytes(), i).unwrap();
        }
        d.expand(131_072);
        assert!(d.is_rehashing());
    }

    let mut reactor = Reactor::new(64).unwrap();
    let dict_t = Rc::clone(&dict);
    let clock_t = Rc::clone(&clock);
    reactor.create_timer(
        1,
        Reactor::timer_handler(move |reactor, _id| {
            clock_t.refresh();
            let still_rehashing = dict_t
                .borrow_mut()
                .rehash_for(std::time::Duration::from_millis(1));
            if still_rehashing {
                TimerAction::Again(1)
            } else {
                reactor.stop();
                TimerAction::NoMore
            }
        }),
        None,
    );
    reactor.run();

    let d = dict.borrow();
    assert!(!d.is_rehashing());
    assert_eq!(d.table_sizes().1, 0);
    assert_eq!(d.len(), 20_000);
    // The cache was refreshed on the final tick; allow the wall clock to
    // have advanced by at most one resolution step since.
    assert!(LruClock::compute() - clock.now() <= 1);
}

// ================================================================================================
// Write path with eviction
// ================================================================================================

/// # Scenario
/// The write path of a command handler: insert a batch, call the evictor
/// after every batch, and keep serving reads on a hot working set.
///
/// # Expected behavior
/// Usage stays under the ceiling after each headroom call and the hot keys
/// survive the whole run.
#[test]
fn write_path_keeps_budget_and_working_set() {
    let cfg = lru_config(512 * 1024);
    let meter = MemoryMeter::new();
    let clock = LruClock::new();
    let workers = BackgroundWorkers::new();
    let mut dbs = vec![Db::new(0, &cfg, meter.clone())];
    let mut evictor = Evictor::new();

    clock.set(1);
    let hot: Vec<Vec<u8>> = (0..8u32).map(|i| format!("hot-{i}").into_bytes()).collect();
    for key in &hot {
        dbs[0].put(
            key.clone(),
            Value::Str(vec![0u8; 64].into_boxed_slice()),
            &cfg,
            &clock,
        );
    }

    for batch in 0u32..40 {
        clock.set(2 + batch);
        for i in 0..200u32 {
            dbs[0].put(
                format!("bulk-{batch:02}-{i:04}").into_bytes(),
                Value::Str(vec![0u8; 256].into_boxed_slice()),
                &cfg,
                &clock,
            );
        }
        // Touching the working set keeps it recent relative to the bulk.
        for key in &hot {
            dbs[0].lookup_read(key, &cfg, &clock).unwrap();
        }
        evictor
            .ensure_headroom(&mut dbs, &meter, &workers, &cfg, &clock, &mut NoHooks)
            .unwrap();
        assert!(!memory_state(&meter, cfg.max_memory).over_budget);
    }

    assert!(evictor.evicted_keys() > 0);
    for key in &hot {
        assert!(dbs[0].keys.peek(key).is_some(), "hot key evicted");
    }
    workers.shutdown();
}

/// # Scenario
/// Same write pressure, but deletions go through the lazy-free worker.
///
/// # Expected behavior
/// `ensure_headroom` succeeds (waiting out the queue when needed) and once
/// the worker drains, the meter sits under the ceiling.
#[test]
fn lazy_free_eviction_converges_after_drain() {
    let mut cfg = lru_config(256 * 1024);
    cfg.lazy_free_on_eviction = true;
    let meter = MemoryMeter::new();
    let clock = LruClock::new();
    let workers = BackgroundWorkers::new();
    let mut dbs = vec![Db::new(0, &cfg, meter.clone())];
    let mut evictor = Evictor::new();

    clock.set(1);
    for i in 0..500u32 {
        dbs[0].put(
            format!("key-{i:04}").into_bytes(),
            Value::Str(vec![0u8; 1024].into_boxed_slice()),
            &cfg,
            &clock,
        );
    }
    evictor
        .ensure_headroom(&mut dbs, &meter, &workers, &cfg, &clock, &mut NoHooks)
        .unwrap();

    while workers.pending(JobKind::LazyFree) > 0 {
        workers.wait_step(JobKind::LazyFree);
    }
    assert!(!memory_state(&meter, cfg.max_memory).over_budget);
    workers.shutdown();
}

// ================================================================================================
// Barrier I/O
// ================================================================================================

/// # Scenario
/// The persist-before-reply pattern: a connection is both readable and
/// writable in the same iteration, and its registration carries BARRIER so
/// the flush (write) handler runs before more input is consumed.
///
/// # Expected behavior
/// Observed order is write-then-read, each handler once per iteration.
#[test]
fn barrier_connection_flushes_before_reading() {
    let mut reactor = Reactor::new(256).unwrap();
    let (s1, s2) = socketpair();
    let byte = [7u8; 1];
    assert_eq!(unsafe { libc::write(s2, byte.as_ptr().cast(), 1) }, 1);

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let log_r = Rc::clone(&log);
    let log_w = Rc::clone(&log);

    reactor
        .register_file(
            s1,
            READABLE,
            Reactor::file_handler(move |_, fd, _| {
                let mut buf = [0u8; 1];
                assert_eq!(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) }, 1);
                log_r.borrow_mut().push("read");
            }),
        )
        .unwrap();
    reactor
        .register_file(
            s1,
            WRITABLE | BARRIER,
            Reactor::file_handler(move |reactor, fd, _| {
                log_w.borrow_mut().push("flush");
                reactor.unregister_file(fd, WRITABLE);
            }),
        )
        .unwrap();

    reactor.process_events(FILE_EVENTS);
    assert_eq!(*log.borrow(), vec!["flush", "read"]);

    close(s1);
    close(s2);
}

// ================================================================================================
// Append-log fsync via the workers
// ================================================================================================

/// # Scenario
/// The append-log flow: every iteration's before-sleep hook hands the log
/// fd to the fsync worker, and the collaborator polls the error flag.
///
/// # Expected behavior
/// Fsyncs complete in the background without an error status.
#[test]
fn before_sleep_hands_fsync_to_workers() {
    let workers = Arc::new(BackgroundWorkers::new());
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();

    let mut reactor = Reactor::new(64).unwrap();
    let workers_hook = Arc::clone(&workers);
    reactor.set_before_sleep(move |_| {
        workers_hook.submit(Job::FsyncFile(fd));
    });

    let ticks = Rc::new(RefCell::new(0u32));
    let ticks_h = Rc::clone(&ticks);
    reactor.create_timer(
        0,
        Reactor::timer_handler(move |_, _| {
            let mut t = ticks_h.borrow_mut();
            *t += 1;
            if *t >= 5 {
                TimerAction::NoMore
            } else {
                TimerAction::Again(0)
            }
        }),
        None,
    );
    while *ticks.borrow() < 5 {
        // No DONT_WAIT: the poll (and with it the before-sleep hook) must
        // actually run each iteration.
        reactor.process_events(ALL_EVENTS | CALL_AFTER_SLEEP);
    }

    while workers.pending(JobKind::FsyncFile) > 0 {
        workers.wait_step(JobKind::FsyncFile);
    }
    assert!(workers.fsync_status().is_ok());
    workers.shutdown();
}

// ================================================================================================
// Deferred work is awaitable, never assumed complete
// ================================================================================================

/// # Scenario
/// A large value is shipped to the lazy-free worker mid-flight; the core
/// thread later waits for the queue explicitly.
///
/// # Expected behavior
/// `wait_step` observes the queue draining to zero and the meter refunds
/// the deferred bytes.
#[test]
fn deferred_free_is_observable_via_wait_step() {
    let cfg = lru_config(0);
    let meter = MemoryMeter::new();
    let clock = LruClock::new();
    let workers = BackgroundWorkers::new();
    let mut db = Db::new(0, &cfg, meter.clone());

    db.put(
        b"big".to_vec(),
        Value::Str(vec![0u8; 64 * 1024].into_boxed_slice()),
        &cfg,
        &clock,
    );
    let charged = meter.used_bytes();
    assert!(charged > 64 * 1024);

    assert!(db.remove_async(&b"big".to_vec(), &workers));
    let mut pending = workers.pending(JobKind::LazyFree);
    while pending > 0 {
        pending = workers.wait_step(JobKind::LazyFree);
    }
    assert_eq!(meter.used_bytes(), 0);
    workers.shutdown();
}
