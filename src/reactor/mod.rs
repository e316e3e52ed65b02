//! # Reactor
//!
//! Single-threaded event loop multiplexing descriptor readiness and timers
//! over a pluggable polling backend. Everything on the core data path —
//! client I/O, timed maintenance, hand-offs to the background workers — runs
//! inside one iteration of this loop, so ordering here is the ordering of
//! the whole engine:
//!
//! 1. compute the sleep timeout from the nearest timer,
//! 2. run the before-sleep hook,
//! 3. poll the backend,
//! 4. run the after-sleep hook,
//! 5. dispatch file events (read-before-write, inverted per-fd by
//!    [`BARRIER`]),
//! 6. dispatch due timers.
//!
//! Handlers receive `&mut Reactor` and may freely register and unregister
//! files and timers from inside a dispatch; the loop defends itself with a
//! tombstone scheme for timer deletion and an id snapshot that shields
//! timers created mid-pass. State a handler needs is captured in its
//! closure — the reactor owns handlers, never their data, and a registrant
//! must unregister before dropping state a handler borrows from.
//!
//! Timer deadlines are wall-clock: if the system clock jumps backwards, or
//! forward by more than half an hour, every timer is fired once immediately
//! rather than stalling for the skewed interval.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::{unix_millis, unix_seconds};

pub mod backend;

#[cfg(test)]
mod tests;

use backend::{FiredEvent, PollBackend};

// ------------------------------------------------------------------------------------------------
// Masks and flags
// ------------------------------------------------------------------------------------------------

/// Bitmask of per-fd event interest.
pub type Mask = u32;

pub const NONE: Mask = 0;
/// Fire when the descriptor is readable.
pub const READABLE: Mask = 1;
/// Fire when the descriptor is writable.
pub const WRITABLE: Mask = 2;
/// Invert the dispatch order for this fd: when it is both readable and
/// writable in one iteration, the write handler runs first. Used to persist
/// state before sending replies.
pub const BARRIER: Mask = 4;

/// Flags selecting what one [`Reactor::process_events`] call does.
pub type Flags = u32;

pub const FILE_EVENTS: Flags = 1;
pub const TIME_EVENTS: Flags = 2;
pub const ALL_EVENTS: Flags = FILE_EVENTS | TIME_EVENTS;
/// Use a zero poll timeout even when timers are pending.
pub const DONT_WAIT: Flags = 4;
/// Invoke the after-sleep hook when the poll returns.
pub const CALL_AFTER_SLEEP: Flags = 8;

/// Tombstone id marking a timer deleted mid-pass.
pub const DELETED_TIMER_ID: i64 = -1;

/// Wall-clock skew beyond which all timer deadlines are considered reached.
const CLOCK_SKEW_LIMIT_SECS: u64 = 30 * 60;

// ------------------------------------------------------------------------------------------------
// Handler types
// ------------------------------------------------------------------------------------------------

/// File event handler: receives the reactor, the fd, and the ready mask.
pub type FileHandler = Rc<RefCell<dyn FnMut(&mut Reactor, RawFd, Mask)>>;

/// Timer handler: returns what to do with the timer next.
pub type TimerHandler = Rc<RefCell<dyn FnMut(&mut Reactor, i64) -> TimerAction>>;

/// Finalizer invoked exactly once when a timer is unlinked.
pub type TimerFinalizer = Box<dyn FnOnce(&mut Reactor)>;

type SleepHook = Rc<RefCell<dyn FnMut(&mut Reactor)>>;

/// What a timer handler wants done after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Delete the timer (the finalizer runs).
    NoMore,
    /// Re-arm the timer this many milliseconds from now.
    Again(u64),
}

/// Errors surfaced by registration and resizing.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("fd {fd} outside the event table (set_size {set_size})")]
    FdOutOfRange { fd: RawFd, set_size: usize },

    #[error("set size {requested} exceeds backend limit {limit}")]
    SetSizeTooLarge { requested: usize, limit: usize },

    #[error("set size {requested} below highest registered fd {maxfd}")]
    SetSizeBelowFd { requested: usize, maxfd: RawFd },

    #[error("polling backend error: {0}")]
    Backend(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

struct FileEvent {
    mask: Mask,
    read: Option<FileHandler>,
    write: Option<FileHandler>,
}

impl FileEvent {
    fn empty() -> Self {
        Self {
            mask: NONE,
            read: None,
            write: None,
        }
    }
}

struct TimerEvent {
    id: i64,
    /// Absolute deadline, unix milliseconds.
    deadline_ms: u64,
    handler: TimerHandler,
    finalizer: Option<TimerFinalizer>,
}

/// The event loop.
pub struct Reactor {
    set_size: usize,
    events: Vec<FileEvent>,
    fired: Vec<FiredEvent>,
    maxfd: RawFd,
    timers: Vec<TimerEvent>,
    next_timer_id: i64,
    /// Seconds at the last timer pass, for clock-skew detection.
    last_wall_time: u64,
    stop: bool,
    dont_wait: bool,
    before_sleep: Option<SleepHook>,
    after_sleep: Option<SleepHook>,
    backend: Box<dyn PollBackend>,
}

impl Reactor {
    /// Creates a reactor with the platform's default backend.
    pub fn new(set_size: usize) -> Result<Self, ReactorError> {
        let backend = backend::default_backend(set_size)?;
        Self::with_backend(set_size, backend)
    }

    /// Creates a reactor over an explicit backend.
    pub fn with_backend(
        set_size: usize,
        mut backend: Box<dyn PollBackend>,
    ) -> Result<Self, ReactorError> {
        let set_size = set_size.max(1);
        backend.resize(set_size)?;

        let mut events = Vec::new();
        events.resize_with(set_size, FileEvent::empty);
        info!(backend = backend.name(), set_size, "reactor created");

        Ok(Self {
            set_size,
            events,
            fired: Vec::with_capacity(set_size),
            maxfd: -1,
            timers: Vec::new(),
            next_timer_id: 0,
            last_wall_time: unix_seconds(),
            stop: false,
            dont_wait: false,
            before_sleep: None,
            after_sleep: None,
            backend,
        })
    }

    /// Wraps a closure into the handler slot type.
    pub fn file_handler(f: impl FnMut(&mut Reactor, RawFd, Mask) + 'static) -> FileHandler {
        Rc::new(RefCell::new(f))
    }

    /// Wraps a closure into the timer handler slot type.
    pub fn timer_handler(f: impl FnMut(&mut Reactor, i64) -> TimerAction + 'static) -> TimerHandler {
        Rc::new(RefCell::new(f))
    }

    pub fn set_size(&self) -> usize {
        self.set_size
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Makes subsequent iterations return right after draining ready events
    /// instead of sleeping.
    pub fn set_dont_wait(&mut self, dont_wait: bool) {
        self.dont_wait = dont_wait;
    }

    pub fn set_before_sleep(&mut self, hook: impl FnMut(&mut Reactor) + 'static) {
        self.before_sleep = Some(Rc::new(RefCell::new(hook)));
    }

    pub fn set_after_sleep(&mut self, hook: impl FnMut(&mut Reactor) + 'static) {
        self.after_sleep = Some(Rc::new(RefCell::new(hook)));
    }

    /// Requests the main loop to exit after the current iteration.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    // --------------------------------------------------------------------------------------------
    // File events
    // --------------------------------------------------------------------------------------------

    /// Registers `handler` for the bits in `mask` on `fd`, merging with any
    /// existing registration.
    pub fn register_file(
        &mut self,
        fd: RawFd,
        mask: Mask,
        handler: FileHandler,
    ) -> Result<(), ReactorError> {
        if fd < 0 || fd as usize >= self.set_size {
            return Err(ReactorError::FdOutOfRange {
                fd,
                set_size: self.set_size,
            });
        }

        let prev = self.events[fd as usize].mask;
        self.backend.add(fd, prev, prev | mask)?;

        let ev = &mut self.events[fd as usize];
        ev.mask |= mask;
        if mask & READABLE != 0 {
            ev.read = Some(Rc::clone(&handler));
        }
        if mask & WRITABLE != 0 {
            ev.write = Some(Rc::clone(&handler));
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        Ok(())
    }

    /// Clears the bits in `mask` for `fd`; clearing WRITABLE also clears
    /// BARRIER. When nothing remains the fd leaves the backend.
    pub fn unregister_file(&mut self, fd: RawFd, mask: Mask) {
        if fd < 0 || fd as usize >= self.set_size {
            return;
        }
        if self.events[fd as usize].mask == NONE {
            return;
        }

        let mut mask = mask;
        if mask & WRITABLE != 0 {
            mask |= BARRIER;
        }
        let remaining = self.events[fd as usize].mask & !mask;
        if let Err(err) = self.backend.del(fd, remaining) {
            warn!(fd, %err, "backend deregistration failed");
        }

        let ev = &mut self.events[fd as usize];
        ev.mask = remaining;
        if remaining & READABLE == 0 {
            ev.read = None;
        }
        if remaining & WRITABLE == 0 {
            ev.write = None;
        }

        if remaining == NONE && fd == self.maxfd {
            let mut fd = self.maxfd - 1;
            while fd >= 0 && self.events[fd as usize].mask == NONE {
                fd -= 1;
            }
            self.maxfd = fd;
        }
    }

    /// The mask currently registered for `fd`.
    pub fn file_mask(&self, fd: RawFd) -> Mask {
        if fd < 0 || fd as usize >= self.set_size {
            return NONE;
        }
        self.events[fd as usize].mask
    }

    /// Grows or shrinks the fd table. Fails when a registered fd would no
    /// longer fit or the backend cannot accommodate the new size.
    pub fn resize_set_size(&mut self, set_size: usize) -> Result<(), ReactorError> {
        if set_size == self.set_size {
            return Ok(());
        }
        if self.maxfd >= set_size as RawFd {
            return Err(ReactorError::SetSizeBelowFd {
                requested: set_size,
                maxfd: self.maxfd,
            });
        }
        self.backend.resize(set_size)?;
        self.events.resize_with(set_size, FileEvent::empty);
        self.set_size = set_size;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Timers
    // --------------------------------------------------------------------------------------------

    /// Arms a timer `delay_ms` from now. The handler decides whether the
    /// timer repeats; the finalizer (if any) runs exactly once when the
    /// timer is unlinked.
    pub fn create_timer(
        &mut self,
        delay_ms: u64,
        handler: TimerHandler,
        finalizer: Option<TimerFinalizer>,
    ) -> i64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimerEvent {
            id,
            deadline_ms: unix_millis() + delay_ms,
            handler,
            finalizer,
        });
        id
    }

    /// Tombstones the timer; the unlink (and finalizer) happens during the
    /// next timer pass. Returns false for an unknown id.
    pub fn delete_timer(&mut self, id: i64) -> bool {
        if id == DELETED_TIMER_ID {
            return false;
        }
        for timer in &mut self.timers {
            if timer.id == id {
                timer.id = DELETED_TIMER_ID;
                return true;
            }
        }
        false
    }

    fn nearest_timer_deadline(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|t| t.id != DELETED_TIMER_ID)
            .map(|t| t.deadline_ms)
            .min()
    }

    // --------------------------------------------------------------------------------------------
    // Event processing
    // --------------------------------------------------------------------------------------------

    /// One loop iteration. Returns the number of events dispatched.
    pub fn process_events(&mut self, flags: Flags) -> usize {
        let mut processed = 0;
        if flags & ALL_EVENTS == 0 {
            return 0;
        }

        // Poll when there are files to watch, or when sleeping is how we
        // wait for the next timer.
        if self.maxfd != -1 || (flags & TIME_EVENTS != 0 && flags & DONT_WAIT == 0) {
            let timeout = if self.dont_wait || flags & DONT_WAIT != 0 {
                Some(Duration::ZERO)
            } else if flags & TIME_EVENTS != 0 {
                self.nearest_timer_deadline()
                    .map(|deadline| Duration::from_millis(deadline.saturating_sub(unix_millis())))
            } else {
                None
            };

            if let Some(hook) = self.before_sleep.clone() {
                (&mut *hook.borrow_mut())(self);
            }

            self.fired.clear();
            let mut fired = std::mem::take(&mut self.fired);
            let numevents = self.backend.poll(timeout, self.maxfd, &mut fired);
            self.fired = fired;

            if flags & CALL_AFTER_SLEEP != 0 {
                if let Some(hook) = self.after_sleep.clone() {
                    (&mut *hook.borrow_mut())(self);
                }
            }

            if flags & FILE_EVENTS != 0 {
                for j in 0..numevents {
                    let FiredEvent { fd, mask: ready } = self.fired[j];
                    processed += self.dispatch_file_event(fd, ready);
                }
            }
        }

        if flags & TIME_EVENTS != 0 {
            processed += self.process_time_events();
        }
        processed
    }

    /// Fires the handlers armed for `fd` that are ready, honoring BARRIER
    /// inversion. Each bit fires at most once, and a single handler
    /// registered for both bits is not invoked twice.
    fn dispatch_file_event(&mut self, fd: RawFd, ready: Mask) -> usize {
        if fd < 0 || fd as usize >= self.set_size {
            return 0;
        }
        let mask = self.events[fd as usize].mask;
        let invert = mask & BARRIER != 0;
        let mut fired = 0;

        if !invert && mask & ready & READABLE != 0 {
            if let Some(handler) = self.events[fd as usize].read.clone() {
                (&mut *handler.borrow_mut())(self, fd, ready);
                fired += 1;
            }
        }

        // Re-read the registration: the read handler may have changed it.
        let mask = self.events[fd as usize].mask;
        if mask & ready & WRITABLE != 0 {
            if let Some(handler) = self.events[fd as usize].write.clone() {
                let same = self.events[fd as usize]
                    .read
                    .as_ref()
                    .is_some_and(|r| handler_eq(r, &handler));
                if fired == 0 || !same {
                    (&mut *handler.borrow_mut())(self, fd, ready);
                    fired += 1;
                }
            }
        }

        if invert {
            let mask = self.events[fd as usize].mask;
            if mask & ready & READABLE != 0 {
                if let Some(handler) = self.events[fd as usize].read.clone() {
                    let same = self.events[fd as usize]
                        .write
                        .as_ref()
                        .is_some_and(|w| handler_eq(w, &handler));
                    if fired == 0 || !same {
                        (&mut *handler.borrow_mut())(self, fd, ready);
                        fired += 1;
                    }
                }
            }
        }

        usize::from(fired > 0)
    }

    fn process_time_events(&mut self) -> usize {
        let mut processed = 0;
        let now_sec = unix_seconds();

        // On clock skew (backwards, or forward past the limit) fire every
        // timer once now; early delivery beats an unbounded stall.
        if now_sec < self.last_wall_time
            || now_sec > self.last_wall_time + CLOCK_SKEW_LIMIT_SECS
        {
            debug!(
                last = self.last_wall_time,
                now = now_sec,
                "wall clock skew detected, forcing timers due"
            );
            for timer in &mut self.timers {
                timer.deadline_ms = 0;
            }
        }
        self.last_wall_time = now_sec;

        // Timers created by handlers during this pass get ids above this
        // snapshot and wait for the next pass.
        let max_id = self.next_timer_id - 1;

        let mut i = 0;
        while i < self.timers.len() {
            let id = self.timers[i].id;

            if id == DELETED_TIMER_ID {
                let timer = self.timers.remove(i);
                if let Some(finalizer) = timer.finalizer {
                    finalizer(self);
                }
                continue;
            }
            if id > max_id || unix_millis() < self.timers[i].deadline_ms {
                i += 1;
                continue;
            }

            let handler = Rc::clone(&self.timers[i].handler);
            let action = (&mut *handler.borrow_mut())(self, id);
            processed += 1;

            // The handler may have reshaped the timer list (created timers
            // land at the tail, deletions tombstone in place); relocate by
            // id. A timer that deleted itself keeps its tombstone
            // regardless of the returned action.
            let mut advance = true;
            if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
                match action {
                    TimerAction::Again(ms) => {
                        self.timers[pos].deadline_ms = unix_millis() + ms;
                    }
                    TimerAction::NoMore => {
                        let timer = self.timers.remove(pos);
                        if let Some(finalizer) = timer.finalizer {
                            finalizer(self);
                        }
                        if pos <= i {
                            advance = false;
                        }
                    }
                }
            }
            if advance {
                i += 1;
            }
        }
        processed
    }

    /// Runs `process_events(ALL_EVENTS | CALL_AFTER_SLEEP)` until [`stop`]
    /// is requested.
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&mut self) {
        self.stop = false;
        while !self.stop {
            self.process_events(ALL_EVENTS | CALL_AFTER_SLEEP);
        }
    }
}

fn handler_eq(a: &FileHandler, b: &FileHandler) -> bool {
    Rc::ptr_eq(a, b)
}
