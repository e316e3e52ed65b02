//! # Background Workers
//!
//! A fixed pool of worker threads the core thread hands latency-dangerous
//! work to: closing file descriptors (closing the last reference to a
//! deleted file can block on the unlink), fsyncing the append log, and
//! releasing large values evicted from the keyspace.
//!
//! There is exactly **one worker per job class**, and each class owns its
//! own FIFO queue, mutex, and condition variables — so jobs of one class are
//! executed strictly in submission order, while classes never wait on each
//! other.
//!
//! The pending count of a class includes the job currently executing; it is
//! decremented only after the job completes, and every completion broadcasts
//! the step condvar so [`BackgroundWorkers::wait_step`] callers observe real
//! progress. The core thread uses this to wait out the lazy-free queue when
//! it cannot otherwise get back under the memory budget.
//!
//! Shutdown is cooperative: a stop flag checked between jobs, then a join.
//! Workers drain their queue before exiting.

use std::collections::VecDeque;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::db::{ReclaimedDb, ReclaimedObject};

#[cfg(test)]
mod tests;

/// Number of job classes (and therefore worker threads).
pub const JOB_CLASS_COUNT: usize = 3;

/// The job classes. Each runs on its own dedicated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Close a file descriptor, ignoring failures.
    CloseFile,
    /// Fsync a file descriptor, recording failures in an observable flag.
    FsyncFile,
    /// Drop a detached value or keyspace off the core thread.
    LazyFree,
}

impl JobKind {
    pub const ALL: [JobKind; JOB_CLASS_COUNT] =
        [JobKind::CloseFile, JobKind::FsyncFile, JobKind::LazyFree];

    fn index(self) -> usize {
        match self {
            JobKind::CloseFile => 0,
            JobKind::FsyncFile => 1,
            JobKind::LazyFree => 2,
        }
    }

    /// Human-readable worker thread name.
    pub fn thread_name(self) -> &'static str {
        match self {
            JobKind::CloseFile => "bg-close-file",
            JobKind::FsyncFile => "bg-fsync",
            JobKind::LazyFree => "bg-lazy-free",
        }
    }
}

/// Payload of a lazy-free job. The worker just drops it; the payload's own
/// `Drop` credits freed bytes back to the memory meter.
pub enum LazyFreeItem {
    /// A single detached value object.
    Object(ReclaimedObject),
    /// An entire detached keyspace (main + expires dicts).
    Database(ReclaimedDb),
}

/// A unit of background work. The variant determines the class, so a job of
/// an unknown shape cannot be constructed.
pub enum Job {
    CloseFile(OwnedFd),
    /// Non-owning: the collaborator keeps the file open and polls
    /// [`BackgroundWorkers::fsync_status`] for failures.
    FsyncFile(RawFd),
    LazyFree(LazyFreeItem),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::CloseFile(_) => JobKind::CloseFile,
            Job::FsyncFile(_) => JobKind::FsyncFile,
            Job::LazyFree(_) => JobKind::LazyFree,
        }
    }
}

struct QueuedJob {
    submitted: Instant,
    job: Job,
}

#[derive(Default)]
struct ClassInner {
    queue: VecDeque<QueuedJob>,
    /// Queued plus in-flight jobs of this class.
    pending: u64,
    stop: bool,
}

struct ClassState {
    inner: Mutex<ClassInner>,
    new_job: Condvar,
    step_done: Condvar,
}

impl ClassState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ClassInner::default()),
            new_job: Condvar::new(),
            step_done: Condvar::new(),
        })
    }
}

/// Handle to the worker pool. Cheap to share by reference; owns the threads.
pub struct BackgroundWorkers {
    classes: [Arc<ClassState>; JOB_CLASS_COUNT],
    fsync_errno: Arc<AtomicI32>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorkers {
    /// Spawns one named worker thread per job class.
    pub fn new() -> Self {
        let classes = [ClassState::new(), ClassState::new(), ClassState::new()];
        let fsync_errno = Arc::new(AtomicI32::new(0));

        let mut handles = Vec::with_capacity(JOB_CLASS_COUNT);
        for kind in JobKind::ALL {
            let class = Arc::clone(&classes[kind.index()]);
            let errno = Arc::clone(&fsync_errno);
            let handle = std::thread::Builder::new()
                .name(kind.thread_name().to_string())
                .spawn(move || worker_loop(kind, &class, &errno))
                .expect("failed to spawn background worker thread");
            handles.push(handle);
        }
        info!("background workers started");

        Self {
            classes,
            fsync_errno,
            handles: Mutex::new(handles),
        }
    }

    /// Appends a job to its class's FIFO and wakes the worker.
    pub fn submit(&self, job: Job) {
        let class = &self.classes[job.kind().index()];
        let mut inner = class.inner.lock();
        inner.queue.push_back(QueuedJob {
            submitted: Instant::now(),
            job,
        });
        inner.pending += 1;
        class.new_job.notify_one();
    }

    /// Snapshot of queued + in-flight jobs of a class.
    pub fn pending(&self, kind: JobKind) -> u64 {
        self.classes[kind.index()].inner.lock().pending
    }

    /// Returns immediately when the class is idle; otherwise blocks until
    /// the worker completes one more job, then returns the new pending
    /// count. Useful to wait out a queue in bounded slices.
    pub fn wait_step(&self, kind: JobKind) -> u64 {
        let class = &self.classes[kind.index()];
        let mut inner = class.inner.lock();
        if inner.pending != 0 {
            class.step_done.wait(&mut inner);
        }
        inner.pending
    }

    /// Last fsync outcome: `Ok` or the errno of the most recent failure.
    pub fn fsync_status(&self) -> Result<(), i32> {
        match self.fsync_errno.load(Ordering::Relaxed) {
            0 => Ok(()),
            e => Err(e),
        }
    }

    /// Cooperative stop: workers drain their queues, then exit and are
    /// joined. Idempotent. This is also the crash-path stop — there is no
    /// mid-job cancellation.
    pub fn shutdown(&self) {
        for class in &self.classes {
            let mut inner = class.inner.lock();
            inner.stop = true;
            class.new_job.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        info!("background workers stopped");
    }
}

impl Default for BackgroundWorkers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(kind: JobKind, class: &ClassState, fsync_errno: &AtomicI32) {
    debug!(worker = kind.thread_name(), "background worker running");
    loop {
        let queued = {
            let mut inner = class.inner.lock();
            loop {
                if let Some(q) = inner.queue.pop_front() {
                    break q;
                }
                if inner.stop {
                    return;
                }
                class.new_job.wait(&mut inner);
            }
        };

        // Execute with the lock released; the job owns its payload.
        execute(queued, fsync_errno);

        let mut inner = class.inner.lock();
        inner.pending -= 1;
        class.step_done.notify_all();
    }
}

fn execute(queued: QueuedJob, fsync_errno: &AtomicI32) {
    let kind = queued.job.kind();
    let waited = queued.submitted.elapsed();
    match queued.job {
        Job::CloseFile(fd) => {
            let raw = fd.into_raw_fd();
            if unsafe { libc::close(raw) } == -1 {
                let err = std::io::Error::last_os_error();
                warn!(fd = raw, %err, "background close failed");
            }
        }
        Job::FsyncFile(raw) => {
            if unsafe { libc::fsync(raw) } == -1 {
                let err = std::io::Error::last_os_error();
                fsync_errno.store(err.raw_os_error().unwrap_or(-1), Ordering::Relaxed);
                warn!(fd = raw, %err, "background fsync failed");
            } else {
                fsync_errno.store(0, Ordering::Relaxed);
            }
        }
        Job::LazyFree(item) => {
            drop(item);
        }
    }
    trace!(
        worker = kind.thread_name(),
        queued_ms = waited.as_millis() as u64,
        "background job done"
    );
}
