//! Pluggable OS polling backends.
//!
//! A backend owns the kernel-side interest set and turns "wait until
//! something is ready" into a list of [`FiredEvent`]s. Two are provided:
//! [`EpollBackend`] on Linux and the portable [`SelectBackend`] fallback.
//! Both are level-triggered — an fd that stays ready keeps firing.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Mask, ReactorError};

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod select;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
pub use select::SelectBackend;

/// One ready descriptor reported by a poll.
#[derive(Debug, Clone, Copy)]
pub struct FiredEvent {
    pub fd: RawFd,
    pub mask: Mask,
}

/// Kernel polling capability set.
pub trait PollBackend {
    /// Registers interest. `prev` is the mask registered so far for this fd
    /// (NONE on first registration), `merged` the new full mask.
    fn add(&mut self, fd: RawFd, prev: Mask, merged: Mask) -> io::Result<()>;

    /// Updates interest after bits were cleared; `remaining` may be NONE, in
    /// which case the fd leaves the interest set entirely.
    fn del(&mut self, fd: RawFd, remaining: Mask) -> io::Result<()>;

    /// Blocks until at least one fd is ready or the timeout elapses
    /// (`None` blocks indefinitely), appending ready fds to `fired`.
    /// Interrupted waits are retried; persistent failure is fatal.
    fn poll(&mut self, timeout: Option<Duration>, maxfd: RawFd, fired: &mut Vec<FiredEvent>)
    -> usize;

    /// Adjusts backend capacity to a new set size.
    fn resize(&mut self, set_size: usize) -> Result<(), ReactorError>;

    fn name(&self) -> &'static str;
}

/// The preferred backend for this platform.
pub fn default_backend(set_size: usize) -> io::Result<Box<dyn PollBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(EpollBackend::new(set_size)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = set_size;
        Ok(Box::new(SelectBackend::new()))
    }
}
