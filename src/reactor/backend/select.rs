//! Portable `select(2)` backend.
//!
//! Capacity is capped at `FD_SETSIZE`; the working fd sets are copied from
//! the masters before every wait because `select` mutates them in place.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use tracing::error;

use super::{FiredEvent, PollBackend};
use crate::reactor::{Mask, READABLE, ReactorError, WRITABLE};

pub struct SelectBackend {
    rfds: libc::fd_set,
    wfds: libc::fd_set,
}

fn empty_set() -> libc::fd_set {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

impl SelectBackend {
    pub fn new() -> Self {
        Self {
            rfds: empty_set(),
            wfds: empty_set(),
        }
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PollBackend for SelectBackend {
    fn add(&mut self, fd: RawFd, _prev: Mask, merged: Mask) -> io::Result<()> {
        if merged & READABLE != 0 {
            unsafe { libc::FD_SET(fd, &mut self.rfds) };
        }
        if merged & WRITABLE != 0 {
            unsafe { libc::FD_SET(fd, &mut self.wfds) };
        }
        Ok(())
    }

    fn del(&mut self, fd: RawFd, remaining: Mask) -> io::Result<()> {
        if remaining & READABLE == 0 {
            unsafe { libc::FD_CLR(fd, &mut self.rfds) };
        }
        if remaining & WRITABLE == 0 {
            unsafe { libc::FD_CLR(fd, &mut self.wfds) };
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        maxfd: RawFd,
        fired: &mut Vec<FiredEvent>,
    ) -> usize {
        loop {
            // select() scribbles on its arguments: work on copies, rebuilt
            // on every attempt including EINTR retries.
            let mut rfds = self.rfds;
            let mut wfds = self.wfds;
            let mut tv = timeout.map(|d| libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            });
            let tvp = tv
                .as_mut()
                .map_or(ptr::null_mut(), |t| t as *mut libc::timeval);

            let n = unsafe {
                libc::select(maxfd + 1, &mut rfds, &mut wfds, ptr::null_mut(), tvp)
            };
            if n >= 0 {
                let mut count = 0;
                for fd in 0..=maxfd {
                    let mut mask = 0;
                    if unsafe { libc::FD_ISSET(fd, &rfds) } {
                        mask |= READABLE;
                    }
                    if unsafe { libc::FD_ISSET(fd, &wfds) } {
                        mask |= WRITABLE;
                    }
                    if mask != 0 {
                        fired.push(FiredEvent { fd, mask });
                        count += 1;
                    }
                }
                return count;
            }

            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "select failed");
            panic!("reactor polling backend failed: {err}");
        }
    }

    fn resize(&mut self, set_size: usize) -> Result<(), ReactorError> {
        if set_size > libc::FD_SETSIZE {
            return Err(ReactorError::SetSizeTooLarge {
                requested: set_size,
                limit: libc::FD_SETSIZE,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
