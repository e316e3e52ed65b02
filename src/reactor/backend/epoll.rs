//! Linux `epoll(7)` backend.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::error;

use super::{FiredEvent, PollBackend};
use crate::reactor::{Mask, READABLE, ReactorError, WRITABLE};

pub struct EpollBackend {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new(set_size: usize) -> io::Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; set_size.max(1)],
        })
    }

    fn interest(mask: Mask) -> u32 {
        let mut ev = 0;
        if mask & READABLE != 0 {
            ev |= libc::EPOLLIN as u32;
        }
        if mask & WRITABLE != 0 {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: Mask) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::interest(mask),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl PollBackend for EpollBackend {
    fn add(&mut self, fd: RawFd, prev: Mask, merged: Mask) -> io::Result<()> {
        let op = if prev & (READABLE | WRITABLE) == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, merged)
    }

    fn del(&mut self, fd: RawFd, remaining: Mask) -> io::Result<()> {
        if remaining & (READABLE | WRITABLE) != 0 {
            self.ctl(libc::EPOLL_CTL_MOD, fd, remaining)
        } else {
            self.ctl(libc::EPOLL_CTL_DEL, fd, remaining)
        }
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        _maxfd: RawFd,
        fired: &mut Vec<FiredEvent>,
    ) -> usize {
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                for ev in &self.events[..n as usize] {
                    let mut mask = 0;
                    if ev.events & libc::EPOLLIN as u32 != 0 {
                        mask |= READABLE;
                    }
                    if ev.events & libc::EPOLLOUT as u32 != 0 {
                        mask |= WRITABLE;
                    }
                    // Error and hangup wake both directions so handlers get
                    // a chance to observe the failure on read or write.
                    if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                        mask |= READABLE | WRITABLE;
                    }
                    fired.push(FiredEvent {
                        fd: ev.u64 as RawFd,
                        mask,
                    });
                }
                return n as usize;
            }

            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "epoll_wait failed");
            panic!("reactor polling backend failed: {err}");
        }
    }

    fn resize(&mut self, set_size: usize) -> Result<(), ReactorError> {
        self.events
            .resize(set_size.max(1), libc::epoll_event { events: 0, u64: 0 });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
