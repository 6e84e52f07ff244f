//! Per-thread readiness and timeout bookkeeping
//!
//! The `Reactor` bundles the epoll instance with the `TimeoutSlab` that
//! holds every pending wait of one thread, the `TimerWheel` indexing
//! those waits by deadline, and the two lists an event-loop tick moves
//! them through (`active`, `timed_out`).
//!
//! Waits are described by `Pending`:
//! - `Wake`: resume a fiber at a deadline (sleep)
//! - `Poll`: aggregate of a multi-descriptor wait; released into the
//!   active list by its first ready member or by its deadline
//! - `PollMember`: one descriptor of a `Poll`; registered with epoll and
//!   never run directly

use crate::fiber::FiberRef;
use crate::timer::{AddTimeoutError, ItemKey, LinkId, TimeoutItem, TimeoutSlab, TimerWheel};
use nix::errno::Errno;
use piorun_core::error::{SchedResult, WorkerError};
use piorun_core::{kerror, kwarn};
use std::os::fd::RawFd;

pub(crate) enum Pending {
    Wake(FiberRef),
    Poll(PollWait),
    PollMember { parent: ItemKey, index: usize },
}

pub(crate) struct PollWait {
    pub fiber: FiberRef,
    /// epoll bits seen per member, by position in the caller's fd array
    pub revents: Vec<u32>,
    /// Number of readiness notifications received
    pub raised: usize,
    /// Already moved to the active list
    pub released: bool,
}

/// Thin owner of an epoll descriptor plus its event buffer.
pub struct Poller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(capacity: usize) -> SchedResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let errno = Errno::last_raw();
            kerror!("epoll_create1 failed: {}", Errno::from_raw(errno));
            return Err(WorkerError::PollerFailed(errno).into());
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    /// Register `fd` for `events`, tagging notifications with `token`.
    pub fn add(&self, fd: RawFd, events: u32, token: u64) -> Result<(), Errno> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        Errno::result(ret).map(drop)
    }

    pub fn delete(&self, fd: RawFd) -> Result<(), Errno> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        Errno::result(ret).map(drop)
    }

    /// Wait up to `timeout_ms` and return how many events were harvested.
    pub fn wait(&mut self, timeout_ms: i32) -> usize {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = Errno::last();
            if err != Errno::EINTR {
                kwarn!("epoll_wait on fd {} failed: {}", self.epfd, err);
            }
            return 0;
        }
        n as usize
    }

    /// (token, event bits) of harvested event `i`.
    #[inline]
    pub fn event(&self, i: usize) -> (u64, u32) {
        let ev = self.events[i];
        (ev.u64, ev.events)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

pub(crate) struct Reactor {
    pub poller: Poller,
    pub slab: TimeoutSlab<Pending>,
    pub wheel: TimerWheel,
    active: LinkId,
    timed_out: LinkId,
}

impl Reactor {
    pub fn new(epoll_events: usize, wheel_slots: usize) -> SchedResult<Self> {
        let poller = Poller::new(epoll_events)?;
        let mut slab = TimeoutSlab::new();
        let wheel = TimerWheel::new(&mut slab, wheel_slots);
        let active = slab.new_link();
        let timed_out = slab.new_link();
        Ok(Self {
            poller,
            slab,
            wheel,
            active,
            timed_out,
        })
    }

    /// Insert a wait and file it in the wheel. On failure the item is
    /// discarded again and the wheel's verdict returned.
    pub fn schedule_timeout(
        &mut self,
        item: TimeoutItem<Pending>,
        now: u64,
    ) -> Result<ItemKey, AddTimeoutError> {
        let key = self.slab.insert(item);
        match self.wheel.add_timeout(&mut self.slab, key, now) {
            Ok(()) => Ok(key),
            Err(e) => {
                self.slab.remove(key);
                Err(e)
            }
        }
    }

    /// Route the first `n` harvested epoll events through their prepare step.
    pub fn dispatch_events(&mut self, n: usize) {
        for i in 0..n {
            let (token, bits) = self.poller.event(i);
            self.prepare(ItemKey::from_u64(token), bits);
        }
    }

    fn prepare(&mut self, key: ItemKey, bits: u32) {
        let member = match self.slab.get(key).map(|item| &item.payload) {
            Some(Pending::PollMember { parent, index }) => Some((*parent, *index)),
            Some(_) => None,
            // Registration already torn down by its fiber
            None => return,
        };

        let Some((parent, index)) = member else {
            self.slab.unlink(key);
            self.slab.push_back(self.active, key);
            return;
        };

        let release = match self.slab.get_mut(parent).map(|item| &mut item.payload) {
            Some(Pending::Poll(wait)) => {
                if let Some(slot) = wait.revents.get_mut(index) {
                    *slot |= bits;
                }
                wait.raised += 1;
                !std::mem::replace(&mut wait.released, true)
            }
            _ => false,
        };
        if release {
            self.slab.unlink(parent);
            self.slab.push_back(self.active, parent);
        }
    }

    /// Harvest the wheel up to `now`, merge with readiness, and collect
    /// the fibers to resume this tick.
    pub fn collect_due(&mut self, now: u64, out: &mut Vec<FiberRef>) {
        self.wheel.take_all_timeout(&mut self.slab, now, self.timed_out);

        let expired: Vec<ItemKey> = self.slab.iter(self.timed_out).collect();
        for key in expired {
            if let Some(item) = self.slab.get_mut(key) {
                item.timed_out = true;
            }
        }
        self.slab.join(self.active, self.timed_out);

        while let Some(key) = self.slab.pop_front(self.active) {
            let early = match self.slab.get(key) {
                Some(item) => item.timed_out && now < item.expire_ms,
                None => continue,
            };
            if early && self.wheel.add_timeout(&mut self.slab, key, now).is_ok() {
                if let Some(item) = self.slab.get_mut(key) {
                    item.timed_out = false;
                }
                continue;
            }

            match self.slab.get_mut(key).map(|item| &mut item.payload) {
                Some(Pending::Wake(fiber)) => out.push(*fiber),
                Some(Pending::Poll(wait)) => {
                    wait.released = true;
                    out.push(wait.fiber);
                }
                Some(Pending::PollMember { .. }) | None => {}
            }
        }
    }

    /// Waits currently outstanding (sleeps, polls and their members).
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.slab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poller_reports_readable_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut poller = Poller::new(8).unwrap();
        poller.add(fds[0], libc::EPOLLIN as u32, 0xfeed).unwrap();

        assert_eq!(poller.wait(0), 0);
        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) }, 1);
        assert_eq!(poller.wait(100), 1);
        let (token, bits) = poller.event(0);
        assert_eq!(token, 0xfeed);
        assert_ne!(bits & libc::EPOLLIN as u32, 0);

        poller.delete(fds[0]).unwrap();
        assert_eq!(poller.delete(fds[0]), Err(Errno::ENOENT));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_regular_file_is_rejected_with_eperm() {
        let poller = Poller::new(1).unwrap();
        let file = std::fs::File::open("/proc/self/status")
            .or_else(|_| std::fs::File::open("/etc/hostname"))
            .unwrap();
        use std::os::fd::AsRawFd;
        assert_eq!(
            poller.add(file.as_raw_fd(), libc::EPOLLIN as u32, 1),
            Err(Errno::EPERM)
        );
    }
}
