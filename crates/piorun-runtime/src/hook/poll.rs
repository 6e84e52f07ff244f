//! `poll(2)` on top of the environment's epoll instance
//!
//! A wait is filed as one `Poll` aggregate in the timer wheel plus one
//! `PollMember` per descriptor registered with epoll. Whichever comes
//! first, a ready member or the deadline, puts the aggregate on the active
//! list and the event loop resumes the fiber.

use super::sys;
use crate::env::Environment;
use crate::reactor::{Pending, PollWait};
use crate::timer::{deadline_after, now_ms, ItemKey, TimeoutItem};
use libc::{c_int, pollfd};
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::time::Duration;

const PAIRS: [(i16, u32); 6] = [
    (libc::POLLIN, libc::EPOLLIN as u32),
    (libc::POLLOUT, libc::EPOLLOUT as u32),
    (libc::POLLHUP, libc::EPOLLHUP as u32),
    (libc::POLLERR, libc::EPOLLERR as u32),
    (libc::POLLRDNORM, libc::EPOLLRDNORM as u32),
    (libc::POLLWRNORM, libc::EPOLLWRNORM as u32),
];

pub(crate) fn poll_to_epoll(events: i16) -> u32 {
    PAIRS
        .iter()
        .filter(|(p, _)| events & p != 0)
        .fold(0, |acc, (_, e)| acc | e)
}

pub(crate) fn epoll_to_poll(events: u32) -> i16 {
    PAIRS
        .iter()
        .filter(|(_, e)| events & e != 0)
        .fold(0, |acc, (p, _)| acc | p)
}

enum Armed {
    /// Single descriptor epoll refuses (regular file); use real poll.
    Fallback,
    Waiting,
    Failed,
}

/// Wait for readiness on `fds` for up to `timeout_ms` (`< 0` = forever),
/// suspending the calling fiber instead of the thread.
///
/// Returns the number of readiness notifications, 0 on timeout, or -1
/// with errno set. From a carrier, or with a zero timeout, this is plain
/// `poll(2)`.
pub fn co_poll(fds: &mut [pollfd], timeout_ms: c_int) -> c_int {
    co_poll_inner(fds, timeout_ms, false)
}

pub(crate) fn co_poll_inner(fds: &mut [pollfd], timeout_ms: c_int, fallback: bool) -> c_int {
    if timeout_ms == 0 {
        return sys::poll(fds, 0);
    }
    let env = Environment::current();
    let me = env.current_fiber();
    if me.get().is_carrier() {
        return sys::poll(fds, timeout_ms);
    }

    let now = now_ms();
    let expire = if timeout_ms < 0 {
        u64::MAX
    } else {
        deadline_after(Duration::from_millis(timeout_ms as u64))
    };

    let mut members: Vec<(ItemKey, RawFd)> = Vec::with_capacity(fds.len());
    let (parent, armed) = env.with_reactor(|r| {
        let wait = PollWait {
            fiber: me,
            revents: vec![0; fds.len()],
            raised: 0,
            released: false,
        };
        let parent = r.slab.insert(TimeoutItem::new(expire, Pending::Poll(wait)));

        for (index, pfd) in fds.iter().enumerate() {
            if pfd.fd < 0 {
                continue;
            }
            let key = r
                .slab
                .insert(TimeoutItem::new(expire, Pending::PollMember { parent, index }));
            match r.poller.add(pfd.fd, poll_to_epoll(pfd.events), key.to_u64()) {
                Ok(()) => members.push((key, pfd.fd)),
                Err(Errno::EPERM) if fallback && fds.len() == 1 => {
                    r.slab.remove(key);
                    r.slab.remove(parent);
                    return (parent, Armed::Fallback);
                }
                Err(_) => {
                    r.slab.remove(key);
                }
            }
        }

        match r.wheel.add_timeout(&mut r.slab, parent, now) {
            Ok(()) => (parent, Armed::Waiting),
            Err(_) => (parent, Armed::Failed),
        }
    });

    match armed {
        Armed::Fallback => return sys::poll(fds, timeout_ms),
        Armed::Waiting => me.get().suspend(),
        Armed::Failed => {}
    }

    let raised = env.with_reactor(|r| {
        for &(key, fd) in &members {
            // The descriptor may already be closed by another fiber
            let _ = r.poller.delete(fd);
            r.slab.remove(key);
        }
        let wait = match r.slab.remove(parent).map(|item| item.payload) {
            Some(Pending::Poll(wait)) => wait,
            _ => return 0,
        };
        for (pfd, bits) in fds.iter_mut().zip(wait.revents) {
            pfd.revents = epoll_to_poll(bits);
        }
        wait.raised
    });

    if let Armed::Failed = armed {
        Errno::set(Errno::EINVAL);
        return -1;
    }
    raised as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run_until_idle, spawn_local};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn pfd(fd: RawFd, events: i16) -> pollfd {
        pollfd { fd, events, revents: 0 }
    }

    #[test]
    fn test_event_conversion() {
        let poll = libc::POLLIN | libc::POLLOUT | libc::POLLERR;
        assert_eq!(epoll_to_poll(poll_to_epoll(poll)), poll);
        assert_eq!(poll_to_epoll(0), 0);
    }

    #[test]
    fn test_timeout_returns_zero() {
        let (r, w) = pipe();
        let result = Rc::new(Cell::new(-2));
        let res = result.clone();
        spawn_local(move || {
            let mut fds = [pfd(r, libc::POLLIN)];
            let start = Instant::now();
            res.set(co_poll(&mut fds, 30));
            assert!(start.elapsed() >= Duration::from_millis(30));
            assert_eq!(fds[0].revents, 0);
        });
        run_until_idle();
        assert_eq!(result.get(), 0);
        assert_eq!(Environment::current().pending_waits(), 0);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_timeout_never_fires_early() {
        let (r, w) = pipe();
        let shortest = Rc::new(Cell::new(Duration::MAX));
        let s = shortest.clone();
        spawn_local(move || {
            for _ in 0..20 {
                let mut fds = [pfd(r, libc::POLLIN)];
                let start = Instant::now();
                assert_eq!(co_poll(&mut fds, 10), 0);
                s.set(s.get().min(start.elapsed()));
            }
        });
        run_until_idle();
        assert!(shortest.get() >= Duration::from_millis(10), "{:?}", shortest.get());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_readiness_wakes_waiter() {
        let (r, w) = pipe();
        let result = Rc::new(Cell::new(-2));
        let res = result.clone();
        spawn_local(move || {
            let mut fds = [pfd(r, libc::POLLIN), pfd(-1, libc::POLLIN)];
            res.set(co_poll(&mut fds, -1));
            assert_ne!(fds[0].revents & libc::POLLIN, 0);
            assert_eq!(fds[1].revents, 0);
        });
        spawn_local(move || {
            assert_eq!(sys::write(w, b"ping"), 4);
        });
        run_until_idle();
        assert_eq!(result.get(), 1);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_carrier_uses_real_poll() {
        let (r, w) = pipe();
        assert_eq!(sys::write(w, b"x"), 1);
        let mut fds = [pfd(r, libc::POLLIN)];
        assert_eq!(co_poll(&mut fds, 100), 1);
        assert_ne!(fds[0].revents & libc::POLLIN, 0);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
