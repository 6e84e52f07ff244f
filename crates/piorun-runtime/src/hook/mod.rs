//! Fiber-aware socket calls
//!
//! Each function here has the shape of the libc call it stands in for
//! (`c_int`/`isize` result, errno on failure). When called from a fiber
//! with hooking enabled on a descriptor the runtime manages, an operation
//! that would block suspends the fiber on the reactor instead. Everything
//! else goes straight to the real call.
//!
//! Sockets become managed when created through [`socket`] or [`accept`]
//! inside a hooked fiber, explicitly through [`register`], or by the
//! [`net`] types, which manage every socket they open. Their real file
//! status carries `O_NONBLOCK`; [`fcntl`] keeps reporting the flags the
//! user asked for.
//!
//! The real descriptor stays non-blocking for its whole life. Used
//! through these functions from a plain thread, or after
//! `disable_system_hook`, a managed descriptor therefore reports
//! `EAGAIN` where a blocking one would wait. The [`net`] types wait on
//! their own sockets in every context and are unaffected.

pub mod net;
mod poll;
mod registry;
pub mod sys;

pub use poll::co_poll;
pub use registry::{registry, FdContext, FdRegistry};
pub use sys::SockAddr;

use crate::this_fiber::is_hook_enabled;
use libc::{c_int, pollfd};
use nix::errno::Errno;
use piorun_core::ktrace;
use poll::co_poll_inner;
use registry::timeval_to_timeout;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

const CONNECT_ROUNDS: usize = 3;
const CONNECT_ROUND_MS: c_int = 25_000;

const READ_EVENTS: i16 = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
const WRITE_EVENTS: i16 = libc::POLLOUT | libc::POLLERR | libc::POLLHUP;

/// Context of a managed descriptor whose user flags ask for blocking
/// behaviour.
fn managed(fd: RawFd) -> Option<Arc<FdContext>> {
    registry().get(fd).filter(|ctx| !ctx.user_nonblocking())
}

/// Context of `fd` if a call on it should suspend rather than block.
fn hooked(fd: RawFd) -> Option<Arc<FdContext>> {
    if !is_hook_enabled() {
        return None;
    }
    managed(fd)
}

/// Track `fd` and switch the real descriptor to non-blocking.
fn adopt(fd: RawFd, domain: c_int) -> c_int {
    let flags = sys::fcntl(fd, libc::F_GETFL, 0);
    if flags < 0 {
        return flags;
    }
    registry().insert(fd, FdContext::new(domain, flags));
    ktrace!("fd {} adopted (flags {:#x})", fd, flags);
    sys::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
}

/// Bring an existing descriptor (pipe, socketpair, inherited socket)
/// under runtime management.
pub fn register(fd: RawFd) -> c_int {
    if fd < 0 {
        Errno::set(Errno::EBADF);
        return -1;
    }
    adopt(fd, libc::AF_UNSPEC)
}

/// Wait for `events` on `fd`: 1 when ready, 0 on timeout, -1 on error.
fn wait_fd(fd: RawFd, events: i16, timeout_ms: c_int) -> c_int {
    let mut fds = [pollfd {
        fd,
        events,
        revents: 0,
    }];
    co_poll_inner(&mut fds, timeout_ms, true)
}

/// Retry `op` while it reports `EAGAIN` and the descriptor turns readable.
fn read_loop(fd: RawFd, ctx: &FdContext, mut op: impl FnMut() -> isize) -> isize {
    loop {
        let n = op();
        if n >= 0 || Errno::last() != Errno::EAGAIN {
            return n;
        }
        match wait_fd(fd, READ_EVENTS, ctx.read_poll_ms()) {
            0 => {
                Errno::set(Errno::EAGAIN);
                return -1;
            }
            r if r < 0 => return -1,
            _ => {}
        }
    }
}

/// Push all of `buf` through `op`, waiting for writability in between.
fn write_loop(fd: RawFd, ctx: &FdContext, buf: &[u8], mut op: impl FnMut(&[u8]) -> isize) -> isize {
    if buf.is_empty() {
        return op(buf);
    }
    let mut written = 0usize;
    while written < buf.len() {
        let n = op(&buf[written..]);
        if n > 0 {
            written += n as usize;
            continue;
        }
        if n == 0 {
            break;
        }
        if Errno::last() != Errno::EAGAIN {
            return if written > 0 { written as isize } else { -1 };
        }
        match wait_fd(fd, WRITE_EVENTS, ctx.write_poll_ms()) {
            0 if written == 0 => {
                Errno::set(Errno::EAGAIN);
                return -1;
            }
            r if r <= 0 => {
                return if written > 0 { written as isize } else { -1 };
            }
            _ => {}
        }
    }
    written as isize
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    open_socket(domain, ty, protocol, is_hook_enabled())
}

/// `socket` that manages the descriptor whoever calls it.
pub(crate) fn socket_owned(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    open_socket(domain, ty, protocol, true)
}

fn open_socket(domain: c_int, ty: c_int, protocol: c_int, manage: bool) -> c_int {
    let fd = sys::socket(domain, ty, protocol);
    if fd < 0 || !manage {
        return fd;
    }
    if adopt(fd, domain) < 0 {
        let err = Errno::last();
        sys::close(fd);
        registry().remove(fd);
        Errno::set(err);
        return -1;
    }
    fd
}

pub fn accept(fd: RawFd, addr: Option<&mut SockAddr>) -> c_int {
    let Some(ctx) = hooked(fd) else {
        let cli = sys::accept(fd, addr);
        if cli >= 0 && is_hook_enabled() {
            let domain = registry().get(fd).map_or(libc::AF_UNSPEC, |c| c.domain());
            adopt(cli, domain);
        }
        return cli;
    };
    accept_waiting(fd, &ctx, addr)
}

/// Accept on a managed listener from any context. Off a fiber the wait
/// is a real `poll`.
pub(crate) fn accept_owned(fd: RawFd, addr: Option<&mut SockAddr>) -> c_int {
    match managed(fd) {
        Some(ctx) => accept_waiting(fd, &ctx, addr),
        None => sys::accept(fd, addr),
    }
}

fn accept_waiting(fd: RawFd, ctx: &FdContext, mut addr: Option<&mut SockAddr>) -> c_int {
    loop {
        let cli = sys::accept(fd, addr.as_deref_mut());
        if cli >= 0 {
            adopt(cli, ctx.domain());
            return cli;
        }
        if Errno::last() != Errno::EAGAIN {
            return cli;
        }
        match wait_fd(fd, READ_EVENTS, ctx.read_poll_ms()) {
            0 => {
                Errno::set(Errno::EAGAIN);
                return -1;
            }
            r if r < 0 => return -1,
            _ => {}
        }
    }
}

pub fn connect(fd: RawFd, addr: &SockAddr) -> c_int {
    let waits = hooked(fd).is_some();
    connect_in(fd, addr, waits)
}

pub(crate) fn connect_owned(fd: RawFd, addr: &SockAddr) -> c_int {
    let waits = managed(fd).is_some();
    connect_in(fd, addr, waits)
}

fn connect_in(fd: RawFd, addr: &SockAddr, waits: bool) -> c_int {
    let ret = sys::connect(fd, addr);
    if !waits {
        return ret;
    }
    if !(ret < 0 && Errno::last() == Errno::EINPROGRESS) {
        return ret;
    }

    let mut fds = [pollfd {
        fd,
        events: WRITE_EVENTS,
        revents: 0,
    }];
    for _ in 0..CONNECT_ROUNDS {
        fds[0].revents = 0;
        if co_poll_inner(&mut fds, CONNECT_ROUND_MS, true) > 0 {
            break;
        }
    }

    if fds[0].revents & WRITE_EVENTS != 0 {
        match sys::socket_error(fd) {
            0 => return 0,
            err if err > 0 => Errno::set_raw(err),
            // getsockopt itself failed; errno already set
            _ => {}
        }
        return -1;
    }
    Errno::set(Errno::ETIMEDOUT);
    -1
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::read(fd, buf);
    };
    read_loop(fd, &ctx, || sys::read(fd, buf))
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::recv(fd, buf, flags);
    };
    read_loop(fd, &ctx, || sys::recv(fd, buf, flags))
}

pub(crate) fn recv_owned(fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    let Some(ctx) = managed(fd) else {
        return sys::recv(fd, buf, flags);
    };
    read_loop(fd, &ctx, || sys::recv(fd, buf, flags))
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: c_int, mut addr: Option<&mut SockAddr>) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::recvfrom(fd, buf, flags, addr);
    };
    read_loop(fd, &ctx, || sys::recvfrom(fd, buf, flags, addr.as_deref_mut()))
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::write(fd, buf);
    };
    write_loop(fd, &ctx, buf, |chunk| sys::write(fd, chunk))
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::send(fd, buf, flags);
    };
    write_loop(fd, &ctx, buf, |chunk| sys::send(fd, chunk, flags))
}

pub(crate) fn send_owned(fd: RawFd, buf: &[u8], flags: c_int) -> isize {
    let Some(ctx) = managed(fd) else {
        return sys::send(fd, buf, flags);
    };
    write_loop(fd, &ctx, buf, |chunk| sys::send(fd, chunk, flags))
}

/// Datagram send: one attempt, one wait on `EAGAIN`, one retry.
pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: Option<&SockAddr>) -> isize {
    let Some(ctx) = hooked(fd) else {
        return sys::sendto(fd, buf, flags, addr);
    };
    let n = sys::sendto(fd, buf, flags, addr);
    if n >= 0 || Errno::last() != Errno::EAGAIN {
        return n;
    }
    if wait_fd(fd, WRITE_EVENTS, ctx.write_poll_ms()) <= 0 {
        Errno::set(Errno::EAGAIN);
        return -1;
    }
    sys::sendto(fd, buf, flags, addr)
}

/// `poll(2)` that suspends the fiber. Duplicate descriptors are merged
/// for the wait, since epoll takes each descriptor once.
pub fn poll(fds: &mut [pollfd], timeout_ms: c_int) -> c_int {
    if timeout_ms == 0 || !is_hook_enabled() {
        return sys::poll(fds, timeout_ms);
    }

    let mut index: HashMap<RawFd, usize> = HashMap::with_capacity(fds.len());
    let mut merged: Vec<pollfd> = Vec::with_capacity(fds.len());
    for pfd in fds.iter() {
        match index.get(&pfd.fd) {
            Some(&i) => merged[i].events |= pfd.events,
            None => {
                index.insert(pfd.fd, merged.len());
                merged.push(pollfd {
                    fd: pfd.fd,
                    events: pfd.events,
                    revents: 0,
                });
            }
        }
    }
    if merged.len() == fds.len() {
        return co_poll_inner(fds, timeout_ms, true);
    }

    let ret = co_poll_inner(&mut merged, timeout_ms, true);
    let always = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    for pfd in fds.iter_mut() {
        pfd.revents = index
            .get(&pfd.fd)
            .map_or(0, |&i| merged[i].revents & (pfd.events | always));
    }
    ret
}

/// `setsockopt` that also records `SO_RCVTIMEO`/`SO_SNDTIMEO` for the
/// hooked read and write waits.
pub fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> c_int {
    let is_timeout = level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && std::mem::size_of::<T>() == std::mem::size_of::<libc::timeval>();
    if is_timeout {
        if let Some(ctx) = registry().get(fd) {
            // Size checked above
            let tv = unsafe { &*(value as *const T as *const libc::timeval) };
            let timeout = timeval_to_timeout(tv);
            if name == libc::SO_RCVTIMEO {
                ctx.set_read_timeout(timeout);
            } else {
                ctx.set_write_timeout(timeout);
            }
        }
    }
    sys::setsockopt(fd, level, name, value)
}

/// `fcntl` for integer-argument commands. Commands taking a pointer
/// must go through libc directly.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    if fd < 0 {
        Errno::set(Errno::EBADF);
        return -1;
    }
    let ctx = registry().get(fd);
    match cmd {
        libc::F_GETFL => {
            let flags = sys::fcntl(fd, cmd, 0);
            match ctx {
                Some(ctx) if flags >= 0 && !ctx.user_nonblocking() => flags & !libc::O_NONBLOCK,
                _ => flags,
            }
        }
        libc::F_SETFL => {
            let forced = if ctx.is_some() {
                arg | libc::O_NONBLOCK
            } else {
                arg
            };
            let ret = sys::fcntl(fd, cmd, forced);
            if ret == 0 {
                if let Some(ctx) = ctx {
                    ctx.set_user_flags(arg);
                }
            }
            ret
        }
        _ => sys::fcntl(fd, cmd, arg),
    }
}

pub fn close(fd: RawFd) -> c_int {
    registry().remove(fd);
    sys::close(fd)
}
