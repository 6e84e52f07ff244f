//! Process-wide per-descriptor bookkeeping for hooked sockets

use libc::c_int;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

const NO_TIMEOUT: i64 = -1;

/// What the runtime remembers about a descriptor it made non-blocking.
#[derive(Debug)]
pub struct FdContext {
    domain: c_int,
    /// File status flags as the user last set them
    user_flags: AtomicI32,
    /// Milliseconds, `-1` = infinite
    read_timeout_ms: AtomicI64,
    write_timeout_ms: AtomicI64,
}

impl FdContext {
    pub fn new(domain: c_int, user_flags: c_int) -> Self {
        Self {
            domain,
            user_flags: AtomicI32::new(user_flags),
            read_timeout_ms: AtomicI64::new(NO_TIMEOUT),
            write_timeout_ms: AtomicI64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn domain(&self) -> c_int {
        self.domain
    }

    #[inline]
    pub fn user_flags(&self) -> c_int {
        self.user_flags.load(Ordering::Relaxed)
    }

    pub(crate) fn set_user_flags(&self, flags: c_int) {
        self.user_flags.store(flags, Ordering::Relaxed);
    }

    /// The user asked for non-blocking behavior themselves.
    #[inline]
    pub fn user_nonblocking(&self) -> bool {
        self.user_flags() & libc::O_NONBLOCK != 0
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        decode(self.read_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        decode(self.write_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.read_timeout_ms.store(encode(timeout), Ordering::Relaxed);
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.write_timeout_ms.store(encode(timeout), Ordering::Relaxed);
    }

    /// Read timeout in poll(2) form.
    #[inline]
    pub(crate) fn read_poll_ms(&self) -> c_int {
        to_poll(self.read_timeout_ms.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn write_poll_ms(&self) -> c_int {
        to_poll(self.write_timeout_ms.load(Ordering::Relaxed))
    }
}

fn encode(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(d) => d.as_millis().min(i64::MAX as u128) as i64,
        None => NO_TIMEOUT,
    }
}

fn decode(ms: i64) -> Option<Duration> {
    (ms >= 0).then(|| Duration::from_millis(ms as u64))
}

fn to_poll(ms: i64) -> c_int {
    if ms < 0 {
        -1
    } else {
        ms.min(c_int::MAX as i64) as c_int
    }
}

/// Convert a socket-option `timeval`; zero means "no timeout" as for the kernel.
pub(crate) fn timeval_to_timeout(tv: &libc::timeval) -> Option<Duration> {
    if tv.tv_sec < 0 || tv.tv_usec < 0 {
        return None;
    }
    let ms = (tv.tv_sec as u64).saturating_mul(1000) + tv.tv_usec as u64 / 1000;
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[derive(Default)]
pub struct FdRegistry {
    map: RwLock<HashMap<RawFd, Arc<FdContext>>>,
}

impl FdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(&fd).cloned()
    }

    /// Register `fd`, replacing whatever a previous owner of the number left.
    pub fn insert(&self, fd: RawFd, ctx: FdContext) -> Arc<FdContext> {
        let ctx = Arc::new(ctx);
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(fd, ctx.clone());
        ctx
    }

    pub fn remove(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();

/// The registry shared by every thread of the process.
pub fn registry() -> &'static FdRegistry {
    REGISTRY.get_or_init(FdRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults() {
        let ctx = FdContext::new(libc::AF_INET, libc::O_RDWR);
        assert!(!ctx.user_nonblocking());
        assert_eq!(ctx.read_timeout(), None);
        assert_eq!(ctx.read_poll_ms(), -1);

        ctx.set_read_timeout(Some(Duration::from_millis(1500)));
        assert_eq!(ctx.read_poll_ms(), 1500);
        ctx.set_user_flags(libc::O_RDWR | libc::O_NONBLOCK);
        assert!(ctx.user_nonblocking());
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = libc::timeval { tv_sec: 2, tv_usec: 250_000 };
        assert_eq!(timeval_to_timeout(&tv), Some(Duration::from_millis(2250)));
        let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
        assert_eq!(timeval_to_timeout(&zero), None);
    }

    #[test]
    fn test_registry_replace_and_remove() {
        let reg = FdRegistry::new();
        assert!(reg.get(7).is_none());
        reg.insert(7, FdContext::new(libc::AF_INET, 0));
        let second = reg.insert(7, FdContext::new(libc::AF_INET6, 0));
        assert_eq!(reg.get(7).unwrap().domain(), second.domain());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(7).is_some());
        assert!(reg.is_empty());
        assert!(reg.get(-1).is_none());
    }
}
