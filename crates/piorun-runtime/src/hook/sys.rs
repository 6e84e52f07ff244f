//! Thin adapter over the real libc calls
//!
//! Every function here is the plain, possibly blocking system call with
//! slices in place of pointer/length pairs. Results and errno are passed
//! through untouched.

use libc::{c_int, c_void, pollfd, socklen_t};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Owned `sockaddr_storage` plus the length the kernel filled in.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: socklen_t,
}

impl SockAddr {
    /// Buffer for the kernel to fill (accept, recvfrom, getsockname).
    pub fn empty() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as socklen_t,
        }
    }

    #[inline]
    pub fn family(&self) -> c_int {
        self.storage.ss_family as c_int
    }

    #[inline]
    pub fn len(&self) -> socklen_t {
        self.len
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    fn as_mut_parts(&mut self) -> (*mut libc::sockaddr, *mut socklen_t) {
        self.len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        (
            &mut self.storage as *mut _ as *mut libc::sockaddr,
            &mut self.len,
        )
    }

    /// Decode as an IPv4/IPv6 address; `None` for other families.
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self.family() {
            libc::AF_INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut out = SockAddr::empty();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(&mut out.storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                out.len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(&mut out.storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                out.len = mem::size_of::<libc::sockaddr_in6>() as socklen_t;
            }
        }
        out
    }
}

fn addr_parts(addr: Option<&mut SockAddr>) -> (*mut libc::sockaddr, *mut socklen_t) {
    match addr {
        Some(addr) => addr.as_mut_parts(),
        None => (std::ptr::null_mut(), std::ptr::null_mut()),
    }
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    unsafe { libc::socket(domain, ty, protocol) }
}

pub fn accept(fd: RawFd, addr: Option<&mut SockAddr>) -> c_int {
    let (ptr, len) = addr_parts(addr);
    unsafe { libc::accept4(fd, ptr, len, libc::SOCK_CLOEXEC) }
}

pub fn connect(fd: RawFd, addr: &SockAddr) -> c_int {
    unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }
}

pub fn bind(fd: RawFd, addr: &SockAddr) -> c_int {
    unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) }
}

pub fn listen(fd: RawFd, backlog: c_int) -> c_int {
    unsafe { libc::listen(fd, backlog) }
}

pub fn getsockname(fd: RawFd, addr: &mut SockAddr) -> c_int {
    let (ptr, len) = addr.as_mut_parts();
    unsafe { libc::getsockname(fd, ptr, len) }
}

pub fn getpeername(fd: RawFd, addr: &mut SockAddr) -> c_int {
    let (ptr, len) = addr.as_mut_parts();
    unsafe { libc::getpeername(fd, ptr, len) }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) }
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) }
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) }
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> isize {
    unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) }
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: c_int, addr: Option<&mut SockAddr>) -> isize {
    let (ptr, len) = addr_parts(addr);
    unsafe { libc::recvfrom(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags, ptr, len) }
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: Option<&SockAddr>) -> isize {
    let (ptr, len) = match addr {
        Some(addr) => (addr.as_ptr(), addr.len()),
        None => (std::ptr::null(), 0),
    };
    unsafe { libc::sendto(fd, buf.as_ptr() as *const c_void, buf.len(), flags, ptr, len) }
}

pub fn poll(fds: &mut [pollfd], timeout_ms: c_int) -> c_int {
    unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) }
}

/// `setsockopt` with `value` passed by reference as the option buffer.
pub fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> c_int {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    }
}

/// Pending socket error (`SO_ERROR`), or -1 with errno set.
pub fn socket_error(fd: RawFd) -> c_int {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if ret < 0 {
        ret
    } else {
        err
    }
}

/// `fcntl` for the integer-argument commands.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    unsafe { libc::fcntl(fd, cmd, arg) }
}

pub fn shutdown(fd: RawFd, how: c_int) -> c_int {
    unsafe { libc::shutdown(fd, how) }
}

pub fn close(fd: RawFd) -> c_int {
    unsafe { libc::close(fd) }
}
