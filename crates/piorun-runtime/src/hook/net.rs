//! # TCP sockets on top of the hooked calls
//!
//! Every socket these types open is managed by the hook layer, wherever
//! it was created. Inside a fiber `accept`, `connect`, `read` and `write`
//! suspend the fiber instead of the worker thread:
//!
//! ```ignore
//! let listener = TcpListener::bind("127.0.0.1:7000")?;
//! loop {
//!     let (mut stream, _) = listener.accept()?;
//!     piorun::schedule(move || {
//!         this_fiber::enable_system_hook();
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n @ 1..) = stream.read(&mut buf) {
//!             stream.write_all(&buf[..n]).ok();
//!         }
//!     })?;
//! }
//! ```
//!
//! Used from a plain thread the same types behave like blocking sockets:
//! they wait in a real `poll(2)`, honouring the socket timeouts.

use super::sys::{self, SockAddr};
use nix::errno::Errno;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 1024;

fn cvt(ret: i32) -> io::Result<i32> {
    Errno::result(ret).map_err(io::Error::from)
}

fn cvt_size(ret: isize) -> io::Result<usize> {
    Errno::result(ret).map(|n| n as usize).map_err(io::Error::from)
}

fn first_addr<A: ToSocketAddrs>(addr: A) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket address"))
}

fn domain_of(addr: &SocketAddr) -> i32 {
    if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    }
}

/// Owns a descriptor and closes it through the hook layer on drop.
struct Socket(RawFd);

impl Socket {
    fn new(domain: i32) -> io::Result<Self> {
        let fd = cvt(super::socket_owned(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
        Ok(Socket(fd))
    }

    fn set_flag(&self, level: i32, name: i32) -> io::Result<()> {
        let on: i32 = 1;
        cvt(super::setsockopt(self.0, level, name, &on)).map(drop)
    }

    fn set_timeout(&self, name: i32, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) if d.is_zero() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero timeout is not allowed",
                ));
            }
            Some(d) => libc::timeval {
                tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        cvt(super::setsockopt(self.0, libc::SOL_SOCKET, name, &tv)).map(drop)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut sa = SockAddr::empty();
        cvt(sys::getsockname(self.0, &mut sa))?;
        decode(&sa)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut sa = SockAddr::empty();
        cvt(sys::getpeername(self.0, &mut sa))?;
        decode(&sa)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        super::close(self.0);
    }
}

fn decode(sa: &SockAddr) -> io::Result<SocketAddr> {
    sa.to_std()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet address"))
}

/// A listening TCP socket.
pub struct TcpListener {
    sock: Socket,
}

impl TcpListener {
    /// Create, bind and listen (`SO_REUSEADDR` set).
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = first_addr(addr)?;
        let sock = Socket::new(domain_of(&addr))?;
        sock.set_flag(libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        cvt(sys::bind(sock.0, &SockAddr::from(addr)))?;
        cvt(sys::listen(sock.0, LISTEN_BACKLOG))?;
        Ok(Self { sock })
    }

    /// Wait for the next connection.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let mut sa = SockAddr::empty();
        let fd = cvt(super::accept_owned(self.sock.0, Some(&mut sa)))?;
        let stream = TcpStream { sock: Socket(fd) };
        // Latency over throughput for small echo-style exchanges
        stream.sock.set_flag(libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok((stream, decode(&sa)?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Waiting limit for `accept`.
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(libc::SO_RCVTIMEO, timeout)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.0
    }
}

/// A connected TCP stream.
pub struct TcpStream {
    sock: Socket,
}

impl TcpStream {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = first_addr(addr)?;
        let sock = Socket::new(domain_of(&addr))?;
        cvt(super::connect_owned(sock.0, &SockAddr::from(addr)))?;
        sock.set_flag(libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(Self { sock })
    }

    /// `None` waits forever. A zero duration is rejected, as in std.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(libc::SO_RCVTIMEO, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(libc::SO_SNDTIMEO, timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(sys::shutdown(self.sock.0, how)).map(drop)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(super::recv_owned(self.sock.0, buf, 0))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(super::send_owned(self.sock.0, buf, libc::MSG_NOSIGNAL))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.0
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream").field("fd", &self.sock.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::event_loop::{run_until_idle, spawn_local};
    use crate::hook::registry;
    use crate::scheduler::{self, Scheduler};
    use crate::this_fiber;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_echo_between_fibers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reply = Rc::new(RefCell::new(Vec::new()));

        spawn_local(move || {
            this_fiber::enable_system_hook();
            let (mut stream, peer) = listener.accept().unwrap();
            assert!(peer.ip().is_loopback());
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(&buf[..n]).unwrap();
        });
        let r = reply.clone();
        spawn_local(move || {
            this_fiber::enable_system_hook();
            let mut stream = TcpStream::connect(addr).unwrap();
            assert_eq!(stream.peer_addr().unwrap(), addr);
            stream.write_all(b"piorun").unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            r.borrow_mut().extend_from_slice(&buf[..n]);
        });
        run_until_idle();
        assert_eq!(&*reply.borrow(), b"piorun");
    }

    #[test]
    fn test_listener_bound_off_fiber_accepts_on_worker() {
        // Same layout as the echo demo: bind on the main thread, serve on
        // a single worker
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(registry().get(listener.as_raw_fd()).is_some());

        let mut sched = Scheduler::start(RuntimeConfig::new().num_workers(1)).unwrap();
        sched
            .schedule(move || {
                let (stream, _) = listener.accept().unwrap();
                scheduler::schedule(move || {
                    let mut stream = stream;
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).unwrap();
                    stream.write_all(&buf[..n]).unwrap();
                })
                .unwrap();
            })
            .unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        sched.shutdown().unwrap();
    }

    #[test]
    fn test_read_timeout_from_plain_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(30))).unwrap();

        let start = std::time::Instant::now();
        let mut buf = [0u8; 1];
        let err = (&stream).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_blocking_use_from_plain_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(b"hi").unwrap();
        });
        let (mut s, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hi");
        client.join().unwrap();
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let err = stream.set_read_timeout(Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        stream.set_write_timeout(None).unwrap();
    }
}
