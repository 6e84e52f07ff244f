//! TCP echo server
//!
//! The accept loop runs in one fiber and every connection gets its own.
//! With hooking on, each blocking socket call parks only its fiber.
//!
//! ```text
//! cargo run -p piorun-echo -- 127.0.0.1:7000
//! nc 127.0.0.1 7000
//! ```
//!
//! # Environment Variables
//!
//! - `PIO_NUM_WORKERS` - worker threads
//! - `PIO_LOG_LEVEL=info` - log accepted connections

use piorun::hook::net::{TcpListener, TcpStream};
use piorun::{kdebug, kerror, kinfo, schedule, this_fiber, Runtime, RuntimeConfig};
use std::io::{Read, Write};
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:7000";
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn serve(mut stream: TcpStream) {
    this_fiber::enable_system_hook();
    let peer = stream.peer_addr().ok();
    if let Err(e) = stream.set_read_timeout(Some(IDLE_TIMEOUT)) {
        kerror!("set_read_timeout: {}", e);
    }

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]) {
                    kdebug!("{:?}: write failed: {}", peer, e);
                    break;
                }
            }
            Err(e) => {
                kdebug!("{:?}: read failed: {}", peer, e);
                break;
            }
        }
    }
    kinfo!("{:?} disconnected", peer);
}

fn accept_loop(listener: TcpListener) {
    this_fiber::enable_system_hook();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                kinfo!("accepted {}", peer);
                if let Err(e) = schedule(move || serve(stream)) {
                    kerror!("schedule: {}", e);
                }
            }
            Err(e) => {
                kerror!("accept: {}", e);
                this_fiber::sleep_for(Duration::from_millis(100));
            }
        }
    }
}

fn main() {
    let addr = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let listener = match TcpListener::bind(addr.as_str()) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    println!("echo server listening on {}", addr);

    let mut runtime = Runtime::new(RuntimeConfig::default());
    // The accept fiber never finishes, so this returns only on error
    let result = runtime.block_on(move || schedule(move || accept_loop(listener)));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => eprintln!("echo server failed: {}", e),
    }
}
