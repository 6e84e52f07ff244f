//! Basic piorun example
//!
//! Schedules a handful of fibers over several workers. They sleep, yield
//! and bump a counter guarded by a fiber mutex.
//!
//! # Environment Variables
//!
//! - `PIO_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `PIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use piorun::sync::Mutex;
use piorun::{kdebug, kinfo, schedule, this_fiber, Runtime, RuntimeConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIBERS: usize = 8;
const ROUNDS: usize = 3;

// PIO_LOG_LEVEL=debug PIO_FLUSH_EPRINT=1 cargo run -p piorun-basic
fn main() {
    println!("=== piorun Basic Example ===\n");

    let config = RuntimeConfig::default().num_workers(4);
    let mut runtime = Runtime::new(config);
    let counter = Arc::new(Mutex::new(0usize));
    let start = Instant::now();

    let scheduled = runtime.block_on(|| {
        kinfo!("Scheduling {} fibers...", FIBERS);

        for i in 0..FIBERS {
            let counter = counter.clone();
            let res = schedule(move || {
                kdebug!(
                    "[fiber {}] started on worker {:?} as {}",
                    i,
                    this_fiber::get_thread_id(),
                    this_fiber::get_id()
                );
                for round in 0..ROUNDS {
                    this_fiber::sleep_for(Duration::from_millis(10 * (i as u64 % 3 + 1)));
                    *counter.lock() += 1;
                    kdebug!("[fiber {}] round {}", i, round);
                    this_fiber::yield_now();
                }
                kdebug!("[fiber {}] finished", i);
            });
            if let Err(e) = res {
                eprintln!("schedule failed: {}", e);
                return i;
            }
        }
        FIBERS
    });

    match scheduled {
        Ok(n) => println!(
            "{} fibers ran, counter = {} (expected {}), took {:?}",
            n,
            *counter.lock(),
            n * ROUNDS,
            start.elapsed()
        ),
        Err(e) => eprintln!("runtime failed: {}", e),
    }

    println!("\n=== Example Complete ===");
}
