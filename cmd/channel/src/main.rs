//! Channel communication example
//!
//! Producers and consumers on different workers share one bounded
//! channel. A full channel suspends the producers until a consumer
//! catches up.

use piorun::sync::channel;
use piorun::{kinfo, schedule, this_fiber, Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PRODUCERS: u64 = 3;
const ITEMS: u64 = 20;
const CAPACITY: usize = 4;

fn main() {
    println!("=== piorun Channel Example ===\n");

    let config = RuntimeConfig::default().num_workers(2);
    let mut runtime = Runtime::new(config);
    let total = Arc::new(AtomicU64::new(0));

    let result = runtime.block_on(|| -> piorun::SchedResult<()> {
        let (tx, rx) = channel::<u64>(CAPACITY);
        println!("Created channel with capacity {}\n", CAPACITY);

        for p in 0..PRODUCERS {
            let tx = tx.clone();
            schedule(move || {
                for i in 0..ITEMS {
                    tx.send(p * 100 + i);
                }
                kinfo!("[producer {}] done", p);
            })?;
        }

        let total = total.clone();
        schedule(move || {
            for n in 0..PRODUCERS * ITEMS {
                let v = rx.recv();
                total.fetch_add(v, Ordering::Relaxed);
                if n % 10 == 0 {
                    // Slow consumer to exercise backpressure
                    this_fiber::sleep_for(Duration::from_millis(5));
                }
            }
            println!("[consumer] received {} values", PRODUCERS * ITEMS);
        })?;
        Ok(())
    });

    match result {
        Ok(Ok(())) => {
            let expected: u64 = (0..PRODUCERS)
                .map(|p| (0..ITEMS).map(|i| p * 100 + i).sum::<u64>())
                .sum();
            println!(
                "sum = {} (expected {})",
                total.load(Ordering::Relaxed),
                expected
            );
        }
        Ok(Err(e)) | Err(e) => eprintln!("channel example failed: {}", e),
    }

    println!("\n=== Example Complete ===");
}
