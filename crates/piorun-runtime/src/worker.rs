//! Worker thread management
//!
//! Workers are named OS threads, each running its own event loop over its
//! own thread environment. The pool only spawns and joins them; what a
//! worker does is up to the closure handed to `start`.

use piorun_core::error::{SchedResult, WorkerError};
use piorun_core::{kdebug, kerror};
use std::thread::{self, JoinHandle};

/// Pool of worker threads
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    num_workers: usize,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        Self {
            handles: Vec::with_capacity(num_workers),
            num_workers,
        }
    }

    /// Spawn `num_workers` threads running `worker_fn(index)`.
    ///
    /// On a failed spawn the threads already started keep running; the
    /// caller is expected to stop and `join` them.
    pub fn start<F>(&mut self, worker_fn: F) -> SchedResult<()>
    where
        F: Fn(usize) + Send + Sync + Clone + 'static,
    {
        for i in self.handles.len()..self.num_workers {
            let worker_fn = worker_fn.clone();
            let handle = thread::Builder::new()
                .name(format!("piorun-worker-{}", i))
                .spawn(move || worker_fn(i))
                .map_err(|e| {
                    kerror!("failed to spawn worker {}: {}", i, e);
                    WorkerError::SpawnFailed
                })?;
            self.handles.push(handle);
        }
        kdebug!("spawned {} workers", self.handles.len());
        Ok(())
    }

    /// Wait for every started worker to exit.
    ///
    /// Returns the number of workers that panicked.
    pub fn join(&mut self) -> usize {
        let mut panicked = 0;
        for (i, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                kerror!("worker {} panicked", i);
                panicked += 1;
            }
        }
        panicked
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers started and not yet joined
    #[inline]
    pub fn running(&self) -> usize {
        self.handles.len()
    }
}
