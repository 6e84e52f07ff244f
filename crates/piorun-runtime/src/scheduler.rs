//! Pool scheduler
//!
//! `num_workers` threads, each driving its own event loop. Work enters
//! through two doors:
//!
//! - from one of this scheduler's own workers, `schedule` appends to that
//!   worker's local queue (no cross-thread traffic);
//! - from anywhere else it goes to the shared `SegQueue`, which workers
//!   drain in batches of `task_batch` at the start of each tick.
//!
//! Shutdown is by quiescence: once the flag is up a worker keeps ticking
//! until the shared queue is empty and its own environment is idle, then
//! exits. Fibers parked on I/O or sleeps therefore finish first.

use crate::config::{self, ConfigError, RuntimeConfig};
use crate::env::{
    configure_thread, set_worker_binding, worker_binding, EnvStats, Environment, Task,
};
use crate::event_loop;
use crate::worker::WorkerPool;
use crossbeam_queue::SegQueue;
use piorun_core::constants::MAX_WORKERS;
use piorun_core::error::{SchedError, SchedResult, WorkerError};
use piorun_core::{kdebug, kerror, kinfo, kwarn, SpinLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduler used by the free `schedule` function.
static GLOBAL: SpinLock<Option<SchedulerHandle>> = SpinLock::new(None);

struct Shared {
    id: u64,
    config: Arc<RuntimeConfig>,
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    /// Submitters between their shutdown check and their push
    submitting: AtomicUsize,
    completed: Arc<AtomicU64>,
    workers: Vec<OnceLock<Arc<EnvStats>>>,
}

impl Shared {
    fn submit(&self, task: Task) -> SchedResult<()> {
        if let Some((sched, _)) = worker_binding() {
            if sched == self.id {
                Environment::current().push_local(task);
                return Ok(());
            }
        }

        self.submitting.fetch_add(1, Ordering::SeqCst);
        let result = if self.shutdown.load(Ordering::SeqCst) {
            Err(SchedError::NotInitialized)
        } else {
            self.queue.push(task);
            Ok(())
        };
        self.submitting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn wrap<F>(&self, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let completed = self.completed.clone();
        Box::new(move || {
            f();
            completed.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn quiescent(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
            && self.submitting.load(Ordering::SeqCst) == 0
            && self.queue.is_empty()
    }
}

fn worker_main(shared: Arc<Shared>, index: usize) {
    set_worker_binding(Some((shared.id, index)));
    configure_thread(shared.config.clone());
    let env = Environment::current();
    let _ = shared.workers[index].set(env.stats().clone());
    kdebug!("worker {} started", index);

    loop {
        event_loop::run_once(env, Some(&shared.queue));
        if shared.quiescent() && env.is_idle() {
            break;
        }
    }

    kdebug!(
        "worker {} stopped after {} tasks",
        index,
        env.stats().tasks_run()
    );
    set_worker_binding(None);
}

/// A running pool of worker threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    pool: WorkerPool,
    stopped: bool,
}

impl Scheduler {
    /// Validate `config` and spawn the workers.
    ///
    /// Every worker environment is built from `config`. It also becomes
    /// the process-wide config if none was installed yet.
    pub fn start(config: RuntimeConfig) -> SchedResult<Scheduler> {
        if let Err(e) = config.validate() {
            kerror!("invalid runtime config: {}", e);
            return Err(SchedError::InvalidState);
        }
        let num_workers = config.num_workers.clamp(1, MAX_WORKERS);
        config.apply_log_level();
        match config::install(config.clone()) {
            Ok(()) => {}
            Err(ConfigError::AlreadyInstalled) => {
                if *config::current() != config {
                    kdebug!("process config already installed; workers use their own");
                }
            }
            Err(e) => {
                kerror!("invalid runtime config: {}", e);
                return Err(SchedError::InvalidState);
            }
        }

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config: Arc::new(config),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            workers: (0..num_workers).map(|_| OnceLock::new()).collect(),
        });

        let mut scheduler = Scheduler {
            shared: shared.clone(),
            pool: WorkerPool::new(num_workers),
            stopped: false,
        };
        if let Err(e) = scheduler.pool.start(move |i| worker_main(shared.clone(), i)) {
            let _ = scheduler.shutdown();
            return Err(e);
        }

        kinfo!(
            "scheduler {} started with {} workers",
            scheduler.shared.id,
            num_workers
        );
        Ok(scheduler)
    }

    /// Run `f` on a pool fiber of some worker.
    pub fn schedule<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(self.shared.wrap(f))
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// Started-but-unfinished fibers across all workers.
    pub fn live_fibers(&self) -> usize {
        self.shared
            .workers
            .iter()
            .filter_map(|w| w.get())
            .map(|s| s.live_fibers())
            .sum()
    }

    /// Tasks submitted through this scheduler or a handle whose closure
    /// returned normally. Work a worker schedules onto itself is not counted.
    pub fn tasks_completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Tasks still waiting in the shared queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Make this scheduler the target of the free `schedule` function.
    pub fn install_global(&self) -> SchedResult<()> {
        let mut global = GLOBAL.lock();
        if global.is_some() {
            return Err(SchedError::AlreadyInitialized);
        }
        *global = Some(self.handle());
        Ok(())
    }

    /// Stop accepting outside work, let workers drain, and join them.
    pub fn shutdown(&mut self) -> SchedResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        {
            let mut global = GLOBAL.lock();
            if global.as_ref().is_some_and(|h| h.shared.id == self.shared.id) {
                *global = None;
            }
        }

        kinfo!("scheduler {} shutting down", self.shared.id);
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let panicked = self.pool.join();
        if panicked > 0 {
            kerror!("{} workers panicked", panicked);
            return Err(WorkerError::Panicked.into());
        }
        kdebug!(
            "scheduler {} stopped, {} tasks completed",
            self.shared.id,
            self.tasks_completed()
        );
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kwarn!("scheduler shutdown: {}", e);
        }
    }
}

/// Cloneable, `Send` submission handle to a `Scheduler`.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Same as `Scheduler::schedule`; fails once the scheduler shut down.
    pub fn schedule<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(self.shared.wrap(f))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

/// Run `f` on the current worker, or on the globally installed scheduler
/// when called from any other thread.
pub fn schedule<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    if worker_binding().is_some() {
        Environment::current().push_local(Box::new(f));
        return Ok(());
    }
    let handle = GLOBAL.lock().as_ref().cloned();
    match handle {
        Some(handle) => handle.schedule(f),
        None => Err(SchedError::NotInitialized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::this_fiber;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(workers: usize) -> RuntimeConfig {
        RuntimeConfig::new().num_workers(workers)
    }

    #[test]
    fn test_two_workers_run_each_task_once() {
        let mut sched = Scheduler::start(config(2)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let hits = hits.clone();
            sched
                .schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched.shutdown().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1000);
        assert_eq!(sched.tasks_completed(), 1000);
        assert_eq!(sched.live_fibers(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_sleeping_fibers() {
        let mut sched = Scheduler::start(config(2)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            sched
                .schedule(move || {
                    this_fiber::sleep_for(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched.shutdown().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_worker_schedule_stays_local() {
        let mut sched = Scheduler::start(config(3)).unwrap();
        let handle = sched.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sched
            .schedule(move || {
                let parent = this_fiber::get_thread_id();
                let s2 = s.clone();
                handle
                    .schedule(move || {
                        s2.lock().unwrap().push((parent, this_fiber::get_thread_id()));
                    })
                    .unwrap();
            })
            .unwrap();
        sched.shutdown().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (parent, child) = seen[0];
        assert!(parent.is_some());
        assert_eq!(parent, child);
    }

    #[test]
    fn test_schedule_after_shutdown_is_rejected() {
        let mut sched = Scheduler::start(config(1)).unwrap();
        let handle = sched.handle();
        sched.shutdown().unwrap();
        assert!(handle.is_shutdown());
        assert_eq!(handle.schedule(|| {}), Err(SchedError::NotInitialized));
        // Second shutdown is a no-op
        assert!(sched.shutdown().is_ok());
    }

    #[test]
    fn test_workers_use_scheduler_config() {
        // Freeze the process-wide config first
        let process = Environment::current().config().clone();
        let mut sched = Scheduler::start(
            config(1)
                .hook_by_default(!process.hook_by_default)
                .pool_batch(process.pool_batch + 1),
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        sched
            .schedule(move || {
                let batch = Environment::current().config().pool_batch;
                *s.lock().unwrap() = Some((this_fiber::is_hook_enabled(), batch));
            })
            .unwrap();
        sched.shutdown().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            Some((!process.hook_by_default, process.pool_batch + 1))
        );
    }

    #[test]
    fn test_worker_panic_in_fiber_is_contained() {
        let mut sched = Scheduler::start(config(1)).unwrap();
        sched.schedule(|| panic!("task failure")).unwrap();
        let ok = Arc::new(AtomicBool::new(false));
        let o = ok.clone();
        sched.schedule(move || o.store(true, Ordering::SeqCst)).unwrap();
        sched.shutdown().unwrap();
        assert!(ok.load(Ordering::SeqCst));
        assert_eq!(sched.tasks_completed(), 1);
    }
}
