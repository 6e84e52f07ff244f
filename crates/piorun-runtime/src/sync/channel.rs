//! Bounded MPMC channel for fibers
//!
//! Two semaphores do the flow control: `space` starts at the capacity and
//! gates senders, `full` starts at zero and gates receivers. The buffer
//! itself sits behind a fiber `Mutex`.

use super::mutex::Mutex;
use super::semaphore::Semaphore;
use piorun_core::error::{TryRecvError, TrySendError};
use std::collections::VecDeque;
use std::sync::Arc;

pub struct Channel<T> {
    space: Semaphore,
    full: Semaphore,
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Channel<T> {
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        Self {
            space: Semaphore::new(capacity),
            full: Semaphore::new(0),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Send, suspending while the channel is full.
    pub fn send(&self, value: T) {
        self.space.wait();
        self.queue.lock().push_back(value);
        self.full.signal();
    }

    /// Receive, suspending while the channel is empty.
    pub fn recv(&self) -> T {
        self.full.wait();
        let value = self
            .queue
            .lock()
            .pop_front()
            .expect("channel permit granted without a buffered value");
        self.space.signal();
        value
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if !self.space.try_wait() {
            return Err(TrySendError(value));
        }
        self.queue.lock().push_back(value);
        self.full.signal();
        Ok(())
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if !self.full.try_wait() {
            return Err(TryRecvError);
        }
        let value = self
            .queue
            .lock()
            .pop_front()
            .expect("channel permit granted without a buffered value");
        self.space.signal();
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Create a bounded channel holding up to `capacity` values.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Channel::new(capacity));
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

/// Sending half of a channel
pub struct Sender<T> {
    inner: Arc<Channel<T>>,
}

/// Receiving half of a channel
pub struct Receiver<T> {
    inner: Arc<Channel<T>>,
}

impl<T> Sender<T> {
    pub fn send(&self, value: T) {
        self.inner.send(value);
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(value)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> T {
        self.inner.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.inner.try_recv()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run_until_idle, spawn_local};
    use crate::scheduler::Scheduler;
    use crate::config::RuntimeConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_try_variants_respect_capacity() {
        let (tx, rx) = channel(2);
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert_eq!(tx.try_send(3), Err(TrySendError(3)));
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError));
        assert!(rx.is_empty());
        assert_eq!(tx.capacity(), 2);
    }

    #[test]
    fn test_sender_blocks_until_receiver_drains() {
        let (tx, rx) = channel(1);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        spawn_local(move || {
            for i in 0..3 {
                tx.send(i);
                l.borrow_mut().push(format!("sent {}", i));
            }
        });
        let l = log.clone();
        spawn_local(move || {
            for _ in 0..3 {
                let v = rx.recv();
                l.borrow_mut().push(format!("got {}", v));
            }
        });
        run_until_idle();

        let log = log.borrow();
        // Backpressure: never two sends without a receive in between
        let sent = |i: usize| log.iter().position(|e| *e == format!("sent {}", i)).unwrap();
        let got = |i: usize| log.iter().position(|e| *e == format!("got {}", i)).unwrap();
        assert!(got(0) < sent(1));
        assert!(got(1) < sent(2));
        assert_eq!(log.len(), 6);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn test_zero_capacity_rejected() {
        let _ = channel::<u8>(0);
    }

    #[test]
    fn test_producers_and_consumers_across_workers() {
        let mut sched = Scheduler::start(RuntimeConfig::new().num_workers(2)).unwrap();
        let (tx, rx) = channel::<u64>(4);
        let sum = std::sync::Arc::new(AtomicU64::new(0));

        for p in 0..2u64 {
            let tx = tx.clone();
            sched
                .schedule(move || {
                    for i in 0..100 {
                        tx.send(p * 1000 + i);
                    }
                })
                .unwrap();
        }
        for _ in 0..2 {
            let rx = rx.clone();
            let sum = sum.clone();
            sched
                .schedule(move || {
                    for _ in 0..100 {
                        sum.fetch_add(rx.recv(), Ordering::SeqCst);
                    }
                })
                .unwrap();
        }
        sched.shutdown().unwrap();

        let expected: u64 = (0..100).sum::<u64>() * 2 + 1000 * 100;
        assert_eq!(sum.load(Ordering::SeqCst), expected);
        assert!(rx.is_empty());
    }
}
