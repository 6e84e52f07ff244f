//! Millisecond timer wheel
//!
//! A ring of `size` lists, one per millisecond. The wheel remembers the
//! time of its last query (`start_ms`) and the slot that time maps to
//! (`start_idx`); an item due at `t` sits in slot
//! `(start_idx + (t - start_ms)) % size`. Draining walks forward from the
//! last query, never back.
//!
//! Deadlines further out than one rotation are still accepted: they land
//! in a nearer slot with `overflowed` set and the event loop puts them
//! back when they surface early.

use super::slab::{ItemKey, LinkId, TimeoutSlab};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTimeoutError {
    /// `now` is earlier than the wheel's last query
    ClockRewound { now: u64, start: u64 },
    /// The item's deadline is already behind `now`; fire it directly
    AlreadyExpired { expire: u64, now: u64 },
    /// Key does not name a live item
    UnknownItem,
}

impl fmt::Display for AddTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddTimeoutError::ClockRewound { now, start } => {
                write!(f, "clock at {}ms is behind wheel start {}ms", now, start)
            }
            AddTimeoutError::AlreadyExpired { expire, now } => {
                write!(f, "deadline {}ms already passed at {}ms", expire, now)
            }
            AddTimeoutError::UnknownItem => write!(f, "unknown timeout item"),
        }
    }
}

impl std::error::Error for AddTimeoutError {}

pub struct TimerWheel {
    slots: Vec<LinkId>,
    start_ms: u64,
    start_idx: u64,
    started: bool,
}

impl TimerWheel {
    /// Allocate `size` slot lists inside `slab`.
    pub fn new<T>(slab: &mut TimeoutSlab<T>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| slab.new_link()).collect(),
            start_ms: 0,
            start_idx: 0,
            started: false,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Time of the last query, once the wheel has been used.
    #[inline]
    pub fn start_ms(&self) -> Option<u64> {
        self.started.then_some(self.start_ms)
    }

    fn pin(&mut self, now: u64) {
        if !self.started {
            self.started = true;
            self.start_ms = now;
            self.start_idx = 0;
        }
    }

    /// File `key` under its deadline.
    pub fn add_timeout<T>(
        &mut self,
        slab: &mut TimeoutSlab<T>,
        key: ItemKey,
        now: u64,
    ) -> Result<(), AddTimeoutError> {
        self.pin(now);

        if now < self.start_ms {
            return Err(AddTimeoutError::ClockRewound {
                now,
                start: self.start_ms,
            });
        }

        let size = self.slots.len() as u64;
        let item = slab.get_mut(key).ok_or(AddTimeoutError::UnknownItem)?;
        if item.expire_ms < now {
            return Err(AddTimeoutError::AlreadyExpired {
                expire: item.expire_ms,
                now,
            });
        }

        let diff = item.expire_ms - self.start_ms;
        item.overflowed = diff >= size;

        let slot = ((self.start_idx % size) + (diff % size)) % size;
        slab.unlink(key);
        slab.push_back(self.slots[slot as usize], key);
        Ok(())
    }

    /// Move every item due by `now` onto `out`.
    pub fn take_all_timeout<T>(&mut self, slab: &mut TimeoutSlab<T>, now: u64, out: LinkId) {
        self.pin(now);

        if now < self.start_ms {
            return;
        }

        let size = self.slots.len() as u64;
        let cnt = (now - self.start_ms + 1).min(size);

        for i in 0..cnt {
            let idx = (self.start_idx + i) % size;
            slab.join(out, self.slots[idx as usize]);
        }

        self.start_ms = now;
        self.start_idx = (self.start_idx + cnt - 1) % size;
    }

    /// Items currently filed in the wheel.
    pub fn pending<T>(&self, slab: &TimeoutSlab<T>) -> usize {
        self.slots.iter().map(|&slot| slab.link_len(slot)).sum()
    }
}
