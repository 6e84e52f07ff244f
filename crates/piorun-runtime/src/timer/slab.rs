//! Arena of timeout items threaded onto index-linked lists
//!
//! Every item lives in one slot of a `TimeoutSlab` and is addressed by an
//! `ItemKey` (slot index + generation). Lists are identified by `LinkId`;
//! their head/tail live in the slab too, so an item can always be
//! unlinked from whichever list currently owns it without any pointer
//! aliasing.
//!
//! An item records its owner as a label rather than a list. Each list
//! has one current label; `join` points the source's label at the
//! destination's and hands the source a fresh one, so a splice never
//! touches the items it moves. Resolving an owner walks that chain, which
//! is as long as the number of onward splices the item went through.
//! Labels are reference counted and recycled.

use piorun_core::constants::NONE_U32;

/// Handle to an item in a `TimeoutSlab`.
///
/// The generation makes a key for a removed (and possibly reused) slot
/// compare unequal to the new occupant, so late epoll events for a
/// finished wait are ignored instead of poking a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemKey {
    index: u32,
    generation: u32,
}

impl ItemKey {
    /// Pack into the 64-bit user data of an epoll event.
    #[inline]
    pub fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub fn from_u64(raw: u64) -> Self {
        ItemKey {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// Identifies one list inside a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u32);

/// A deadline-bearing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutItem<T> {
    /// Absolute expiry on the runtime clock, in milliseconds
    pub expire_ms: u64,
    /// Deadline lies more than one wheel rotation past insertion
    pub overflowed: bool,
    /// Set when the wheel hands the item out as expired
    pub timed_out: bool,
    pub payload: T,
}

impl<T> TimeoutItem<T> {
    pub fn new(expire_ms: u64, payload: T) -> Self {
        Self {
            expire_ms,
            overflowed: false,
            timed_out: false,
            payload,
        }
    }
}

struct Node<T> {
    item: Option<TimeoutItem<T>>,
    generation: u32,
    prev: u32,
    next: u32,
    /// Label of the owning list, `NONE_U32` when unlinked
    owner: u32,
}

#[derive(Clone, Copy)]
struct Link {
    head: u32,
    tail: u32,
    len: u32,
    label: u32,
}

/// A root label names a list; any other label forwards to its parent.
struct Label {
    parent: u32,
    link: u32,
    /// Items, child labels and the list currently using it
    refs: u32,
}

pub struct TimeoutSlab<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    links: Vec<Link>,
    labels: Vec<Label>,
    free_labels: Vec<u32>,
    live: usize,
}

impl<T> Default for TimeoutSlab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeoutSlab<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            links: Vec::new(),
            labels: Vec::new(),
            free_labels: Vec::new(),
            live: 0,
        }
    }

    /// Number of live items
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `item` unlinked and return its key.
    pub fn insert(&mut self, item: TimeoutItem<T>) -> ItemKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let node = &mut self.nodes[index as usize];
            node.item = Some(item);
            node.prev = NONE_U32;
            node.next = NONE_U32;
            node.owner = NONE_U32;
            return ItemKey {
                index,
                generation: node.generation,
            };
        }
        let index = self.nodes.len() as u32;
        self.nodes.push(Node {
            item: Some(item),
            generation: 0,
            prev: NONE_U32,
            next: NONE_U32,
            owner: NONE_U32,
        });
        ItemKey {
            index,
            generation: 0,
        }
    }

    /// Unlink (if needed) and take the item out. Stale keys yield `None`.
    pub fn remove(&mut self, key: ItemKey) -> Option<TimeoutItem<T>> {
        self.check(key)?;
        self.unlink(key);
        let node = &mut self.nodes[key.index as usize];
        let item = node.item.take();
        node.generation = node.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        item
    }

    #[inline]
    pub fn contains(&self, key: ItemKey) -> bool {
        self.check(key).is_some()
    }

    #[inline]
    pub fn get(&self, key: ItemKey) -> Option<&TimeoutItem<T>> {
        self.check(key)?;
        self.nodes[key.index as usize].item.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, key: ItemKey) -> Option<&mut TimeoutItem<T>> {
        self.check(key)?;
        self.nodes[key.index as usize].item.as_mut()
    }

    /// Allocate a new empty list.
    pub fn new_link(&mut self) -> LinkId {
        let id = self.links.len() as u32;
        let label = self.new_label(id);
        self.links.push(Link {
            head: NONE_U32,
            tail: NONE_U32,
            len: 0,
            label,
        });
        LinkId(id)
    }

    #[inline]
    pub fn link_len(&self, link: LinkId) -> usize {
        self.links[link.0 as usize].len as usize
    }

    #[inline]
    pub fn link_is_empty(&self, link: LinkId) -> bool {
        self.links[link.0 as usize].head == NONE_U32
    }

    /// The list currently holding `key`, if any.
    pub fn owner(&self, key: ItemKey) -> Option<LinkId> {
        self.check(key)?;
        match self.nodes[key.index as usize].owner {
            NONE_U32 => None,
            label => Some(LinkId(self.resolve(label))),
        }
    }

    /// Append `key` to `link`. An item already on some list is left where
    /// it is and `false` is returned.
    pub fn push_back(&mut self, link: LinkId, key: ItemKey) -> bool {
        if self.check(key).is_none() || self.nodes[key.index as usize].owner != NONE_U32 {
            return false;
        }
        let Link { tail, label, .. } = self.links[link.0 as usize];
        self.labels[label as usize].refs += 1;
        {
            let node = &mut self.nodes[key.index as usize];
            node.prev = tail;
            node.next = NONE_U32;
            node.owner = label;
        }
        if tail == NONE_U32 {
            self.links[link.0 as usize].head = key.index;
        } else {
            self.nodes[tail as usize].next = key.index;
        }
        let l = &mut self.links[link.0 as usize];
        l.tail = key.index;
        l.len += 1;
        true
    }

    /// Detach and return the first item of `link`.
    pub fn pop_front(&mut self, link: LinkId) -> Option<ItemKey> {
        let head = self.links[link.0 as usize].head;
        if head == NONE_U32 {
            return None;
        }
        let key = ItemKey {
            index: head,
            generation: self.nodes[head as usize].generation,
        };
        self.unlink(key);
        Some(key)
    }

    /// Remove `key` from whatever list holds it. Returns whether it was linked.
    pub fn unlink(&mut self, key: ItemKey) -> bool {
        if self.check(key).is_none() {
            return false;
        }
        let (prev, next, label) = {
            let node = &self.nodes[key.index as usize];
            (node.prev, node.next, node.owner)
        };
        if label == NONE_U32 {
            return false;
        }
        let owner = self.resolve(label);

        if prev == NONE_U32 {
            self.links[owner as usize].head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NONE_U32 {
            self.links[owner as usize].tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
        self.links[owner as usize].len -= 1;

        let node = &mut self.nodes[key.index as usize];
        node.prev = NONE_U32;
        node.next = NONE_U32;
        node.owner = NONE_U32;
        self.release_label(label);
        true
    }

    /// Splice every item of `src` onto the end of `dst`, leaving `src` empty.
    pub fn join(&mut self, dst: LinkId, src: LinkId) {
        if dst == src {
            return;
        }
        let s = self.links[src.0 as usize];
        if s.head == NONE_U32 {
            return;
        }

        // The items keep their labels; forward the source label instead
        let target = self.links[dst.0 as usize].label;
        {
            let old = &mut self.labels[s.label as usize];
            old.parent = target;
            old.link = NONE_U32;
            // Loses the list, gains nothing: still held by the moved items
            old.refs -= 1;
        }
        self.labels[target as usize].refs += 1;
        let fresh = self.new_label(src.0);

        let d_tail = self.links[dst.0 as usize].tail;
        if d_tail == NONE_U32 {
            self.links[dst.0 as usize].head = s.head;
        } else {
            self.nodes[d_tail as usize].next = s.head;
            self.nodes[s.head as usize].prev = d_tail;
        }
        let d = &mut self.links[dst.0 as usize];
        d.tail = s.tail;
        d.len += s.len;
        self.links[src.0 as usize] = Link {
            head: NONE_U32,
            tail: NONE_U32,
            len: 0,
            label: fresh,
        };
    }

    /// Keys of `link` in list order.
    pub fn iter(&self, link: LinkId) -> LinkIter<'_, T> {
        LinkIter {
            slab: self,
            cur: self.links[link.0 as usize].head,
        }
    }

    fn new_label(&mut self, link: u32) -> u32 {
        let label = Label {
            parent: NONE_U32,
            link,
            refs: 1,
        };
        match self.free_labels.pop() {
            Some(index) => {
                self.labels[index as usize] = label;
                index
            }
            None => {
                self.labels.push(label);
                (self.labels.len() - 1) as u32
            }
        }
    }

    /// List named by the root of `label`'s forwarding chain.
    fn resolve(&self, mut label: u32) -> u32 {
        loop {
            let l = &self.labels[label as usize];
            if l.parent == NONE_U32 {
                return l.link;
            }
            label = l.parent;
        }
    }

    /// Drop one reference, recycling labels that nothing points at.
    fn release_label(&mut self, mut label: u32) {
        loop {
            let l = &mut self.labels[label as usize];
            l.refs -= 1;
            if l.refs > 0 {
                return;
            }
            let parent = l.parent;
            self.free_labels.push(label);
            if parent == NONE_U32 {
                return;
            }
            label = parent;
        }
    }

    fn check(&self, key: ItemKey) -> Option<()> {
        let node = self.nodes.get(key.index as usize)?;
        (node.generation == key.generation && node.item.is_some()).then_some(())
    }
}

pub struct LinkIter<'a, T> {
    slab: &'a TimeoutSlab<T>,
    cur: u32,
}

impl<T> Iterator for LinkIter<'_, T> {
    type Item = ItemKey;

    fn next(&mut self) -> Option<ItemKey> {
        if self.cur == NONE_U32 {
            return None;
        }
        let node = &self.slab.nodes[self.cur as usize];
        let key = ItemKey {
            index: self.cur,
            generation: node.generation,
        };
        self.cur = node.next;
        Some(key)
    }
}
