//! Arena storage and bounded object pools.
//!
//! Two pieces live here, both grounded in the free-list `Slab` this crate's
//! predecessor used to store `Evented` registrations: [`Slab`], a growable
//! arena that hands out small integer handles and threads a free list
//! through its own unused slots, and [`Pool`], a bounded stack of reusable
//! objects (packets, mostly) that avoids allocator traffic on the hot path
//! per spec §4.5 and the bounded-pool redesign note in spec §9.

use std::fmt;

const UNUSED: usize = usize::MAX;

struct Entry<T> {
    /// `Some` while occupied. `None` entries link to the next free slot via
    /// `next`, mirroring the historical `Slab`'s `Entry::nxt`.
    val: Option<T>,
    next: usize,
}

/// A `Vec`-backed arena indexed by small `usize` handles, with O(1)
/// insert/remove and slot reuse.
///
/// Connections live in a `Slab<Connection>` per [`IoThread`](crate::io_thread::IoThread);
/// this is the "arena-allocated connection records identified by small
/// handles" redesign spec §9 asks for in place of intrusive per-connection
/// linkage pointers.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    len: usize,
    next_free: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Slab {
            entries: Vec::new(),
            len: 0,
            next_free: UNUSED,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Slab {
            entries: Vec::with_capacity(cap),
            len: 0,
            next_free: UNUSED,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx).and_then(|e| e.val.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx).and_then(|e| e.val.as_mut())
    }

    /// Inserts `val`, reusing a freed slot when one is available.
    pub fn insert(&mut self, val: T) -> usize {
        self.len += 1;
        if self.next_free == UNUSED {
            self.entries.push(Entry {
                val: Some(val),
                next: UNUSED,
            });
            self.entries.len() - 1
        } else {
            let idx = self.next_free;
            let entry = &mut self.entries[idx];
            self.next_free = entry.next;
            entry.val = Some(val);
            entry.next = UNUSED;
            idx
        }
    }

    /// Removes and returns the value at `idx`, threading the slot onto the
    /// free list. Returns `None` if `idx` was already vacant or out of
    /// range — callers that double-remove a handle get a clean `None`
    /// rather than a panic.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let entry = self.entries.get_mut(idx)?;
        let val = entry.val.take()?;
        entry.next = self.next_free;
        self.next_free = idx;
        self.len -= 1;
        Some(val)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.val.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.val.as_mut().map(|v| (i, v)))
    }
}

impl<T> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("len", &self.len)
            .field("capacity", &self.entries.capacity())
            .finish()
    }
}

/// A bounded stack of reusable objects.
///
/// `acquire` pops a cached instance if one exists, else calls `Default`.
/// `release` pushes back up to `cap` instances and silently drops the rest
/// — a pathological burst of connections/packets shrinks the pool back
/// down over time instead of retaining memory forever, per spec §9.
pub struct Pool<T> {
    free: Vec<T>,
    cap: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Pool {
            free: Vec::new(),
            cap,
        }
    }

    pub fn acquire(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    pub fn release(&mut self, val: T) {
        if self.free.len() < self.cap {
            self.free.push(val);
        }
    }

    #[inline]
    pub fn cached(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_reuses_slot() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);

        slab.remove(a).unwrap();
        assert_eq!(slab.len(), 1);

        let c = slab.insert("c");
        // the freed slot for `a` is reused rather than growing the vec.
        assert_eq!(c, a);
        assert_eq!(*slab.get(b).unwrap(), "b");
        assert_eq!(*slab.get(c).unwrap(), "c");
    }

    #[test]
    fn double_remove_is_none_not_panic() {
        let mut slab: Slab<u8> = Slab::new();
        let a = slab.insert(1);
        assert!(slab.remove(a).is_some());
        assert!(slab.remove(a).is_none());
    }

    #[test]
    fn pool_acquire_is_zeroed_after_release() {
        let mut pool: Pool<Vec<u8>> = Pool::new(4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        buf.clear();
        pool.release(buf);

        let reused = pool.acquire();
        assert!(reused.is_empty());
    }

    #[test]
    fn pool_caps_retained_objects() {
        let mut pool: Pool<Vec<u8>> = Pool::new(1);
        pool.release(Vec::new());
        pool.release(Vec::new());
        assert_eq!(pool.cached(), 1);
    }
}
