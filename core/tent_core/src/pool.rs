//! Memory reuse primitives
//!
//! - [`Pool`]: slab of records with a free-slot list and an index-based
//!   doubly-linked list threading the live records in insertion order.
//!   Handles stay valid until the record is removed; freed slots are reused
//!   before the backing store grows.
//! - [`ScratchArena`]: bump allocator with mark/restore, reset once per
//!   event loop iteration.

use std::ops::Range;

// ============================================================================
// Pool
// ============================================================================

/// Stable identifier of a record inside a [`Pool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    /// Slot index (used to derive mio tokens)
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Slab allocator with O(1) insert/remove and ordered iteration
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Pool {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Store a value at the back of the list, reusing a freed slot if any
    pub fn insert(&mut self, value: T) -> Handle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Slot {
                    value: Some(value),
                    prev: self.tail,
                    next: None,
                };
                index
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    prev: self.tail,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        Handle(index)
    }

    /// Unlink and return a value; its slot goes back on the free list
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.0)?;
        let value = slot.value.take()?;
        let (prev, next) = (slot.prev.take(), slot.next.take());

        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }

        self.free.push(handle.0);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle.0)?.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(handle.0)?.value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Handle of the live record stored at `index`, if any
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        self.slots
            .get(index)
            .filter(|slot| slot.value.is_some())
            .map(|_| Handle(index))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated (live + free)
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots waiting for reuse
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Snapshot of live handles in list order
    ///
    /// Used by the event loop when records may be removed while iterating.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Iterate live records in insertion order
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            pool: self,
            cursor: self.head,
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered iterator over a [`Pool`]
pub struct Iter<'a, T> {
    pool: &'a Pool<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.pool.slots[index];
        self.cursor = slot.next;
        slot.value.as_ref().map(|value| (Handle(index), value))
    }
}

// ============================================================================
// Scratch Arena
// ============================================================================

/// Saved arena offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

/// Bump allocator over a growable byte region
///
/// Everything allocated after a [`Mark`] is released by [`ScratchArena::restore`].
/// Slices handed out borrow the arena, so none can outlive a restore.
#[derive(Debug)]
pub struct ScratchArena {
    data: Vec<u8>,
    used: usize,
}

impl ScratchArena {
    pub fn with_capacity(capacity: usize) -> Self {
        ScratchArena {
            data: vec![0u8; capacity],
            used: 0,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn mark(&self) -> Mark {
        Mark(self.used)
    }

    /// Release everything allocated since `mark`
    pub fn restore(&mut self, mark: Mark) {
        debug_assert!(mark.0 <= self.used, "restoring a mark from the future");
        self.used = mark.0.min(self.used);
    }

    /// Reserve `size` bytes at an offset aligned to `align` (a power of two)
    ///
    /// The region grows (doubling) when the request does not fit.
    pub fn alloc(&mut self, size: usize, align: usize) -> Range<usize> {
        debug_assert!(align.is_power_of_two());
        let mask = align.max(1) - 1;
        let start = (self.used + mask) & !mask;
        let end = start + size;

        if end > self.data.len() {
            let grown = end.max(self.data.len() * 2);
            self.data.resize(grown, 0);
        }

        self.used = end;
        start..end
    }

    /// Reserve and zero `size` bytes, returning them for writing
    #[cfg(test)]
    pub fn push(&mut self, size: usize, align: usize) -> &mut [u8] {
        let range = self.alloc(size, align);
        let bytes = &mut self.data[range];
        bytes.fill(0);
        bytes
    }

    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    pub fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.data[range]
    }
}
