//! Opaque managed-object references and the slot storage behind loader
//! handles.
//!
//! The runtime embedding this crate owns the managed heap; a reference is
//! treated here as an opaque machine word that is never dereferenced.

use std::fmt;

use atomic::Atomic;
use parking_lot::Mutex;

/// An opaque reference to a managed object. Null is a valid value and
/// means "no object".
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectRef(*mut u8);

impl ObjectRef {
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn from_ptr(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

// The word is opaque; it is never dereferenced by this crate.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

/// A fixed-length array of managed-reference slots. Handle-table instances
/// are immutable in length after publication; growth replaces the whole
/// array.
pub struct ObjectArray {
    slots: Box<[Atomic<ObjectRef>]>,
}

impl ObjectArray {
    pub fn new(len: usize) -> Box<Self> {
        let slots = (0..len)
            .map(|_| Atomic::new(ObjectRef::null()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> ObjectRef {
        self.slots[index].load(atomic::Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set(&self, index: usize, value: ObjectRef) {
        self.slots[index].store(value, atomic::Ordering::Relaxed);
    }

    pub fn compare_exchange(&self, index: usize, compare: ObjectRef, value: ObjectRef) -> ObjectRef {
        match self.slots[index].compare_exchange(
            compare,
            value,
            atomic::Ordering::SeqCst,
            atomic::Ordering::SeqCst,
        ) {
            Ok(previous) => previous,
            Err(previous) => previous,
        }
    }
}

const PINNED_CHUNK_SLOTS: usize = 64;

/// Pool of pinned reference slots for the non-collectible handle encoding.
/// Slots are allocated one at a time, never freed, and their addresses are
/// stable for the life of the domain.
pub struct PinnedSlotPool {
    chunks: Mutex<PinnedChunks>,
}

struct PinnedChunks {
    chunks: Vec<Box<[Atomic<ObjectRef>]>>,
    used_in_last: usize,
}

impl PinnedSlotPool {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(PinnedChunks {
                chunks: Vec::new(),
                used_in_last: PINNED_CHUNK_SLOTS,
            }),
        }
    }

    /// Returns a stable pointer to a fresh null slot.
    pub fn allocate(&self) -> *const Atomic<ObjectRef> {
        let mut inner = self.chunks.lock();
        if inner.used_in_last == PINNED_CHUNK_SLOTS {
            let chunk = (0..PINNED_CHUNK_SLOTS)
                .map(|_| Atomic::new(ObjectRef::null()))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            inner.chunks.push(chunk);
            inner.used_in_last = 0;
        }
        let chunk = inner.chunks.last().unwrap();
        let slot = &chunk[inner.used_in_last] as *const Atomic<ObjectRef>;
        inner.used_in_last += 1;
        slot
    }
}

impl Default for PinnedSlotPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_slots_are_stable_and_distinct() {
        let pool = PinnedSlotPool::new();
        let mut seen = Vec::new();
        for _ in 0..3 * PINNED_CHUNK_SLOTS {
            let slot = pool.allocate();
            assert!(!seen.contains(&slot));
            seen.push(slot);
        }
        let first = seen[0];
        unsafe {
            (*first).store(ObjectRef::from_ptr(0x40 as *mut u8), atomic::Ordering::Relaxed);
            assert_eq!(
                (*first).load(atomic::Ordering::Relaxed),
                ObjectRef::from_ptr(0x40 as *mut u8)
            );
        }
    }
}
