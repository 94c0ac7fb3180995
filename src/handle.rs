//! Loader handles: opaque word tokens binding native structures to
//! managed objects.
//!
//! Two encodings share the low tag bit. A set bit means the rest is a
//! pointer to a pinned slot outside any handle table (non-collectible
//! allocators only); a clear bit means the rest, shifted down and minus
//! one, indexes the owning allocator's handle table.

use atomic::Atomic;
use modular_bitfield::prelude::*;

use crate::{
    error::{Error, Result},
    loader_allocator::LoaderAllocator,
    object::{ObjectArray, ObjectRef},
};

/// Fixed ceiling on handle-table slots; reaching it is an out-of-memory
/// condition.
pub const MAX_LOADER_HANDLES: u32 = 1 << 30;

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct HandleWord {
    pinned: bool,
    payload: B63,
}

impl HandleWord {
    fn to_bits(self) -> u64 {
        u64::from_ne_bytes(self.into_bytes())
    }

    fn from_bits(bits: u64) -> Self {
        Self::from_bytes(bits.to_ne_bytes())
    }
}

/// An opaque handle token. The null token is distinguished and means "no
/// allocation was attempted"; a null token returned from
/// [`LoaderAllocator::allocate_handle`] means the managed allocator was
/// already collected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LoaderHandle(u64);

impl LoaderHandle {
    pub const fn null() -> Self {
        Self(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_index(index: u32) -> Self {
        let word = HandleWord::new()
            .with_pinned(false)
            .with_payload(u64::from(index) + 1);
        Self(word.to_bits())
    }

    pub(crate) fn from_pinned(slot: *const Atomic<ObjectRef>) -> Self {
        debug_assert!(slot as usize & 1 == 0);
        let word = HandleWord::new()
            .with_pinned(true)
            .with_payload(slot as u64 >> 1);
        Self(word.to_bits())
    }

    pub(crate) fn is_pinned(self) -> bool {
        HandleWord::from_bits(self.0).pinned()
    }

    pub(crate) fn index(self) -> u32 {
        debug_assert!(!self.is_pinned() && !self.is_null());
        (HandleWord::from_bits(self.0).payload() - 1) as u32
    }

    pub(crate) fn pinned_slot(self) -> *const Atomic<ObjectRef> {
        debug_assert!(self.is_pinned());
        ((HandleWord::from_bits(self.0).payload() << 1) as usize) as *const Atomic<ObjectRef>
    }
}

impl LoaderAllocator {
    /// Allocates a handle anchoring `value`. For collectible allocators
    /// the slot comes from the handle table: a previously freed index if
    /// one exists, otherwise the high-water slot, otherwise the table is
    /// doubled first (the growth allocation may trigger a managed
    /// collection, so it happens outside the per-allocator lock and loses
    /// races gracefully). Returns the null token if the managed allocator
    /// was already collected.
    pub fn allocate_handle(&self, value: ObjectRef) -> Result<LoaderHandle> {
        if !self.is_collectible() {
            let slot = self.domain().allocate_pinned_slot();
            unsafe {
                (*slot).store(value, atomic::Ordering::SeqCst);
            }
            return Ok(LoaderHandle::from_pinned(slot));
        }

        let tracker = match self.tracker() {
            Some(tracker) => tracker,
            // The managed allocator is already collected; no exposed
            // managed objects can be created for it anymore.
            None => return Ok(LoaderHandle::null()),
        };

        loop {
            let slots_used;
            let num_components;
            let observed_table;
            {
                let mut state = self.lock_state();
                let table = tracker.handle_table();

                if let Some(index) = state.free_handle_indices.pop() {
                    table.set(index as usize, value);
                    return Ok(LoaderHandle::from_index(index));
                }

                slots_used = tracker.slots_used();
                if slots_used >= MAX_LOADER_HANDLES {
                    return Err(Error::OutOfMemory);
                }

                num_components = table.len();
                if (slots_used as usize) < num_components {
                    table.set(slots_used as usize, value);
                    tracker.set_slots_used(slots_used + 1);
                    return Ok(LoaderHandle::from_index(slots_used));
                }

                observed_table = tracker.handle_table_ptr();
            }

            // The table is full; double it outside the lock.
            let new_table = ObjectArray::new(num_components * 2);
            {
                let _state = self.lock_state();
                if tracker.handle_table_ptr() == observed_table {
                    let old_table = tracker.handle_table();
                    let used = tracker.slots_used() as usize;
                    for index in 0..used {
                        new_table.set(index, old_table.get(index));
                    }
                    tracker.publish_table(new_table);
                }
                // Otherwise another thread won the enlargement race; its
                // table is adopted by retrying from the top.
            }
        }
    }

    /// Reads a handle. Lock-free: tag dispatch, then either a direct slot
    /// load or a load through the current table pointer. Reading a freed
    /// handle returns null; reading a handle after its index was reissued
    /// is undefined.
    pub fn get_handle_value(&self, handle: LoaderHandle) -> ObjectRef {
        assert!(!handle.is_null());
        if handle.is_pinned() {
            unsafe { (*handle.pinned_slot()).load(atomic::Ordering::Relaxed) }
        } else {
            match self.tracker() {
                Some(tracker) => tracker.handle_table().get(handle.index() as usize),
                None => ObjectRef::null(),
            }
        }
    }

    pub fn set_handle_value(&self, handle: LoaderHandle, value: ObjectRef) {
        assert!(!handle.is_null());
        if handle.is_pinned() {
            unsafe {
                (*handle.pinned_slot()).store(value, atomic::Ordering::SeqCst);
            }
            return;
        }
        // The handle table is read locklessly; writes go through the
        // per-allocator lock.
        let _state = self.lock_state();
        if let Some(tracker) = self.tracker() {
            tracker.handle_table().set(handle.index() as usize, value);
        }
    }

    /// Stores `value` iff the handle currently holds `compare`; returns
    /// the previous value either way.
    pub fn compare_exchange_handle_value(
        &self,
        handle: LoaderHandle,
        value: ObjectRef,
        compare: ObjectRef,
    ) -> ObjectRef {
        assert!(!handle.is_null());
        if handle.is_pinned() {
            return unsafe { (*handle.pinned_slot()).compare_exchange(compare, value, atomic::Ordering::SeqCst, atomic::Ordering::SeqCst) }
                .unwrap_or_else(|previous| previous);
        }

        let _state = self.lock_state();
        match self.tracker() {
            Some(tracker) => {
                let table = tracker.handle_table();
                let index = handle.index() as usize;
                let previous = table.get(index);
                if previous == compare {
                    table.set(index, value);
                }
                previous
            }
            None => ObjectRef::null(),
        }
    }

    /// Frees a handle: nulls the slot first, then offers the index for
    /// reuse. The push can fail under memory pressure, in which case the
    /// index is leaked rather than misused.
    pub fn free_handle(&self, handle: LoaderHandle) {
        assert!(!handle.is_null());
        self.set_handle_value(handle, ObjectRef::null());

        if !handle.is_pinned() {
            let mut state = self.lock_state();
            let _ = state.free_handle_indices.push(handle.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_tokens_round_trip() {
        for index in [0u32, 1, 31, 64, 12345] {
            let handle = LoaderHandle::from_index(index);
            assert!(!handle.is_null());
            assert!(!handle.is_pinned());
            assert_eq!(handle.index(), index);
        }
    }

    #[test]
    fn pinned_tokens_round_trip() {
        let slot = Box::new(Atomic::new(ObjectRef::null()));
        let pointer = &*slot as *const Atomic<ObjectRef>;
        let handle = LoaderHandle::from_pinned(pointer);
        assert!(handle.is_pinned());
        assert_eq!(handle.pinned_slot(), pointer);
    }

    #[test]
    fn the_null_token_is_distinguished() {
        assert!(LoaderHandle::null().is_null());
        assert!(!LoaderHandle::from_index(0).is_null());
    }
}
