//! The managed side of the lifetime protocol: the tracker object exposed
//! to managed code and the scout whose finalizer reports its death.
//!
//! The embedder stands in for the managed garbage collector: holding the
//! `Arc<LoaderAllocatorObject>` is "the managed allocator is reachable",
//! dropping the last one is "the managed allocator was collected". As in
//! the real runtime, cycles through managed objects are the embedder's
//! collector's problem; by the time the scout runs its finalizer the
//! managed side of the web is already gone.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{loader_allocator::LoaderAllocator, object::ObjectArray, object::ObjectRef};

/// Initial length of the handle table published with the tracker.
pub const INITIAL_HANDLE_TABLE_LENGTH: usize = 32;

/// The managed tracker object. Owns every handle-table array ever
/// published for its allocator, so the lock-free read path can keep using
/// an array that lost a growth race.
pub struct LoaderAllocatorObject {
    native: AtomicPtr<LoaderAllocator>,
    handle_table: AtomicPtr<ObjectArray>,
    slots_used: AtomicU32,
    tables: Mutex<Vec<Box<ObjectArray>>>,

    // Declared last: the scout's finalizer must run only after the rest of
    // the managed state is unreachable.
    #[allow(dead_code)]
    scout: LoaderAllocatorScout,
}

impl LoaderAllocatorObject {
    pub(crate) fn new(native: Arc<LoaderAllocator>) -> Arc<Self> {
        let table = ObjectArray::new(INITIAL_HANDLE_TABLE_LENGTH);
        let table_ptr = &*table as *const ObjectArray as *mut ObjectArray;
        Arc::new(Self {
            native: AtomicPtr::new(null_mut()),
            handle_table: AtomicPtr::new(table_ptr),
            slots_used: AtomicU32::new(0),
            tables: Mutex::new(vec![table]),
            scout: LoaderAllocatorScout { native },
        })
    }

    /// The reference managed code sees; pinning it in a handle table keeps
    /// this tracker reachable from the pinning allocator.
    pub fn exposed_object(self: &Arc<Self>) -> ObjectRef {
        ObjectRef::from_ptr(Arc::as_ptr(self) as *mut u8)
    }

    pub(crate) fn set_native(&self, native: &Arc<LoaderAllocator>) {
        self.native
            .store(Arc::as_ptr(native) as *mut LoaderAllocator, Ordering::Release);
    }

    /// The current handle table. The pointer load is the only
    /// synchronisation the lock-free read path needs: arrays are immutable
    /// in length and owned by `tables` until the tracker dies.
    #[inline(always)]
    pub(crate) fn handle_table(&self) -> &ObjectArray {
        unsafe { &*self.handle_table.load(Ordering::Acquire) }
    }

    pub(crate) fn handle_table_ptr(&self) -> *mut ObjectArray {
        self.handle_table.load(Ordering::Acquire)
    }

    pub(crate) fn slots_used(&self) -> u32 {
        self.slots_used.load(Ordering::Acquire)
    }

    pub(crate) fn set_slots_used(&self, slots_used: u32) {
        self.slots_used.store(slots_used, Ordering::Release);
    }

    /// Publishes a grown table. Caller holds the per-allocator lock and
    /// has verified the current pointer is the one it copied from.
    pub(crate) fn publish_table(&self, table: Box<ObjectArray>) {
        let ptr = &*table as *const ObjectArray as *mut ObjectArray;
        self.tables.lock().push(table);
        self.handle_table.store(ptr, Ordering::Release);
    }
}

// Raw pointers inside are either opaque (`native`) or point into boxes
// owned by `tables`.
unsafe impl Send for LoaderAllocatorObject {}
unsafe impl Sync for LoaderAllocatorObject {}

/// The scout rides inside the tracker; its drop is the finalizer that
/// publishes the death of the managed allocator to the native side.
pub(crate) struct LoaderAllocatorScout {
    native: Arc<LoaderAllocator>,
}

impl Drop for LoaderAllocatorScout {
    fn drop(&mut self) {
        // Non-collectible allocators live for the process; their tracker
        // going away must not start a teardown.
        if self.native.is_collectible() {
            LoaderAllocator::destroy(&self.native);
        }
    }
}

/// A handle into the embedder's GC handle table, registered with an
/// allocator so teardown can destroy it. Destroying is dropping.
pub enum GcHandle {
    /// The long-weak handle through which the native allocator observes
    /// its tracker.
    LongWeak(Weak<LoaderAllocatorObject>),
    /// A strong anchor for an arbitrary managed object.
    Strong(ObjectRef),
}
