//! Per-allocator stub caches. These are opaque to the lifetime protocol;
//! what matters here is their creation discipline (lazy, first CAS wins)
//! and that teardown reclaims them.

use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;

use parking_lot::Mutex;

use crate::{arena::LoaderArena, error::Result};

/// Stubs backing function-pointer conversions of managed methods.
pub struct FuncPtrStubs {
    stubs: Mutex<Vec<NonNull<u8>>>,
}

impl FuncPtrStubs {
    pub fn new() -> Self {
        Self {
            stubs: Mutex::new(Vec::new()),
        }
    }

    /// Cuts a stub from the allocator's stub arena and records it.
    pub fn create_stub(&self, stub_arena: &LoaderArena, size: usize) -> Result<NonNull<u8>> {
        let stub = stub_arena.allocate(size)?;
        self.stubs.lock().push(stub);
        Ok(stub)
    }

    pub fn count(&self) -> usize {
        self.stubs.lock().len()
    }
}

unsafe impl Send for FuncPtrStubs {}
unsafe impl Sync for FuncPtrStubs {}

/// Cache of unmanaged-to-managed entry thunks not associated with a
/// delegate, keyed by method identity.
pub struct UmThunkCache {
    thunks: Mutex<hashbrown::HashMap<usize, NonNull<u8>, ahash::RandomState>>,
}

impl UmThunkCache {
    pub fn new() -> Self {
        Self {
            thunks: Mutex::new(hashbrown::HashMap::default()),
        }
    }

    pub fn get_or_create(
        &self,
        method: usize,
        stub_arena: &LoaderArena,
        size: usize,
    ) -> Result<NonNull<u8>> {
        let mut thunks = self.thunks.lock();
        if let Some(thunk) = thunks.get(&method) {
            return Ok(*thunk);
        }
        let thunk = stub_arena.allocate(size)?;
        thunks.insert(method, thunk);
        Ok(thunk)
    }

    pub fn len(&self) -> usize {
        self.thunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.lock().is_empty()
    }
}

unsafe impl Send for UmThunkCache {}
unsafe impl Sync for UmThunkCache {}

/// The virtual-call dispatch-stub manager. Opaque here: the sweep only
/// needs to create it against a stolen dispatch-heap block and uninit it
/// while the engine is suspended.
pub struct VirtualCallStubManager {
    heap_block: Option<(*mut u8, usize)>,
    dispatch_stubs: AtomicUsize,
}

impl VirtualCallStubManager {
    pub(crate) fn new(heap_block: Option<(*mut u8, usize)>) -> Self {
        Self {
            heap_block,
            dispatch_stubs: AtomicUsize::new(0),
        }
    }

    pub fn record_dispatch_stub(&self) {
        self.dispatch_stubs
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn dispatch_stub_count(&self) -> usize {
        self.dispatch_stubs.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Committed bytes attributed to dispatch stubs.
    pub fn size(&self) -> usize {
        self.heap_block.map_or(0, |(_, size)| size)
    }

    pub(crate) fn uninit(&mut self) {
        self.heap_block = None;
    }
}

unsafe impl Send for VirtualCallStubManager {}
unsafe impl Sync for VirtualCallStubManager {}
