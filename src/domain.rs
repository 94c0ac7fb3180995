//! The domain: owner of the assembly list, the two domain-wide locks of
//! the lifetime protocol, and the caches the sweep purges.

use std::sync::Arc;

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{
    assembly::DomainAssembly,
    loader_allocator::LoaderAllocator,
    object::{ObjectRef, PinnedSlotPool},
    runtime::{ExecutionEngine, RuntimeHooks},
};

/// An entry in the domain's class-initialisation lock list. Failed
/// initialisations in collectible code keep their entry alive until the
/// owning allocator is torn down.
pub struct ClassInitLockEntry {
    type_name: String,
}

impl ClassInitLockEntry {
    pub fn new(type_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            type_name: type_name.into(),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

pub struct Domain {
    name: String,
    engine: ExecutionEngine,

    // Lock order when held jointly: references lock, then assembly-list
    // lock, then any per-allocator lock.
    loader_allocator_references_lock: Mutex<()>,
    assemblies: Mutex<Vec<Arc<DomainAssembly>>>,

    pending_delete: Mutex<Vec<Arc<LoaderAllocator>>>,
    pinned_slots: PinnedSlotPool,
    class_init_locks: Mutex<Vec<Arc<ClassInitLockEntry>>>,

    file_cache: Mutex<hashbrown::HashSet<String, ahash::RandomState>>,
    native_image_dependencies: Mutex<hashbrown::HashSet<String, ahash::RandomState>>,
    method_data_cache: Mutex<hashbrown::HashMap<usize, usize, ahash::RandomState>>,
    generic_handle_cache: Mutex<hashbrown::HashMap<usize, usize, ahash::RandomState>>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_hooks(name, RuntimeHooks::default())
    }

    pub fn with_hooks(name: impl Into<String>, hooks: RuntimeHooks) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            engine: ExecutionEngine::with_hooks(hooks),
            loader_allocator_references_lock: Mutex::new(()),
            assemblies: Mutex::new(Vec::new()),
            pending_delete: Mutex::new(Vec::new()),
            pinned_slots: PinnedSlotPool::new(),
            class_init_locks: Mutex::new(Vec::new()),
            file_cache: Mutex::new(hashbrown::HashSet::default()),
            native_image_dependencies: Mutex::new(hashbrown::HashSet::default()),
            method_data_cache: Mutex::new(hashbrown::HashMap::default()),
            generic_handle_cache: Mutex::new(hashbrown::HashMap::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Guards every reference-set read and write, and the sweep's select
    /// phase. The mark phase runs under the assembly-list lock alone.
    pub(crate) fn loader_allocator_references_lock(&self) -> &Mutex<()> {
        &self.loader_allocator_references_lock
    }

    /// Guards iteration over the assembly list.
    pub(crate) fn assembly_list(&self) -> &Mutex<Vec<Arc<DomainAssembly>>> {
        &self.assemblies
    }

    pub fn add_assembly(&self, assembly: &Arc<DomainAssembly>) {
        if !assembly.is_dynamic() {
            self.cache_file(assembly.name());
            self.record_native_image_dependency(assembly.name());
        }
        self.assemblies.lock().push(Arc::clone(assembly));
    }

    pub(crate) fn remove_assembly(&self, assembly: &Arc<DomainAssembly>) {
        self.assemblies
            .lock()
            .retain(|entry| !Arc::ptr_eq(entry, assembly));
    }

    pub fn assembly_count(&self) -> usize {
        self.assemblies.lock().len()
    }

    pub fn cache_file(&self, name: &str) {
        self.file_cache.lock().insert(name.to_owned());
    }

    pub fn is_file_cached(&self, name: &str) -> bool {
        self.file_cache.lock().contains(name)
    }

    pub(crate) fn uncache_file(&self, name: &str) {
        self.file_cache.lock().remove(name);
    }

    pub fn record_native_image_dependency(&self, name: &str) {
        self.native_image_dependencies.lock().insert(name.to_owned());
    }

    pub fn has_native_image_dependency(&self, name: &str) -> bool {
        self.native_image_dependencies.lock().contains(name)
    }

    pub(crate) fn remove_native_image_dependency(&self, name: &str) {
        self.native_image_dependencies.lock().remove(name);
    }

    pub fn cache_method_data(&self, key: usize, value: usize) {
        self.method_data_cache.lock().insert(key, value);
    }

    pub fn cache_generic_handle(&self, key: usize, value: usize) {
        self.generic_handle_cache.lock().insert(key, value);
    }

    pub fn cached_method_data(&self, key: usize) -> Option<usize> {
        self.method_data_cache.lock().get(&key).copied()
    }

    pub fn cached_generic_handle(&self, key: usize) -> Option<usize> {
        self.generic_handle_cache.lock().get(&key).copied()
    }

    /// Purges the caches keyed by collected allocators; only called while
    /// the engine is suspended.
    pub(crate) fn clear_jit_caches(&self) {
        self.method_data_cache.lock().clear();
        self.generic_handle_cache.lock().clear();
    }

    /// Pinned reference slot for the non-collectible handle encoding.
    pub(crate) fn allocate_pinned_slot(&self) -> *const Atomic<ObjectRef> {
        self.pinned_slots.allocate()
    }

    pub fn register_class_init_lock(&self, entry: &Arc<ClassInitLockEntry>) {
        self.class_init_locks.lock().push(Arc::clone(entry));
    }

    pub(crate) fn unlink_class_init_lock(&self, entry: &Arc<ClassInitLockEntry>) {
        self.class_init_locks
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, entry));
    }

    pub fn class_init_lock_count(&self) -> usize {
        self.class_init_locks.lock().len()
    }

    /// Queues an allocator whose sweep finished for destruction at the
    /// next safe point.
    pub(crate) fn register_loader_allocator_for_deletion(
        &self,
        loader_allocator: &Arc<LoaderAllocator>,
    ) {
        self.pending_delete.lock().push(Arc::clone(loader_allocator));
    }

    /// Drains the pending-delete list, terminating each allocator and
    /// dropping the domain's last reference to it.
    pub(crate) fn shutdown_free_loader_allocators(&self) {
        loop {
            let next = self.pending_delete.lock().pop();
            match next {
                Some(loader_allocator) => loader_allocator.terminate(),
                None => break,
            }
        }
    }
}
