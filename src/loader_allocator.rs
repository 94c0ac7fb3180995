//! The loader allocator: owner of all permanent memory backing one loaded
//! code unit, and a node in the native reference graph that decides when
//! such a unit may be unloaded.
//!
//! The destruction scheme is complicated by the requirement that mutually
//! referencing collectible allocators must be torn down as a group. The
//! managed web of references has an analogous native web here, walked by a
//! small tracing collector (`sweep`), with a reference counter so that
//! stubs and dynamic methods can keep an allocator alive without
//! participating in the graph.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{const_mutex, Mutex, MutexGuard};

use crate::{
    arena::{CodeFragmentArena, LoaderArena, StubCodeKind},
    arena_group::{ArenaConfig, ArenaGroup},
    assembly::{DomainAssembly, DomainAssemblyIterator},
    domain::{ClassInitLockEntry, Domain},
    error::Result,
    index_stack::SegmentedIndexStack,
    refcount::RefCount,
    runtime::MANAGED_TRACKING_PRESSURE,
    string_map::StringLiteralMap,
    stubs::{FuncPtrStubs, UmThunkCache, VirtualCallStubManager},
    tracking::{GcHandle, LoaderAllocatorObject},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AllocatorKind {
    /// One per process, serves runtime-wide stubs. Never unloads.
    Global,
    /// One per domain. Never unloads.
    Domain,
    /// One per loaded assembly load-context; the only collectible kind.
    Assembly,
}

/// Identity of an allocator: its kind plus the process-wide monotonic
/// creation number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AllocatorId {
    pub kind: AllocatorKind,
    pub creation_number: u64,
}

/// Opaque identity of a runtime type, used by the derived-type registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeToken(pub u64);

/// Trait for the managed assembly-load-context binder released when the
/// allocator is swept.
pub trait LoadContextBinder: Send + Sync {
    fn release_load_context(&self);
}

static LOADER_ALLOCATORS_CREATED: AtomicU64 = AtomicU64::new(1);
static ACTIVE_LOADER_ALLOCATORS: Mutex<Vec<(u64, Weak<LoaderAllocator>)>> =
    const_mutex(Vec::new());

/// Every live allocator, weakly. Consulted only by derived-type walks.
pub fn active_loader_allocators() -> Vec<Arc<LoaderAllocator>> {
    let registry = ACTIVE_LOADER_ALLOCATORS.lock();
    registry
        .iter()
        .filter_map(|(_, weak)| weak.upgrade())
        .collect()
}

/// The set of other allocators this one depends on. Guarded by the
/// domain's loader-allocator-references lock for protocol purposes; the
/// inner mutex only keeps the container itself sound.
pub(crate) struct ReferenceSet {
    entries: hashbrown::HashMap<usize, Arc<LoaderAllocator>, ahash::RandomState>,
}

impl ReferenceSet {
    fn new() -> Self {
        Self {
            entries: hashbrown::HashMap::default(),
        }
    }

    pub(crate) fn contains(&self, target: &Arc<LoaderAllocator>) -> bool {
        self.entries.contains_key(&(Arc::as_ptr(target) as usize))
    }

    fn insert(&mut self, target: Arc<LoaderAllocator>) {
        let key = Arc::as_ptr(&target) as usize;
        let previous = self.entries.insert(key, target);
        debug_assert!(previous.is_none());
    }

    pub(crate) fn targets(&self) -> impl Iterator<Item = &Arc<LoaderAllocator>> {
        self.entries.values()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// State guarded by the per-allocator lock.
pub(crate) struct AllocatorState {
    pub(crate) free_handle_indices: SegmentedIndexStack,
    handle_cleanup_list: Vec<GcHandle>,
    failed_type_init_list: Vec<Arc<ClassInitLockEntry>>,
    derived_types: hashbrown::HashMap<TypeToken, Vec<TypeToken>, ahash::RandomState>,
    interface_implementations: hashbrown::HashMap<TypeToken, Vec<TypeToken>, ahash::RandomState>,
}

pub struct LoaderAllocator {
    kind: AllocatorKind,
    collectible: bool,
    domain: Arc<Domain>,
    arenas: ArenaGroup,
    creation_number: u64,

    // Long-weak reference to the managed tracker. Written exactly once by
    // `setup_managed_tracking`, before the allocator is shared across
    // threads; read-only afterwards, which is what makes the handle-table
    // fast path lock-free.
    tracker: UnsafeCell<Weak<LoaderAllocatorObject>>,
    tracking_registered: AtomicBool,

    references: Mutex<ReferenceSet>,
    count: RefCount,
    // Set by `destroy` from the scout finalizer. Non-null means the
    // managed scout is gone.
    first_assembly_to_delete: Mutex<Option<Arc<DomainAssembly>>>,
    first_assembly: Mutex<Option<Arc<DomainAssembly>>>,

    marked: AtomicBool,
    terminated: AtomicBool,
    unloaded: AtomicBool,
    gc_pressure: AtomicBool,

    // Used only while an allocator sits on a sweep's to-destroy chain.
    destroy_next: Mutex<Option<Arc<LoaderAllocator>>>,

    state: Mutex<AllocatorState>,

    func_ptr_stubs: AtomicPtr<FuncPtrStubs>,
    um_thunk_cache: AtomicPtr<UmThunkCache>,
    string_literal_map: AtomicPtr<StringLiteralMap>,
    dynamic_helpers: AtomicPtr<CodeFragmentArena>,
    virtual_call_stub_manager: Mutex<Option<VirtualCallStubManager>>,
    binder: Mutex<Option<Box<dyn LoadContextBinder>>>,
}

// `tracker` is written once before the allocator is shared; every raw
// pointer field is either owned (freed in `terminate`) or opaque.
unsafe impl Send for LoaderAllocator {}
unsafe impl Sync for LoaderAllocator {}

impl LoaderAllocator {
    pub fn global(domain: &Arc<Domain>) -> Result<Arc<Self>> {
        Self::with_kind(domain, AllocatorKind::Global, false, &ArenaConfig::global())
    }

    pub fn domain_wide(domain: &Arc<Domain>) -> Result<Arc<Self>> {
        Self::with_kind(
            domain,
            AllocatorKind::Domain,
            false,
            &ArenaConfig::non_collectible(),
        )
    }

    pub fn assembly(domain: &Arc<Domain>, collectible: bool) -> Result<Arc<Self>> {
        let config = if collectible {
            ArenaConfig::collectible()
        } else {
            ArenaConfig::non_collectible()
        };
        Self::with_kind(domain, AllocatorKind::Assembly, collectible, &config)
    }

    fn with_kind(
        domain: &Arc<Domain>,
        kind: AllocatorKind,
        collectible: bool,
        config: &ArenaConfig,
    ) -> Result<Arc<Self>> {
        let creation_number = LOADER_ALLOCATORS_CREATED.fetch_add(1, Ordering::SeqCst);
        let this = Arc::new(Self {
            kind,
            collectible,
            domain: Arc::clone(domain),
            arenas: ArenaGroup::new(config)?,
            creation_number,
            tracker: UnsafeCell::new(Weak::new()),
            tracking_registered: AtomicBool::new(false),
            references: Mutex::new(ReferenceSet::new()),
            count: RefCount::new(),
            first_assembly_to_delete: Mutex::new(None),
            first_assembly: Mutex::new(None),
            marked: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            gc_pressure: AtomicBool::new(false),
            destroy_next: Mutex::new(None),
            state: Mutex::new(AllocatorState {
                free_handle_indices: SegmentedIndexStack::new(),
                handle_cleanup_list: Vec::new(),
                failed_type_init_list: Vec::new(),
                derived_types: hashbrown::HashMap::default(),
                interface_implementations: hashbrown::HashMap::default(),
            }),
            func_ptr_stubs: AtomicPtr::new(null_mut()),
            um_thunk_cache: AtomicPtr::new(null_mut()),
            string_literal_map: AtomicPtr::new(null_mut()),
            dynamic_helpers: AtomicPtr::new(null_mut()),
            virtual_call_stub_manager: Mutex::new(None),
            binder: Mutex::new(None),
        });
        ACTIVE_LOADER_ALLOCATORS
            .lock()
            .push((creation_number, Arc::downgrade(&this)));
        Ok(this)
    }

    pub fn id(&self) -> AllocatorId {
        AllocatorId {
            kind: self.kind,
            creation_number: self.creation_number,
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    pub fn creation_number(&self) -> u64 {
        self.creation_number
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    pub fn can_unload(&self) -> bool {
        self.kind == AllocatorKind::Assembly && self.collectible
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Checks if the native object is alive; see the phase table in the
    /// crate documentation.
    pub fn is_alive(&self) -> bool {
        self.count.is_alive()
    }

    pub fn is_managed_scout_alive(&self) -> bool {
        self.first_assembly_to_delete.lock().is_none()
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    pub(crate) fn set_unloaded(&self) {
        self.unloaded.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> u32 {
        self.count.get()
    }

    /// The caller must already hold a counted reference.
    pub fn add_reference(&self) {
        self.count.add_reference();
    }

    /// Adds a reference only if the allocator is still alive. This is how
    /// dynamic methods and stubs pin an allocator from outside the graph.
    pub fn add_reference_if_alive(&self) -> bool {
        self.count.add_reference_if_alive()
    }

    /// Drops a counted reference. Returns true iff the count reached
    /// zero; the caller decides whether to run the sweep.
    #[must_use]
    pub fn release(&self) -> bool {
        self.count.release()
    }

    /// Creates the managed tracker and the long-weak handle through which
    /// this allocator observes it. Must run before any managed reference
    /// to this allocator is exposed.
    pub fn setup_managed_tracking(self: &Arc<Self>) -> Arc<LoaderAllocatorObject> {
        assert!(
            !self.tracking_registered.swap(true, Ordering::SeqCst),
            "managed tracking set up twice"
        );
        self.domain
            .engine()
            .add_memory_pressure(MANAGED_TRACKING_PRESSURE);
        self.gc_pressure.store(true, Ordering::Release);

        let tracker = LoaderAllocatorObject::new(Arc::clone(self));
        let weak = Arc::downgrade(&tracker);
        unsafe {
            *self.tracker.get() = weak.clone();
        }
        self.register_handle_for_cleanup(GcHandle::LongWeak(weak));
        tracker
    }

    /// Publication to managed code: the scout becomes the first counted
    /// reference. Called exactly once, after `setup_managed_tracking`.
    pub fn activate_managed_tracking(self: &Arc<Self>) {
        self.count.activate();
        let tracker = self.tracker().expect("managed tracking not set up");
        tracker.set_native(self);
    }

    /// Upgrades the long-weak handle. None once the managed tracker has
    /// been collected (phases 3 and 4).
    pub(crate) fn tracker(&self) -> Option<Arc<LoaderAllocatorObject>> {
        unsafe { (*self.tracker.get()).upgrade() }
    }

    /// Entry point of the managed scout's finalizer. Publishes the
    /// assembly-deletion list, drops every reference this allocator holds
    /// on others, then drops the scout's own reference; if that was the
    /// last one, runs the sweep. Returns true iff this call tore the
    /// allocator down.
    pub fn destroy(this: &Arc<LoaderAllocator>) -> bool {
        debug_assert!(
            this.tracker().is_none(),
            "destroy must run only after the managed tracker is collected"
        );
        debug_assert_eq!(this.kind, AllocatorKind::Assembly);
        log::debug!(
            "begin destroy of loader allocator #{}",
            this.creation_number
        );

        let first_assembly = this.first_assembly.lock().clone();
        if first_assembly.is_some() {
            *this.first_assembly_to_delete.lock() = first_assembly;
        }

        // Drop one reference for each outgoing edge. Zero transitions of
        // the targets are deliberately not acted upon here; the sweep
        // below finds them through the graph.
        {
            let references = this.references.lock();
            for target in references.targets() {
                let _ = target.release();
            }
        }

        let was_last = this.release();
        if was_last {
            crate::sweep::gc_loader_allocators(this);
        }

        log::debug!("end destroy of loader allocator #{}", this.creation_number);
        was_last
    }

    // ---------------------------------------------------------------
    // Mark bit (sweep phases M and S)
    // ---------------------------------------------------------------

    pub(crate) fn try_mark(&self) -> bool {
        !self.marked.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_mark(&self) {
        self.marked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn references(&self) -> &Mutex<ReferenceSet> {
        &self.references
    }

    pub(crate) fn destroy_next(&self) -> &Mutex<Option<Arc<LoaderAllocator>>> {
        &self.destroy_next
    }

    // ---------------------------------------------------------------
    // Reference set
    // ---------------------------------------------------------------

    /// Ensures this allocator holds a counted reference to `other`.
    /// Returns true iff a new reference was recorded.
    pub fn ensure_reference(self: &Arc<Self>, other: &Arc<LoaderAllocator>) -> Result<bool> {
        if !self.is_collectible() {
            return Ok(false);
        }
        if Arc::ptr_eq(self, other) {
            return Ok(false);
        }
        if !other.is_collectible() {
            return Ok(false);
        }

        let _references_lock = self.domain.loader_allocator_references_lock().lock();
        self.check_add_reference_locked(other)
    }

    /// Ensures this allocator references every distinct collectible
    /// allocator of a generic instantiation: the defining module's and
    /// each type argument's. Returns true iff any new reference was added.
    pub fn ensure_instantiation(
        self: &Arc<Self>,
        defining_module: Option<&Arc<LoaderAllocator>>,
        type_args: &[Arc<LoaderAllocator>],
    ) -> Result<bool> {
        if !self.is_collectible() {
            return Ok(false);
        }

        let mut new_reference_added = false;
        let _references_lock = self.domain.loader_allocator_references_lock().lock();

        if let Some(defining) = defining_module {
            if defining.is_collectible() && !Arc::ptr_eq(self, defining) {
                new_reference_added = self.check_add_reference_locked(defining)? || new_reference_added;
            }
        }

        for arg in type_args {
            if Arc::ptr_eq(self, arg) {
                continue;
            }
            if !arg.is_collectible() {
                continue;
            }
            new_reference_added = self.check_add_reference_locked(arg)? || new_reference_added;
        }

        Ok(new_reference_added)
    }

    fn check_add_reference_locked(&self, other: &Arc<LoaderAllocator>) -> Result<bool> {
        debug_assert!(!std::ptr::eq(self, Arc::as_ptr(other)));

        let mut references = self.references.lock();
        if references.contains(other) {
            return Ok(false);
        }

        // Pin the target's managed tracker so the managed side of the web
        // mirrors this native edge.
        if let Some(tracker) = other.tracker() {
            self.allocate_handle(tracker.exposed_object())?;
        }

        references.insert(Arc::clone(other));
        other.add_reference();
        Ok(true)
    }

    /// Transitive reachability query over the reference graph, used when
    /// deciding whether a type handle of another allocator may be burned
    /// into code owned by this one.
    pub fn depends_on(self: &Arc<Self>, other: &Arc<LoaderAllocator>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }

        let _references_lock = self.domain.loader_allocator_references_lock().lock();
        // Explicit visited set; the graph may be deep.
        let mut visited = hashbrown::HashSet::<usize, ahash::RandomState>::default();
        let mut worklist = vec![Arc::clone(self)];
        visited.insert(Arc::as_ptr(self) as usize);
        while let Some(current) = worklist.pop() {
            let references = current.references.lock();
            for target in references.targets() {
                if Arc::ptr_eq(target, other) {
                    return true;
                }
                if visited.insert(Arc::as_ptr(target) as usize) {
                    worklist.push(Arc::clone(target));
                }
            }
        }
        false
    }

    pub fn may_reference_type_of(self: &Arc<Self>, type_owner: &Arc<LoaderAllocator>) -> bool {
        self.depends_on(type_owner)
    }

    // ---------------------------------------------------------------
    // Assemblies in this load context
    // ---------------------------------------------------------------

    pub fn add_domain_assembly(&self, assembly: &Arc<DomainAssembly>) {
        debug_assert_eq!(self.kind, AllocatorKind::Assembly);
        let mut first = self.first_assembly.lock();
        assembly.set_next_in_same_context(first.take());
        *first = Some(Arc::clone(assembly));
    }

    pub fn assemblies_in_load_context(&self) -> DomainAssemblyIterator {
        DomainAssemblyIterator::new(self.first_assembly.lock().clone())
    }

    pub(crate) fn first_assembly_to_delete(&self) -> Option<Arc<DomainAssembly>> {
        self.first_assembly_to_delete.lock().clone()
    }

    /// Drops the assembly chains after the sweep removed the assemblies
    /// from the domain. The back-references die with them.
    pub(crate) fn delete_assemblies(&self) {
        let chain = DomainAssemblyIterator::new(self.first_assembly_to_delete.lock().take());
        for assembly in chain {
            assembly.detach();
        }
        *self.first_assembly.lock() = None;
    }

    pub(crate) fn release_managed_load_context(&self) {
        if let Some(binder) = self.binder.lock().as_ref() {
            binder.release_load_context();
        }
    }

    /// Registers the managed load-context binder to release during sweep.
    pub fn register_binder(&self, binder: Box<dyn LoadContextBinder>) {
        debug_assert_eq!(self.kind, AllocatorKind::Assembly);
        let mut slot = self.binder.lock();
        debug_assert!(slot.is_none());
        *slot = Some(binder);
    }

    // ---------------------------------------------------------------
    // Cleanup queues
    // ---------------------------------------------------------------

    /// Queues a runtime GC handle for destruction at teardown. Only
    /// collectible allocators track handles; for the other kinds the
    /// handle lives as long as the process.
    pub fn register_handle_for_cleanup(&self, handle: GcHandle) {
        if !self.can_unload() {
            return;
        }
        self.state.lock().handle_cleanup_list.push(handle);
    }

    pub fn register_failed_type_init(&self, entry: &Arc<ClassInitLockEntry>) {
        if !self.is_collectible() {
            return;
        }
        self.state.lock().failed_type_init_list.push(Arc::clone(entry));
    }

    fn cleanup_handles(&self) {
        let drained = std::mem::take(&mut self.state.lock().handle_cleanup_list);
        drop(drained);
    }

    fn cleanup_failed_type_init(&self) {
        if !self.is_collectible() {
            return;
        }
        let drained = std::mem::take(&mut self.state.lock().failed_type_init_list);
        for entry in drained {
            self.domain.unlink_class_init_lock(&entry);
        }
    }

    // ---------------------------------------------------------------
    // Derived-type registry
    // ---------------------------------------------------------------

    pub fn add_derived_type_info(&self, base: TypeToken, derived: TypeToken) {
        let mut state = self.state.lock();
        state.derived_types.entry(base).or_default().push(derived);
    }

    pub fn add_interface_implementation(&self, interface: TypeToken, implementing: TypeToken) {
        let mut state = self.state.lock();
        state
            .interface_implementations
            .entry(interface)
            .or_default()
            .push(implementing);
    }

    /// Walks every type deriving from or implementing `base`, in this
    /// allocator and in every other live one. The callback returns false
    /// to abort the walk; the walk reports whether it ran to completion.
    pub fn walk_derived_types(
        self: &Arc<Self>,
        base: TypeToken,
        callback: &mut dyn FnMut(TypeToken) -> bool,
    ) -> bool {
        if !self.walk_derived_types_worker(base, callback) {
            return false;
        }
        for other in active_loader_allocators() {
            if Arc::ptr_eq(self, &other) {
                continue;
            }
            if !other.walk_derived_types_worker(base, callback) {
                return false;
            }
        }
        true
    }

    fn walk_derived_types_worker(
        &self,
        base: TypeToken,
        callback: &mut dyn FnMut(TypeToken) -> bool,
    ) -> bool {
        let mut worklist = vec![base];
        let mut visited = hashbrown::HashSet::<TypeToken, ahash::RandomState>::default();
        while let Some(current) = worklist.pop() {
            let children: Vec<TypeToken> = {
                let state = self.state.lock();
                let derived = state.derived_types.get(&current).into_iter().flatten();
                let implementing = state
                    .interface_implementations
                    .get(&current)
                    .into_iter()
                    .flatten();
                derived.chain(implementing).copied().collect()
            };
            for ty in children {
                if !visited.insert(ty) {
                    continue;
                }
                if !callback(ty) {
                    return false;
                }
                worklist.push(ty);
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Heaps and lazy singletons
    // ---------------------------------------------------------------

    pub fn low_frequency_heap(&self) -> &LoaderArena {
        self.arenas.low_frequency()
    }

    pub fn high_frequency_heap(&self) -> &LoaderArena {
        self.arenas.high_frequency()
    }

    pub fn stub_heap(&self) -> &LoaderArena {
        self.arenas.stub()
    }

    pub fn executable_heap(&self) -> Option<&LoaderArena> {
        self.arenas.executable()
    }

    pub fn precode_heap(&self) -> &CodeFragmentArena {
        self.arenas.precode()
    }

    pub fn arena_group(&self) -> &ArenaGroup {
        &self.arenas
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock()
    }

    pub fn func_ptr_stubs(&self) -> &FuncPtrStubs {
        lazy_init(&self.func_ptr_stubs, FuncPtrStubs::new)
    }

    pub fn um_thunk_cache(&self) -> &UmThunkCache {
        lazy_init(&self.um_thunk_cache, UmThunkCache::new)
    }

    pub fn string_literal_map(&self) -> &StringLiteralMap {
        lazy_init(&self.string_literal_map, StringLiteralMap::new)
    }

    /// The dynamic-helpers arena, created on first use. Creation reserves
    /// address space and can fail.
    pub fn dynamic_helpers_heap(&self) -> Result<&CodeFragmentArena> {
        let existing = self.dynamic_helpers.load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }
        let candidate = Box::into_raw(Box::new(CodeFragmentArena::new(
            StubCodeKind::DynamicHelper,
            2,
        )?));
        match self.dynamic_helpers.compare_exchange(
            null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(unsafe { &*candidate }),
            Err(winner) => {
                // Another thread beat us; discard the candidate.
                unsafe { drop(Box::from_raw(candidate)) };
                Ok(unsafe { &*winner })
            }
        }
    }

    pub fn init_virtual_call_stub_manager(&self) {
        let block = self.arenas.steal_vsd_initial_block();
        let mut slot = self.virtual_call_stub_manager.lock();
        debug_assert!(slot.is_none());
        *slot = Some(VirtualCallStubManager::new(block));
    }

    pub fn virtual_call_stub_manager_size(&self) -> usize {
        self.virtual_call_stub_manager
            .lock()
            .as_ref()
            .map_or(0, |manager| manager.size())
    }

    pub fn with_virtual_call_stub_manager<R>(
        &self,
        f: impl FnOnce(&VirtualCallStubManager) -> R,
    ) -> Option<R> {
        self.virtual_call_stub_manager.lock().as_ref().map(f)
    }

    pub(crate) fn uninit_virtual_call_stub_manager(&self) {
        if let Some(mut manager) = self.virtual_call_stub_manager.lock().take() {
            manager.uninit();
        }
    }

    /// Interns `data`, inserting `candidate` when no entry exists.
    pub fn get_or_intern_string(&self, data: &str, candidate: crate::object::ObjectRef) -> crate::object::ObjectRef {
        self.string_literal_map().get_or_intern(data, candidate)
    }

    /// Committed native bytes attributable to this allocator.
    pub fn estimate_size(&self) -> usize {
        let mut total = self.arenas.estimate_size();
        let string_map = self.string_literal_map.load(Ordering::Acquire);
        if !string_map.is_null() {
            total += unsafe { &*string_map }.size();
        }
        let helpers = self.dynamic_helpers.load(Ordering::Acquire);
        if !helpers.is_null() {
            total += unsafe { &*helpers }.size();
        }
        total + self.virtual_call_stub_manager_size()
    }

    // ---------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------

    /// Final teardown. Idempotent; everything protocol-visible dies here,
    /// the reservation itself is released when the last `Arc` goes away.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(
            "begin terminate of loader allocator #{}",
            self.creation_number
        );

        if self.gc_pressure.swap(false, Ordering::SeqCst) {
            self.domain
                .engine()
                .remove_memory_pressure(MANAGED_TRACKING_PRESSURE);
        }

        self.cleanup_handles();
        self.cleanup_failed_type_init();

        // Dropping the edges releases this allocator's keep-alive of its
        // targets' native objects.
        self.references.lock().clear();

        self.arenas.retire();

        log::debug!(
            "end terminate of loader allocator #{}",
            self.creation_number
        );
    }
}

impl Drop for LoaderAllocator {
    fn drop(&mut self) {
        self.terminate();
        self.uninit_virtual_call_stub_manager();

        // The lazy caches hand out references tied to `&self`; exclusive
        // access here means none remain.
        take_boxed(&self.um_thunk_cache);
        take_boxed(&self.func_ptr_stubs);
        take_boxed(&self.dynamic_helpers);
        take_boxed(&self.string_literal_map);

        ACTIVE_LOADER_ALLOCATORS
            .lock()
            .retain(|(number, _)| *number != self.creation_number);
    }
}

fn lazy_init<T>(slot: &AtomicPtr<T>, init: impl FnOnce() -> T) -> &T {
    let existing = slot.load(Ordering::Acquire);
    if !existing.is_null() {
        return unsafe { &*existing };
    }
    let candidate = Box::into_raw(Box::new(init()));
    match slot.compare_exchange(null_mut(), candidate, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*candidate },
        Err(winner) => {
            // Another thread beat us; discard the candidate.
            unsafe { drop(Box::from_raw(candidate)) };
            unsafe { &*winner }
        }
    }
}

fn take_boxed<T>(slot: &AtomicPtr<T>) {
    let pointer = slot.swap(null_mut(), Ordering::AcqRel);
    if !pointer.is_null() {
        unsafe { drop(Box::from_raw(pointer)) };
    }
}
