use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{
    assembly::DomainAssembly,
    domain::{ClassInitLockEntry, Domain},
    error::Error,
    handle::{LoaderHandle, MAX_LOADER_HANDLES},
    loader_allocator::{LoadContextBinder, LoaderAllocator, TypeToken},
    object::ObjectRef,
    runtime::{RuntimeHooks, MANAGED_TRACKING_PRESSURE},
    tracking::{LoaderAllocatorObject, INITIAL_HANDLE_TABLE_LENGTH},
};

fn object(word: usize) -> ObjectRef {
    ObjectRef::from_ptr((word * 8) as *mut u8)
}

fn collectible_with_assembly(
    domain: &Arc<Domain>,
    name: &str,
) -> (Arc<LoaderAllocator>, Arc<LoaderAllocatorObject>) {
    let allocator = LoaderAllocator::assembly(domain, true).unwrap();
    let tracker = allocator.setup_managed_tracking();
    allocator.activate_managed_tracking();

    let assembly = DomainAssembly::new(name, &allocator);
    allocator.add_domain_assembly(&assembly);
    domain.add_assembly(&assembly);

    (allocator, tracker)
}

#[test]
fn solo_collectible_is_torn_down_when_its_scout_dies() {
    let domain = Domain::new("solo");
    let (allocator, tracker) = collectible_with_assembly(&domain, "solo.dll");

    // Phase 1: managed allocator alive.
    assert!(allocator.is_alive());
    assert!(allocator.is_managed_scout_alive());
    assert_eq!(allocator.reference_count(), 1);
    assert_eq!(domain.engine().memory_pressure(), MANAGED_TRACKING_PRESSURE);
    assert!(domain.is_file_cached("solo.dll"));

    drop(tracker);

    // Phase 4: dead, swept, everything detached.
    assert!(!allocator.is_alive());
    assert!(allocator.is_terminated());
    assert!(allocator.is_unloaded());
    assert_eq!(domain.assembly_count(), 0);
    assert!(!domain.is_file_cached("solo.dll"));
    assert_eq!(domain.engine().memory_pressure(), 0);
}

#[test]
fn chained_allocators_are_torn_down_in_one_sweep() {
    let domain = Domain::new("chain");
    let (a, a_tracker) = collectible_with_assembly(&domain, "a.dll");
    let (b, b_tracker) = collectible_with_assembly(&domain, "b.dll");

    assert!(a.ensure_reference(&b).unwrap());
    assert_eq!(b.reference_count(), 2);

    // B's managed side dies first (A's code was keeping it reachable, so
    // the managed collector frees B no earlier than A). B stays in phase
    // 3: its counter holds A's contribution.
    drop(b_tracker);
    assert!(b.is_alive());
    assert_eq!(b.reference_count(), 1);
    assert!(!b.is_managed_scout_alive());
    assert!(!b.is_terminated());

    // A's finalizer releases its reference to B; only then does B hit
    // zero, and both fall in the same sweep.
    drop(a_tracker);
    assert!(!a.is_alive());
    assert!(!b.is_alive());
    assert!(a.is_terminated());
    assert!(b.is_terminated());
    assert_eq!(domain.assembly_count(), 0);
}

#[test]
fn cyclic_allocators_are_collected_together() {
    let domain = Domain::new("cycle");
    let (a, a_tracker) = collectible_with_assembly(&domain, "a.dll");
    let (b, b_tracker) = collectible_with_assembly(&domain, "b.dll");

    assert!(a.ensure_reference(&b).unwrap());
    assert!(b.ensure_reference(&a).unwrap());
    assert_eq!(a.reference_count(), 2);
    assert_eq!(b.reference_count(), 2);

    drop(a_tracker);
    // Neither counter reached zero yet; the cycle holds both at one.
    assert!(a.is_alive());
    assert!(b.is_alive());

    drop(b_tracker);
    assert!(!a.is_alive());
    assert!(!b.is_alive());
    assert!(a.is_terminated());
    assert!(b.is_terminated());
}

#[test]
fn a_ring_of_allocators_reaches_phase_four_together() {
    let domain = Domain::new("ring");
    let ring: Vec<_> = (0..5)
        .map(|i| collectible_with_assembly(&domain, &format!("ring{}.dll", i)))
        .collect();

    for i in 0..ring.len() {
        let (this, _) = &ring[i];
        let (next, _) = &ring[(i + 1) % ring.len()];
        assert!(this.ensure_reference(next).unwrap());
    }

    let (allocators, trackers): (Vec<_>, Vec<_>) = ring.into_iter().unzip();
    drop(trackers);

    for allocator in &allocators {
        assert!(!allocator.is_alive());
        assert!(allocator.is_terminated());
        assert!(allocator.is_unloaded());
    }
    assert_eq!(domain.assembly_count(), 0);
}

#[test]
fn an_external_reference_pins_the_allocator_in_phase_three() {
    let domain = Domain::new("pinned");
    let (allocator, tracker) = collectible_with_assembly(&domain, "pinned.dll");

    // A live dynamic-method stub holds a counted reference.
    assert!(allocator.add_reference_if_alive());

    drop(tracker);

    // Phase 3: native-only.
    assert!(allocator.is_alive());
    assert!(!allocator.is_managed_scout_alive());
    assert!(!allocator.is_terminated());
    assert_eq!(allocator.reference_count(), 1);

    // The stub goes away; its owner observes the zero and runs the sweep.
    assert!(allocator.release());
    crate::sweep::gc_loader_allocators(&allocator);
    assert!(allocator.is_terminated());
    assert!(allocator.is_unloaded());
}

#[test]
fn unload_events_and_debugger_notifications_fire_once_per_unit() {
    let unloads = Arc::new(AtomicUsize::new(0));
    let notifications = Arc::new(AtomicUsize::new(0));

    let hooks = RuntimeHooks {
        on_unload: Some(Box::new({
            let unloads = Arc::clone(&unloads);
            move |_| {
                unloads.fetch_add(1, Ordering::SeqCst);
            }
        })),
        notify_debugger_unload: Some(Box::new({
            let notifications = Arc::clone(&notifications);
            move |_| {
                notifications.fetch_add(1, Ordering::SeqCst);
            }
        })),
        unload_code_manager: None,
    };

    let domain = Domain::with_hooks("events", hooks);
    let (allocator, tracker) = collectible_with_assembly(&domain, "one.dll");
    let second = DomainAssembly::new("two.dll", &allocator);
    allocator.add_domain_assembly(&second);
    domain.add_assembly(&second);

    drop(tracker);

    assert_eq!(unloads.load(Ordering::SeqCst), 1);
    assert_eq!(notifications.load(Ordering::SeqCst), 2);
}

struct FlagBinder(Arc<AtomicUsize>);

impl LoadContextBinder for FlagBinder {
    fn release_load_context(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn the_managed_load_context_is_released_during_sweep() {
    let domain = Domain::new("binder");
    let (allocator, tracker) = collectible_with_assembly(&domain, "bound.dll");

    let released = Arc::new(AtomicUsize::new(0));
    allocator.register_binder(Box::new(FlagBinder(Arc::clone(&released))));

    drop(tracker);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn handles_round_trip_and_free_reads_null() {
    let domain = Domain::new("handles");
    let (allocator, _tracker) = collectible_with_assembly(&domain, "handles.dll");

    let value = object(11);
    let handle = allocator.allocate_handle(value).unwrap();
    assert!(!handle.is_null());
    assert_eq!(allocator.get_handle_value(handle), value);

    let replacement = object(12);
    allocator.set_handle_value(handle, replacement);
    assert_eq!(allocator.get_handle_value(handle), replacement);

    let third = object(13);
    let previous = allocator.compare_exchange_handle_value(handle, third, replacement);
    assert_eq!(previous, replacement);
    assert_eq!(allocator.get_handle_value(handle), third);

    // A failed compare leaves the slot alone.
    let previous = allocator.compare_exchange_handle_value(handle, value, replacement);
    assert_eq!(previous, third);
    assert_eq!(allocator.get_handle_value(handle), third);

    allocator.free_handle(handle);
    assert_eq!(allocator.get_handle_value(handle), ObjectRef::null());
}

#[test]
fn freed_indices_are_reused_lifo_without_growing_the_table() {
    let domain = Domain::new("reuse");
    let (allocator, tracker) = collectible_with_assembly(&domain, "reuse.dll");

    let handles: Vec<LoaderHandle> = (0..100)
        .map(|i| allocator.allocate_handle(object(i + 1)).unwrap())
        .collect();
    let slots_before = tracker.slots_used();

    allocator.free_handle(handles[7]);
    allocator.free_handle(handles[13]);

    let first = allocator.allocate_handle(object(200)).unwrap();
    let second = allocator.allocate_handle(object(201)).unwrap();
    assert_eq!(first.index(), 13);
    assert_eq!(second.index(), 7);
    assert_eq!(tracker.slots_used(), slots_before);
    assert_eq!(allocator.get_handle_value(first), object(200));
    assert_eq!(allocator.get_handle_value(second), object(201));
}

#[test]
fn exhausting_the_table_under_contention_grows_it_exactly_once() {
    let domain = Domain::new("grow");
    let (allocator, tracker) = collectible_with_assembly(&domain, "grow.dll");

    let initial = INITIAL_HANDLE_TABLE_LENGTH as u32;
    for i in 0..initial {
        allocator.allocate_handle(object(i as usize + 1)).unwrap();
    }
    assert_eq!(tracker.slots_used(), initial);
    assert_eq!(tracker.handle_table().len(), INITIAL_HANDLE_TABLE_LENGTH);

    crossbeam_utils::thread::scope(|scope| {
        for t in 0..2 {
            let allocator = &allocator;
            scope.spawn(move |_| {
                let handle = allocator.allocate_handle(object(1000 + t)).unwrap();
                assert!(!handle.is_null());
            });
        }
    })
    .unwrap();

    assert_eq!(tracker.slots_used(), initial + 2);
    assert_eq!(tracker.handle_table().len(), 2 * INITIAL_HANDLE_TABLE_LENGTH);
}

#[test]
fn concurrent_handle_allocation_loses_no_values() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 1024;

    let domain = Domain::new("stress");
    let (allocator, tracker) = collectible_with_assembly(&domain, "stress.dll");

    let anchor = allocator.allocate_handle(object(usize::MAX / 8)).unwrap();

    let mut all = Vec::new();
    crossbeam_utils::thread::scope(|scope| {
        let mut workers = Vec::new();
        for t in 0..THREADS {
            let allocator = &allocator;
            workers.push(scope.spawn(move |_| {
                let mut local = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let value = object(1 + t * PER_THREAD + i);
                    let handle = allocator.allocate_handle(value).unwrap();
                    local.push((handle, value));
                }
                local
            }));
        }
        // Reads stay lock-free while the table keeps doubling.
        let reader = scope.spawn(|_| {
            for _ in 0..10_000 {
                assert_eq!(allocator.get_handle_value(anchor), object(usize::MAX / 8));
            }
        });
        for worker in workers {
            all.extend(worker.join().unwrap());
        }
        reader.join().unwrap();
    })
    .unwrap();

    assert_eq!(tracker.slots_used() as usize, THREADS * PER_THREAD + 1);

    let mut indices = hashbrown::HashSet::new();
    for (handle, value) in &all {
        assert!(indices.insert(handle.index()), "duplicate handle index");
        assert_eq!(allocator.get_handle_value(*handle), *value);
    }
}

#[test]
fn the_handle_ceiling_reports_out_of_memory() {
    let domain = Domain::new("ceiling");
    let (allocator, tracker) = collectible_with_assembly(&domain, "ceiling.dll");

    tracker.set_slots_used(MAX_LOADER_HANDLES);
    assert_eq!(
        allocator.allocate_handle(object(1)),
        Err(Error::OutOfMemory)
    );
}

#[test]
fn handle_allocation_after_managed_collection_returns_the_null_token() {
    let domain = Domain::new("dead-alloc");
    let (allocator, tracker) = collectible_with_assembly(&domain, "dead.dll");

    let survivor = allocator.allocate_handle(object(5)).unwrap();

    // Pin the native side so only the managed tracker goes away.
    assert!(allocator.add_reference_if_alive());
    drop(tracker);

    assert!(allocator.is_alive());
    let handle = allocator.allocate_handle(object(6)).unwrap();
    assert!(handle.is_null());
    assert_eq!(allocator.get_handle_value(survivor), ObjectRef::null());

    assert!(allocator.release());
    crate::sweep::gc_loader_allocators(&allocator);
}

#[test]
fn non_collectible_allocators_use_pinned_handles() {
    let domain = Domain::new("global");
    let global = LoaderAllocator::global(&domain).unwrap();

    let value = object(77);
    let handle = global.allocate_handle(value).unwrap();
    assert!(handle.is_pinned());
    assert_eq!(global.get_handle_value(handle), value);

    let replacement = object(78);
    let previous = global.compare_exchange_handle_value(handle, replacement, value);
    assert_eq!(previous, value);
    assert_eq!(global.get_handle_value(handle), replacement);

    global.free_handle(handle);
    assert_eq!(global.get_handle_value(handle), ObjectRef::null());

    assert!(global.executable_heap().is_some());
    assert!(!global.can_unload());
}

#[test]
fn ensure_reference_transfers_exactly_one_count() {
    let domain = Domain::new("once");
    let (a, _a_tracker) = collectible_with_assembly(&domain, "a.dll");
    let (b, _b_tracker) = collectible_with_assembly(&domain, "b.dll");

    assert!(a.ensure_reference(&b).unwrap());
    assert_eq!(b.reference_count(), 2);
    assert!(!a.ensure_reference(&b).unwrap());
    assert_eq!(b.reference_count(), 2);

    // Self-references and non-collectible targets are refused.
    assert!(!a.ensure_reference(&a).unwrap());
    let global = LoaderAllocator::global(&domain).unwrap();
    assert!(!a.ensure_reference(&global).unwrap());
    assert_eq!(a.reference_count(), 1);
}

#[test]
fn ensure_instantiation_covers_every_distinct_loader_allocator() {
    let domain = Domain::new("inst");
    let (this, _t1) = collectible_with_assembly(&domain, "this.dll");
    let (defining, _t2) = collectible_with_assembly(&domain, "defining.dll");
    let (arg, _t3) = collectible_with_assembly(&domain, "arg.dll");
    let global = LoaderAllocator::global(&domain).unwrap();

    let added = this
        .ensure_instantiation(
            Some(&defining),
            &[Arc::clone(&arg), Arc::clone(&this), Arc::clone(&global)],
        )
        .unwrap();
    assert!(added);
    assert_eq!(defining.reference_count(), 2);
    assert_eq!(arg.reference_count(), 2);
    assert_eq!(this.reference_count(), 1);
    assert_eq!(global.reference_count(), u32::MAX);

    // Idempotent.
    assert!(!this
        .ensure_instantiation(Some(&defining), &[Arc::clone(&arg)])
        .unwrap());
}

#[test]
fn depends_on_is_transitive_and_directional() {
    let domain = Domain::new("depends");
    let (a, _t1) = collectible_with_assembly(&domain, "a.dll");
    let (b, _t2) = collectible_with_assembly(&domain, "b.dll");
    let (c, _t3) = collectible_with_assembly(&domain, "c.dll");

    assert!(a.ensure_reference(&b).unwrap());
    assert!(b.ensure_reference(&c).unwrap());

    assert!(a.depends_on(&a));
    assert!(a.depends_on(&c));
    assert!(a.may_reference_type_of(&b));
    assert!(!c.depends_on(&a));
}

#[test]
fn failed_type_init_entries_are_unlinked_at_teardown() {
    let domain = Domain::new("class-init");
    let (allocator, tracker) = collectible_with_assembly(&domain, "fail.dll");

    let entry = ClassInitLockEntry::new("Broken.Type");
    domain.register_class_init_lock(&entry);
    allocator.register_failed_type_init(&entry);
    assert_eq!(domain.class_init_lock_count(), 1);

    drop(tracker);
    assert_eq!(domain.class_init_lock_count(), 0);
}

#[test]
fn estimate_size_tracks_arenas_and_interned_strings() {
    let domain = Domain::new("estimate");
    let (allocator, _tracker) = collectible_with_assembly(&domain, "size.dll");

    assert_eq!(allocator.estimate_size(), 0);
    allocator.high_frequency_heap().allocate(128).unwrap();
    let with_arena = allocator.estimate_size();
    assert!(with_arena > 0);

    let interned = allocator.get_or_intern_string("literal", object(30));
    assert_eq!(interned, object(30));
    assert_eq!(allocator.get_or_intern_string("literal", object(31)), object(30));
    assert!(allocator.estimate_size() > with_arena);

    // Collectible allocators alias the low-frequency heap.
    assert!(std::ptr::eq(
        allocator.low_frequency_heap(),
        allocator.high_frequency_heap()
    ));
}

#[test]
fn derived_type_walks_cross_allocators() {
    let domain = Domain::new("derived");
    let (a, _t1) = collectible_with_assembly(&domain, "base.dll");
    let (b, _t2) = collectible_with_assembly(&domain, "derived.dll");

    let base = TypeToken(0xD000_0001);
    let mid = TypeToken(0xD000_0002);
    let leaf = TypeToken(0xD000_0003);
    a.add_derived_type_info(base, mid);
    b.add_derived_type_info(mid, leaf);

    let mut seen = Vec::new();
    assert!(a.walk_derived_types(base, &mut |ty| {
        seen.push(ty);
        true
    }));
    assert!(seen.contains(&mid));

    let mut seen_from_mid = Vec::new();
    assert!(a.walk_derived_types(mid, &mut |ty| {
        seen_from_mid.push(ty);
        true
    }));
    assert!(seen_from_mid.contains(&leaf));
}

#[test]
fn stub_caches_are_created_lazily_and_survive_until_teardown() {
    let domain = Domain::new("stubs");
    let (allocator, tracker) = collectible_with_assembly(&domain, "stubs.dll");

    let stubs = allocator.func_ptr_stubs();
    stubs.create_stub(allocator.stub_heap(), 64).unwrap();
    assert_eq!(allocator.func_ptr_stubs().count(), 1);

    let thunk = allocator
        .um_thunk_cache()
        .get_or_create(0xBEEF, allocator.stub_heap(), 32)
        .unwrap();
    let again = allocator
        .um_thunk_cache()
        .get_or_create(0xBEEF, allocator.stub_heap(), 32)
        .unwrap();
    assert_eq!(thunk, again);

    let helpers = allocator.dynamic_helpers_heap().unwrap();
    helpers.allocate(16).unwrap();

    allocator.init_virtual_call_stub_manager();
    assert!(allocator.virtual_call_stub_manager_size() > 0);

    drop(tracker);
    assert!(allocator.is_terminated());
    assert_eq!(allocator.virtual_call_stub_manager_size(), 0);
}
