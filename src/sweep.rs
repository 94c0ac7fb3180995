//! The allocator collector: a two-phase trace over the native reference
//! graph, run when a release drops some allocator's count to zero,
//! followed by detach, notification and reclaim of everything that proved
//! unreachable.

use std::sync::Arc;

use crate::{domain::Domain, loader_allocator::LoaderAllocator};

/// Collects every unreferenced allocator reachable from `original`'s
/// domain, deletes their assemblies and remaining resources, and drains
/// the domain's pending-delete list. `original` is the allocator whose
/// release hit zero; it joins the to-destroy chain even if it never
/// loaded an assembly.
pub fn gc_loader_allocators(original: &Arc<LoaderAllocator>) {
    let domain = Arc::clone(original.domain());

    // Phases M, S and D. Allocators on the returned chain are no longer
    // reachable through the assembly list.
    let mut first_to_destroy = remove_assemblies(&domain);

    // Phase N: unload events and debugger notification. The unloaded flag
    // must be set before the debugger observes any teardown.
    let mut original_on_chain = false;
    let mut cursor = first_to_destroy.clone();
    while let Some(current) = cursor {
        debug_assert!(!current.is_alive());
        domain.engine().unload_event(&current);
        current.set_unloaded();

        for assembly in iterate_deletion_chain(&current) {
            domain.engine().notify_debugger_unload(&assembly);
        }

        if Arc::ptr_eq(&current, original) {
            original_on_chain = true;
        }
        cursor = current.destroy_next().lock().clone();
    }

    // The trigger may own no assemblies at all; it is still dead and must
    // be reclaimed with the rest.
    if !original_on_chain && !original.is_alive() {
        *original.destroy_next().lock() = first_to_destroy.take();
        first_to_destroy = Some(Arc::clone(original));
    }

    // Phase R: reclaim.
    let mut cursor = first_to_destroy;
    while let Some(current) = cursor {
        debug_assert!(!current.is_alive());

        current.delete_assemblies();
        current.release_managed_load_context();

        let engine = domain.engine();
        let suspend = !engine.at_process_exit();
        if suspend {
            // The only intentional stop-the-world in the protocol: cache
            // purges must observe a quiescent heap.
            engine.suspend();
        }

        engine.unload_code_manager(&current);
        current.uninit_virtual_call_stub_manager();
        domain.clear_jit_caches();

        if suspend {
            engine.restart();
        }

        let next = current.destroy_next().lock().take();
        domain.register_loader_allocator_for_deletion(&current);
        cursor = next;
    }

    // Final destructor invocation for everything queued above.
    domain.shutdown_free_loader_allocators();
}

/// Phases M, S and D: marks allocators reachable from live roots, chains
/// the unmarked dead ones, and removes their assemblies from the domain.
/// Returns the head of the to-destroy chain.
fn remove_assemblies(domain: &Arc<Domain>) -> Option<Arc<LoaderAllocator>> {
    // Phase M: every collectible allocator that is natively alive is a
    // root; mark it and everything its reference set reaches.
    {
        let assemblies = domain.assembly_list().lock();
        for assembly in assemblies.iter() {
            let allocator = match assembly.loader_allocator() {
                Some(allocator) => allocator,
                None => continue,
            };
            if allocator.is_collectible() && allocator.is_alive() {
                mark_reachable(&allocator);
            }
        }
    }

    let mut first_to_destroy: Option<Arc<LoaderAllocator>> = None;

    // Phase S: unmark survivors and chain the dead. Multiple assemblies
    // may share one allocator; the chain walk below keeps it linked once.
    {
        let _references_lock = domain.loader_allocator_references_lock().lock();
        let assemblies = domain.assembly_list().lock();

        for assembly in assemblies.iter() {
            let allocator = match assembly.loader_allocator() {
                Some(allocator) => allocator,
                None => continue,
            };
            if !allocator.is_collectible() {
                continue;
            }
            if allocator.is_marked() {
                allocator.clear_mark();
            } else if !allocator.is_alive() {
                let mut already_chained = false;
                let mut check = first_to_destroy.clone();
                while let Some(candidate) = check {
                    if Arc::ptr_eq(&candidate, &allocator) {
                        already_chained = true;
                        break;
                    }
                    check = candidate.destroy_next().lock().clone();
                }

                if !already_chained {
                    debug_assert!(allocator.first_assembly_to_delete().is_some());
                    *allocator.destroy_next().lock() = first_to_destroy.take();
                    first_to_destroy = Some(allocator);
                }
            }
        }

        // Allocators that never loaded an assembly are not visited above;
        // drop any mark the trace left on them so the next sweep starts
        // clean.
        for allocator in crate::loader_allocator::active_loader_allocators() {
            if Arc::ptr_eq(allocator.domain(), domain) {
                allocator.clear_mark();
            }
        }
    }

    // Phase D: detach. The chained allocators are unreachable outside
    // this sweep once their assemblies leave the domain list.
    let mut cursor = first_to_destroy.clone();
    while let Some(current) = cursor {
        debug_assert!(!current.is_alive());

        for assembly in iterate_deletion_chain(&current) {
            domain.remove_assembly(&assembly);
            if !assembly.is_dynamic() {
                domain.uncache_file(assembly.name());
                domain.remove_native_image_dependency(assembly.name());
            }
        }

        cursor = current.destroy_next().lock().clone();
    }

    first_to_destroy
}

/// Marks `root` and everything transitively reachable through reference
/// sets. Iterative with the mark bit as the visited set; reference sets
/// are small but graphs may be deep.
fn mark_reachable(root: &Arc<LoaderAllocator>) {
    let mut worklist = vec![Arc::clone(root)];
    while let Some(current) = worklist.pop() {
        if !current.try_mark() {
            continue;
        }
        let references = current.references().lock();
        for target in references.targets() {
            if !target.is_marked() {
                worklist.push(Arc::clone(target));
            }
        }
    }
}

fn iterate_deletion_chain(
    allocator: &Arc<LoaderAllocator>,
) -> crate::assembly::DomainAssemblyIterator {
    crate::assembly::DomainAssemblyIterator::new(allocator.first_assembly_to_delete())
}
