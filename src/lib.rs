//! Collectible loader allocators for implementing managed runtimes in
//! Rust.
//!
//! A [`LoaderAllocator`] owns all permanent native memory backing one
//! dynamically loaded code unit: a family of bump arenas for metadata,
//! stubs and precodes, a table of strong references anchoring managed
//! objects from native structures, and the allocator's node in the native
//! reference graph that decides when the unit may be unloaded.
//!
//! The phases of an unloadable assembly's allocator:
//!
//! 1. Managed allocator alive. The tracker object is reachable; handles
//!    can be allocated; `add_reference_if_alive` succeeds.
//! 2. Managed scout alive, managed allocator dying. Everything managed
//!    about the assembly is dead or about to disappear; the scout's
//!    finalizer has not run yet.
//! 3. Native allocator alive, managed scout collected. Kept alive only by
//!    native references (dynamic methods, stubs, iterators). Detected by
//!    a live count with a published assembly-deletion list. This phase is
//!    skipped when no such reference exists at finalization time.
//! 4. Dead. The count reached zero; the allocator can never become alive
//!    again and is torn down by the next sweep, together with everything
//!    mutually unreachable with it.
//!
//! Transitions are strictly monotonic. The embedder stands in for the
//! managed collector: dropping the last `Arc` of a tracker object is the
//! managed allocator's collection, and cycles among trackers are the
//! embedder's to break, exactly as managed cycles are the managed
//! collector's.

pub mod arena;
pub mod arena_group;
pub mod assembly;
pub mod domain;
pub mod error;
pub mod handle;
pub mod index_stack;
pub mod loader_allocator;
pub mod mmap;
pub mod object;
pub mod refcount;
pub mod runtime;
pub mod string_map;
pub mod stubs;
pub mod sweep;
pub mod tracking;

#[cfg(test)]
mod tests;

pub use arena::{CodeFragmentArena, LoaderArena, StubCodeKind};
pub use arena_group::{ArenaConfig, ArenaGroup};
pub use assembly::{DomainAssembly, DomainAssemblyIterator};
pub use domain::{ClassInitLockEntry, Domain};
pub use error::{Error, Result};
pub use handle::{LoaderHandle, MAX_LOADER_HANDLES};
pub use loader_allocator::{
    active_loader_allocators, AllocatorId, AllocatorKind, LoadContextBinder, LoaderAllocator,
    TypeToken,
};
pub use object::ObjectRef;
pub use runtime::{ExecutionEngine, RuntimeHooks, MANAGED_TRACKING_PRESSURE};
pub use sweep::gc_loader_allocators;
pub use tracking::{GcHandle, LoaderAllocatorObject};
