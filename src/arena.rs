//! Bump-pointer arenas for runtime metadata and stubs.
//!
//! An arena drains a sub-range of the owning group's reservation. Pages are
//! committed lazily as the bump pointer crosses the commit watermark and are
//! only returned to the OS when the arena is retired.

use std::ptr::NonNull;

use atomic::Atomic;

use crate::{
    error::{Error, Result},
    mmap::{os_page_size, Mmap},
};

pub const ARENA_ALIGNMENT: usize = 16;

pub struct LoaderArena {
    name: &'static str,
    begin: *mut u8,
    pos: Atomic<*mut u8>,
    limit: *mut u8,
    committed: Atomic<*mut u8>,
    // The reservation outlives every arena carved from it; the group keeps
    // it boxed so this pointer stays stable when the group moves.
    map: *const Mmap,
}

impl LoaderArena {
    pub(crate) fn new(name: &'static str, map: &Mmap, begin: *mut u8, reserve: usize) -> Self {
        Self {
            name,
            begin,
            pos: Atomic::new(begin),
            limit: (begin as usize + reserve) as *mut u8,
            committed: Atomic::new(begin),
            map,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    pub fn reserved(&self) -> usize {
        self.limit as usize - self.begin as usize
    }

    /// Committed bytes, the arena's contribution to `estimate_size`.
    pub fn size(&self) -> usize {
        self.committed.load(atomic::Ordering::Relaxed) as usize - self.begin as usize
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let size = round_up(size.max(1), ARENA_ALIGNMENT);
        let mut old_pos;
        let mut new_pos;
        while {
            old_pos = self.pos.load(atomic::Ordering::Relaxed);
            new_pos = (old_pos as usize + size) as *mut u8;
            if new_pos > self.limit {
                return Err(Error::OutOfMemory);
            }
            self.pos
                .compare_exchange_weak(
                    old_pos,
                    new_pos,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_err()
        } {}
        self.ensure_committed(new_pos);
        debug_assert_eq!(old_pos as usize % ARENA_ALIGNMENT, 0);
        Ok(unsafe { NonNull::new_unchecked(old_pos) })
    }

    fn ensure_committed(&self, target: *mut u8) {
        let page = os_page_size();
        loop {
            let committed = self.committed.load(atomic::Ordering::Acquire);
            if target <= committed {
                return;
            }
            let new_committed =
                round_up(target as usize, page).min(self.limit as usize) as *mut u8;
            unsafe {
                (*self.map).commit(committed, new_committed as usize - committed as usize);
            }
            if self
                .committed
                .compare_exchange(
                    committed,
                    new_committed,
                    atomic::Ordering::AcqRel,
                    atomic::Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
            // Lost the watermark race; the overlapping commit was harmless.
        }
    }

    /// Returns the committed pages to the OS and refuses further
    /// allocation. Called from allocator teardown.
    pub(crate) fn retire(&self) {
        self.pos.store(self.limit, atomic::Ordering::SeqCst);
        let committed = self.committed.load(atomic::Ordering::Acquire);
        if committed > self.begin {
            unsafe {
                (*self.map).dontneed(self.begin, committed as usize - self.begin as usize);
            }
        }
        self.committed.store(self.begin, atomic::Ordering::Release);
    }
}

unsafe impl Send for LoaderArena {}
unsafe impl Sync for LoaderArena {}

/// Classification of the code blocks a fragment arena hands out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StubCodeKind {
    Precode,
    DynamicHelper,
}

/// A bump arena for fixed-purpose code fragments. Unlike [`LoaderArena`] it
/// owns its reservation and carries the classification of every block it
/// allocates.
pub struct CodeFragmentArena {
    arena: LoaderArena,
    kind: StubCodeKind,
    map: Box<Mmap>,
}

impl CodeFragmentArena {
    pub fn new(kind: StubCodeKind, pages: usize) -> Result<Self> {
        let size = pages * os_page_size();
        let map = Box::new(Mmap::reserve(size).ok_or(Error::OutOfMemory)?);
        let arena = LoaderArena::new("code-fragment", &map, map.start(), size);
        Ok(Self { arena, kind, map })
    }

    pub fn kind(&self) -> StubCodeKind {
        self.kind
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.arena.allocate(size)
    }

    pub fn size(&self) -> usize {
        self.arena.size()
    }

    pub(crate) fn retire(&self) {
        self.arena.retire();
    }
}

/// Rounds `size` up to a multiple of `align`. Every alignment in this
/// crate (allocation granule, OS page, reservation granularity) is a
/// power of two.
#[inline(always)]
pub(crate) fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}
