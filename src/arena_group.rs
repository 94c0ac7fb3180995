//! The per-allocator family of arenas, carved out of one contiguous
//! virtual reservation.

use std::ptr::null_mut;

use atomic::Atomic;

use crate::{
    arena::{round_up, CodeFragmentArena, LoaderArena, StubCodeKind},
    error::{Error, Result},
    mmap::{os_page_size, Mmap, RESERVE_GRANULARITY},
};

/// Reservation sizes for each sub-arena, in OS pages.
#[derive(Clone, Copy, Debug)]
pub struct ArenaConfig {
    pub low_frequency_pages: usize,
    pub high_frequency_pages: usize,
    pub stub_pages: usize,
    pub executable_pages: usize,
    pub code_pages: usize,
    pub vsd_pages: usize,
    pub precode_pages: usize,
}

impl ArenaConfig {
    /// Collectible allocators reserve as little as possible; the
    /// low-frequency arena is aliased onto the high-frequency one.
    pub fn collectible() -> Self {
        Self {
            low_frequency_pages: 0,
            high_frequency_pages: 3,
            stub_pages: 1,
            executable_pages: 0,
            code_pages: 7,
            vsd_pages: 5,
            precode_pages: 2,
        }
    }

    pub fn non_collectible() -> Self {
        Self {
            low_frequency_pages: 16,
            high_frequency_pages: 16,
            stub_pages: 8,
            executable_pages: 0,
            code_pages: 0,
            vsd_pages: 0,
            precode_pages: 4,
        }
    }

    /// The process-wide allocator additionally carries the executable
    /// arena, which is not associated with any range list.
    pub fn global() -> Self {
        Self {
            executable_pages: 1,
            ..Self::non_collectible()
        }
    }
}

/// One reservation, drained by the sub-arenas in a fixed placement order:
/// code, virtual-stub-dispatch, low-frequency, executable, high-frequency,
/// stub. The code and virtual-stub-dispatch ranges are not arenas; they are
/// pre-carved blocks handed to the execution manager exactly once.
pub struct ArenaGroup {
    low_frequency: Option<LoaderArena>,
    high_frequency: LoaderArena,
    stub: LoaderArena,
    executable: Option<LoaderArena>,
    precode: CodeFragmentArena,

    code_initial: Atomic<*mut u8>,
    code_initial_size: usize,
    vsd_initial: Atomic<*mut u8>,
    vsd_initial_size: usize,

    // Declared last so the address space is released only after the arenas
    // are gone.
    reservation: Box<Mmap>,
}

impl ArenaGroup {
    pub fn new(config: &ArenaConfig) -> Result<Self> {
        let page = os_page_size();
        let low_reserve = config.low_frequency_pages * page;
        let high_reserve = config.high_frequency_pages * page;
        let stub_reserve = config.stub_pages * page;
        let executable_reserve = config.executable_pages * page;
        let code_reserve = config.code_pages * page;
        let vsd_reserve = config.vsd_pages * page;

        let total = round_up(
            low_reserve + high_reserve + stub_reserve + executable_reserve + code_reserve
                + vsd_reserve,
            RESERVE_GRANULARITY,
        );
        let reservation = Box::new(Mmap::reserve(total).ok_or(Error::OutOfMemory)?);

        let mut cursor = reservation.start();
        let mut carve = |bytes: usize| {
            let begin = cursor;
            cursor = (cursor as usize + bytes) as *mut u8;
            begin
        };

        let code_initial = if code_reserve != 0 { carve(code_reserve) } else { null_mut() };
        let vsd_initial = if vsd_reserve != 0 { carve(vsd_reserve) } else { null_mut() };

        let low_frequency = if low_reserve != 0 {
            Some(LoaderArena::new(
                "low-frequency",
                &reservation,
                carve(low_reserve),
                low_reserve,
            ))
        } else {
            None
        };

        let executable = if executable_reserve != 0 {
            Some(LoaderArena::new(
                "executable",
                &reservation,
                carve(executable_reserve),
                executable_reserve,
            ))
        } else {
            None
        };

        let high_frequency = LoaderArena::new(
            "high-frequency",
            &reservation,
            carve(high_reserve),
            high_reserve,
        );
        let stub = LoaderArena::new("stub", &reservation, carve(stub_reserve), stub_reserve);

        let precode = CodeFragmentArena::new(StubCodeKind::Precode, config.precode_pages)?;

        // The code and virtual-stub-dispatch blocks are committed up front;
        // the execution manager expects usable memory when it steals them.
        if code_reserve != 0 {
            reservation.commit(code_initial, code_reserve);
        }
        if vsd_reserve != 0 {
            reservation.commit(vsd_initial, vsd_reserve);
        }

        Ok(Self {
            low_frequency,
            high_frequency,
            stub,
            executable,
            precode,
            code_initial: Atomic::new(code_initial),
            code_initial_size: code_reserve,
            vsd_initial: Atomic::new(vsd_initial),
            vsd_initial_size: vsd_reserve,
            reservation,
        })
    }

    /// The low-frequency arena, or the high-frequency one when the two are
    /// aliased (collectible allocators).
    pub fn low_frequency(&self) -> &LoaderArena {
        self.low_frequency.as_ref().unwrap_or(&self.high_frequency)
    }

    pub fn high_frequency(&self) -> &LoaderArena {
        &self.high_frequency
    }

    pub fn stub(&self) -> &LoaderArena {
        &self.stub
    }

    /// Only the process-wide allocator carries an executable arena.
    pub fn executable(&self) -> Option<&LoaderArena> {
        self.executable.as_ref()
    }

    pub fn precode(&self) -> &CodeFragmentArena {
        &self.precode
    }

    /// One-shot steal of the pre-carved virtual-stub-dispatch block.
    pub fn steal_vsd_initial_block(&self) -> Option<(*mut u8, usize)> {
        let block = self.vsd_initial.swap(null_mut(), atomic::Ordering::SeqCst);
        if block.is_null() {
            None
        } else {
            Some((block, self.vsd_initial_size))
        }
    }

    /// One-shot steal of the pre-carved code block, subject to the
    /// execution manager's placement constraints.
    pub fn steal_code_initial_block(
        &self,
        lo_addr: *const u8,
        hi_addr: *const u8,
        minimum_size: usize,
    ) -> Option<(*mut u8, usize)> {
        if minimum_size > self.code_initial_size {
            return None;
        }
        let current = self.code_initial.load(atomic::Ordering::Relaxed);
        if current.is_null() {
            return None;
        }
        if !lo_addr.is_null() || !hi_addr.is_null() {
            if (current as *const u8) < lo_addr {
                return None;
            }
            if ((current as usize + self.code_initial_size) as *const u8) > hi_addr {
                return None;
            }
        }
        let block = self.code_initial.swap(null_mut(), atomic::Ordering::SeqCst);
        if block.is_null() {
            None
        } else {
            Some((block, self.code_initial_size))
        }
    }

    /// Committed bytes across the sub-arenas.
    pub fn estimate_size(&self) -> usize {
        let mut total = self.high_frequency.size() + self.stub.size() + self.precode.size();
        if let Some(low) = &self.low_frequency {
            total += low.size();
        }
        if let Some(executable) = &self.executable {
            total += executable.size();
        }
        total
    }

    pub fn reservation_size(&self) -> usize {
        self.reservation.size()
    }

    /// Retires every arena in reverse placement order and returns the
    /// committed pages; the reservation itself is released on drop.
    pub(crate) fn retire(&self) {
        self.stub.retire();
        self.high_frequency.retire();
        if let Some(executable) = &self.executable {
            executable.retire();
        }
        if let Some(low) = &self.low_frequency {
            low.retire();
        }
        self.precode.retire();
    }
}
