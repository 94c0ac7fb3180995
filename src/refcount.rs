//! The tri-state native reference counter that anchors the allocator
//! lifecycle.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// The native object exists but the managed scout has not been published
/// yet.
const UNINITIALIZED: u32 = u32::MAX;

/// Native reference counter with three states: uninitialised
/// (`u32::MAX`), dead (`0`, never resurrected) and live (anything in
/// between). The counter alone may be mutated without any lock.
pub struct RefCount {
    count: CachePadded<AtomicU32>,
}

impl RefCount {
    pub fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicU32::new(UNINITIALIZED)),
        }
    }

    /// Publication of the managed scout: the scout itself becomes the
    /// first counted reference. Called exactly once.
    pub fn activate(&self) {
        let previous = self
            .count
            .compare_exchange(UNINITIALIZED, 1, Ordering::SeqCst, Ordering::SeqCst);
        assert!(
            previous.is_ok(),
            "managed tracking activated twice or after references were taken"
        );
    }

    /// The caller must already hold a live reference.
    pub fn add_reference(&self) {
        let old = self.count.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old > 0 && old != UNINITIALIZED);
    }

    /// Adds a reference only if the counter is non-zero. Wait-free CAS
    /// loop; this is the only way to take a reference without already
    /// owning one.
    pub fn add_reference_if_alive(&self) -> bool {
        loop {
            let snapshot = self.count.load(Ordering::SeqCst);
            debug_assert_ne!(snapshot, UNINITIALIZED);
            if snapshot == 0 {
                return false;
            }
            if self
                .count
                .compare_exchange_weak(snapshot, snapshot + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drops one reference. Returns true iff this was the last one; the
    /// caller decides whether to run the sweep.
    pub fn release(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0 && old != UNINITIALIZED);
        old == 1
    }

    pub fn is_alive(&self) -> bool {
        self.count.load(Ordering::SeqCst) != 0
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_lifecycle_transitions() {
        let count = RefCount::new();
        assert_eq!(count.get(), UNINITIALIZED);
        assert!(count.is_alive());

        count.activate();
        assert_eq!(count.get(), 1);

        count.add_reference();
        assert_eq!(count.get(), 2);

        assert!(!count.release());
        assert!(count.release());
        assert!(!count.is_alive());
    }

    #[test]
    fn add_reference_if_alive_refuses_the_dead() {
        let count = RefCount::new();
        count.activate();
        assert!(count.add_reference_if_alive());
        assert_eq!(count.get(), 2);

        count.release();
        assert!(count.release());
        assert!(!count.add_reference_if_alive());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn contended_add_reference_if_alive_never_resurrects() {
        use std::sync::Arc;

        let count = Arc::new(RefCount::new());
        count.activate();
        for _ in 0..7 {
            count.add_reference();
        }

        let adders: Vec<_> = (0..4)
            .map(|_| {
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    let mut added = 0u32;
                    for _ in 0..1000 {
                        if count.add_reference_if_alive() {
                            added += 1;
                            count.release();
                        }
                    }
                    added
                })
            })
            .collect();
        for _ in 0..8 {
            count.release();
        }
        for adder in adders {
            adder.join().unwrap();
        }
        assert_eq!(count.get(), 0);
    }
}
