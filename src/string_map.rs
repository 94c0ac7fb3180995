//! Per-allocator string-literal interning map.

use parking_lot::Mutex;

use crate::object::ObjectRef;

/// Maps literal data to the managed string that was interned for it. The
/// map never shrinks; entries die with the allocator.
pub struct StringLiteralMap {
    entries: Mutex<hashbrown::HashMap<String, ObjectRef, ahash::RandomState>>,
}

impl StringLiteralMap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(hashbrown::HashMap::default()),
        }
    }

    /// Returns the interned string for `data`, inserting `candidate` if no
    /// entry exists yet.
    pub fn get_or_intern(&self, data: &str, candidate: ObjectRef) -> ObjectRef {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(data) {
            return *existing;
        }
        entries.insert(data.to_owned(), candidate);
        candidate
    }

    pub fn lookup(&self, data: &str) -> Option<ObjectRef> {
        self.entries.lock().get(data).copied()
    }

    /// Rough native footprint, reported through `estimate_size`.
    pub fn size(&self) -> usize {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|(key, _)| key.len() + std::mem::size_of::<ObjectRef>())
            .sum()
    }
}

impl Default for StringLiteralMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_first_entry() {
        let map = StringLiteralMap::new();
        let first = ObjectRef::from_ptr(0x100 as *mut u8);
        let second = ObjectRef::from_ptr(0x200 as *mut u8);

        assert_eq!(map.get_or_intern("hello", first), first);
        assert_eq!(map.get_or_intern("hello", second), first);
        assert_eq!(map.lookup("hello"), Some(first));
        assert_eq!(map.lookup("world"), None);
        assert!(map.size() >= "hello".len());
    }
}
