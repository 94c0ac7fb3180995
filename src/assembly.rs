//! Assemblies bound to a loader allocator. Assemblies loaded into the same
//! load context form a chain hanging off their shared allocator.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::loader_allocator::LoaderAllocator;

pub struct DomainAssembly {
    name: String,
    dynamic: bool,
    loader_allocator: Mutex<Option<Arc<LoaderAllocator>>>,
    next_in_same_context: Mutex<Option<Arc<DomainAssembly>>>,
}

impl DomainAssembly {
    pub fn new(name: impl Into<String>, loader_allocator: &Arc<LoaderAllocator>) -> Arc<Self> {
        Self::with_dynamic(name, loader_allocator, false)
    }

    pub fn with_dynamic(
        name: impl Into<String>,
        loader_allocator: &Arc<LoaderAllocator>,
        dynamic: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dynamic,
            loader_allocator: Mutex::new(Some(Arc::clone(loader_allocator))),
            next_in_same_context: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dynamically-emitted assemblies have no backing binary and are never
    /// entered into the domain's file caches.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn loader_allocator(&self) -> Option<Arc<LoaderAllocator>> {
        self.loader_allocator.lock().clone()
    }

    pub(crate) fn next_in_same_context(&self) -> Option<Arc<DomainAssembly>> {
        self.next_in_same_context.lock().clone()
    }

    pub(crate) fn set_next_in_same_context(&self, next: Option<Arc<DomainAssembly>>) {
        *self.next_in_same_context.lock() = next;
    }

    /// Severs the back-reference to the allocator; called while the
    /// allocator reclaims its assemblies.
    pub(crate) fn detach(&self) {
        *self.loader_allocator.lock() = None;
        *self.next_in_same_context.lock() = None;
    }
}

/// Iterator over the assemblies in one load context. The successor is
/// prefetched so the current assembly may be unlinked mid-iteration.
pub struct DomainAssemblyIterator {
    current: Option<Arc<DomainAssembly>>,
    next: Option<Arc<DomainAssembly>>,
}

impl DomainAssemblyIterator {
    pub(crate) fn new(first: Option<Arc<DomainAssembly>>) -> Self {
        let next = first.as_ref().and_then(|assembly| assembly.next_in_same_context());
        Self { current: first, next }
    }
}

impl Iterator for DomainAssemblyIterator {
    type Item = Arc<DomainAssembly>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.take()?;
        self.current = self.next.take();
        self.next = self
            .current
            .as_ref()
            .and_then(|assembly| assembly.next_in_same_context());
        Some(current)
    }
}
