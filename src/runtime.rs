//! The surrounding execution engine, seen through the narrow interface the
//! reclaim pass needs: stop-the-world suspension, memory-pressure
//! accounting, and the side-effecting unload callbacks.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::{assembly::DomainAssembly, loader_allocator::LoaderAllocator};

/// Memory pressure charged against the managed collector for each tracker
/// published by `setup_managed_tracking`.
pub const MANAGED_TRACKING_PRESSURE: usize = 30_000;

type AllocatorCallback = Box<dyn Fn(&LoaderAllocator) + Send + Sync>;
type AssemblyCallback = Box<dyn Fn(&DomainAssembly) + Send + Sync>;

/// Callbacks into the embedding runtime, invoked during sweep. All default
/// to no-ops.
#[derive(Default)]
pub struct RuntimeHooks {
    /// The unload event fired once per torn-down allocator, before the
    /// debugger is notified.
    pub on_unload: Option<AllocatorCallback>,
    /// Debugger notification, once per assembly of a torn-down allocator.
    pub notify_debugger_unload: Option<AssemblyCallback>,
    /// `ExecutionManager::unload`: the JIT drops its per-allocator code
    /// manager while the engine is suspended.
    pub unload_code_manager: Option<AllocatorCallback>,
}

/// Suspension barrier and pressure accounting for one runtime instance.
pub struct ExecutionEngine {
    suspension_depth: AtomicI32,
    suspension_mutex: Mutex<()>,
    cv_resume: Condvar,
    at_process_exit: AtomicBool,
    memory_pressure: AtomicUsize,
    pub hooks: RuntimeHooks,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_hooks(RuntimeHooks::default())
    }

    pub fn with_hooks(hooks: RuntimeHooks) -> Self {
        Self {
            suspension_depth: AtomicI32::new(0),
            suspension_mutex: Mutex::new(()),
            cv_resume: Condvar::new(),
            at_process_exit: AtomicBool::new(false),
            memory_pressure: AtomicUsize::new(0),
            hooks,
        }
    }

    /// Brings the engine to a stop so cache purges observe a quiescent
    /// heap. Reentrant; only the outermost suspend arms the barrier.
    pub fn suspend(&self) {
        let guard = self.suspension_mutex.lock();
        self.suspension_depth.fetch_add(1, Ordering::AcqRel);
        drop(guard);
    }

    pub fn restart(&self) {
        let guard = self.suspension_mutex.lock();
        let old = self.suspension_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
        if old == 1 {
            self.cv_resume.notify_all();
        }
        drop(guard);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_depth.load(Ordering::Acquire) > 0
    }

    /// Blocks the calling thread until no suspension scope is active.
    pub fn wait_until_running(&self) {
        let mut guard = self.suspension_mutex.lock();
        while self.suspension_depth.load(Ordering::Acquire) > 0 {
            self.cv_resume.wait(&mut guard);
        }
    }

    /// During process exit the engine is never suspended; a fault in that
    /// window would be fatal anyway.
    pub fn set_at_process_exit(&self) {
        self.at_process_exit.store(true, Ordering::Release);
    }

    pub fn at_process_exit(&self) -> bool {
        self.at_process_exit.load(Ordering::Acquire)
    }

    pub fn add_memory_pressure(&self, bytes: usize) {
        self.memory_pressure.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn remove_memory_pressure(&self, bytes: usize) {
        let old = self.memory_pressure.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(old >= bytes);
    }

    pub fn memory_pressure(&self) -> usize {
        self.memory_pressure.load(Ordering::Acquire)
    }

    pub(crate) fn unload_event(&self, allocator: &LoaderAllocator) {
        if let Some(hook) = &self.hooks.on_unload {
            hook(allocator);
        }
    }

    pub(crate) fn notify_debugger_unload(&self, assembly: &DomainAssembly) {
        if let Some(hook) = &self.hooks.notify_debugger_unload {
            hook(assembly);
        }
    }

    pub(crate) fn unload_code_manager(&self, allocator: &LoaderAllocator) {
        if let Some(hook) = &self.hooks.unload_code_manager {
            hook(allocator);
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}
