//! The collector runtime: thread registry, stop-the-world state, heaps, and the public API.

use crate::collector::{self, GcCallback, GcState, Reason};
use crate::config::{Configuration, GenerationStats};
use crate::error::{Error, Result};
use crate::heap::AbandonedPool;
use crate::object::{self, ObjectRef};
use crate::qsbr::Qsbr;
use crate::queue::{WorkKind, WorkQueue};
use crate::shared_keys::{SharedKeysList, SharedKeysRef};
use crate::thread::{ThreadHandle, ThreadRegistry};
use crate::world::World;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::error;

/// Hook receiving failures from user code the collector invoked; arguments are a context string
/// and the panic message.
pub type UnraisableHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// A garbage-collected runtime. Mutator threads register with it, allocate objects from
/// per-thread heaps, and coordinate with the cycle collector through their handles.
pub struct Runtime {
    pub(crate) registry: ThreadRegistry,
    pub(crate) world: World,
    pub(crate) gc: GcState,
    pub(crate) abandoned: AbandonedPool,
    pub(crate) qsbr: Qsbr,
    pub(crate) shared_keys: SharedKeysList,
    /// Guards every weakref list and referent pointer
    pub(crate) weakref_lock: Mutex<()>,
    /// Deferred-work queues inherited from exited threads
    pub(crate) orphan_queues: Mutex<Vec<Arc<WorkQueue>>>,
    /// Deferred work whose owning thread was already gone
    pub(crate) stray_queue: WorkQueue,
    pub(crate) debug_allocator: bool,
    unraisable: RwLock<Option<UnraisableHook>>,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(Configuration::default())
    }

    /// Creates a runtime with a custom configuration.
    #[must_use]
    pub fn with_config(config: Configuration) -> Arc<Self> {
        Arc::new(Self {
            registry: ThreadRegistry::new(),
            world: World::new(),
            gc: GcState::new(&config),
            abandoned: AbandonedPool::default(),
            qsbr: Qsbr::new(),
            shared_keys: SharedKeysList::default(),
            weakref_lock: Mutex::new(()),
            orphan_queues: Mutex::new(Vec::new()),
            stray_queue: WorkQueue::new(),
            debug_allocator: config.debug_allocator,
            unraisable: RwLock::new(None),
        })
    }

    /// Registers the calling OS thread as a mutator. The handle starts detached; call
    /// [`ThreadHandle::attach`] before touching managed memory.
    #[must_use]
    pub fn register_thread(self: &Arc<Self>) -> ThreadHandle {
        let state = self.registry.register(self);
        ThreadHandle::new(Arc::clone(self), state)
    }

    /// Routes a deferred cross-thread decrement to the owning thread's queue.
    pub(crate) fn queue_deferred_decref(&self, owner_tid: u64, op: ObjectRef) {
        if owner_tid != 0 {
            if let Some(state) = self.registry.get(owner_tid) {
                state.queue.push(op, WorkKind::Decref);
                return;
            }
        }
        self.stray_queue.push(op, WorkKind::Decref);
    }

    pub(crate) fn adopt_orphan_queue(&self, queue: Arc<WorkQueue>) {
        self.orphan_queues.lock().push(queue);
    }

    /// Installs the hook receiving failures from user code run by the collector.
    pub fn set_unraisable_hook(&self, hook: Option<UnraisableHook>) {
        *self.unraisable.write() = hook;
    }

    pub(crate) fn report_unraisable(&self, context: &str, message: &str) {
        let hook = self.unraisable.read();
        if let Some(hook) = hook.as_ref() {
            hook(context, message);
        } else {
            error!("unraisable error in {context}: {message}");
        }
    }

    /// Takes a new strong reference to the object.
    pub fn incref(&self, op: ObjectRef) {
        object::incref(op);
    }

    /// Releases a strong reference, destroying the object at zero.
    pub fn decref(&self, op: ObjectRef) {
        object::decref(self, op);
    }

    /// Enters the object into the tracked set, making it visible to cycle collection.
    pub fn track(&self, op: ObjectRef) {
        object::track(self, op);
    }

    /// Removes the object from the tracked set; it is then managed purely by reference counting.
    pub fn untrack(&self, op: ObjectRef) {
        object::untrack(self, op);
    }

    /// Marks one unit of the object's refcount as borrowed from deferred accounting.
    pub fn enable_deferred_refcount(&self, op: ObjectRef) {
        object::enable_deferred_refcount(op);
    }

    /// Enters a split keys block into the tracked list so the sweep can reclaim it.
    pub fn track_shared_keys(&self, keys: SharedKeysRef) {
        self.shared_keys.track(keys);
    }

    /// Enables automatic collection; returns the previous state.
    pub fn enable(&self) -> bool {
        self.gc.set_enabled(true)
    }

    /// Disables automatic collection; returns the previous state. Explicit `collect` calls still
    /// run.
    pub fn disable(&self) -> bool {
        self.gc.set_enabled(false)
    }

    /// Returns whether automatic collection is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.gc.is_enabled()
    }

    /// Runs a full collection, returning the number of unreachable objects found (collected plus
    /// uncollectable).
    ///
    /// The `generation` argument is retained for API compatibility; values 0 through 2 are
    /// accepted and behave identically.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `generation` is outside `[0, 2]`; `OutOfMemory` if the collector's
    /// scratch structures could not be allocated.
    pub fn collect(&self, thread: &ThreadHandle, generation: isize) -> Result<usize> {
        if !(0..=2).contains(&generation) {
            return Err(Error::InvalidArgument(format!(
                "invalid generation {generation}"
            )));
        }
        collector::collect_main(self, thread, Reason::Manual)
    }

    /// Sets the debugging flags from a raw bitmask.
    pub fn set_debug(&self, flags: u32) {
        self.gc.set_debug(flags);
    }

    /// Returns the debugging flags as a raw bitmask.
    #[must_use]
    pub fn get_debug(&self) -> u32 {
        self.gc.get_debug()
    }

    /// Sets the collection threshold. Setting the threshold to zero disables collection.
    // The comparison is against the raw count, so a zero threshold in fact collects on every
    // allocation; callers relying on the documented behavior should disable() instead.
    pub fn set_threshold(&self, threshold: isize) {
        self.gc.set_threshold(threshold);
    }

    /// Returns the collection thresholds; the trailing generation slots are always zero.
    #[must_use]
    pub fn get_threshold(&self) -> (isize, isize, isize) {
        (self.gc.threshold(), 0, 0)
    }

    /// Returns the live tracked-object count; the trailing generation slots are always zero.
    #[must_use]
    pub fn get_count(&self) -> (isize, isize, isize) {
        (self.gc.live(), 0, 0)
    }

    /// Returns per-generation statistics; the collector is single-generation, so one entry.
    #[must_use]
    pub fn get_stats(&self) -> Vec<GenerationStats> {
        vec![self.gc.stats()]
    }

    /// Returns every tracked object. Each entry carries a new reference the caller releases with
    /// [`Runtime::decref`].
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `generation` is 3 or more, or below -1.
    pub fn get_objects(&self, generation: isize) -> Result<Vec<ObjectRef>> {
        if generation >= 3 {
            return Err(Error::InvalidArgument(format!(
                "generation parameter must be less than the number of available generations, got \
                 {generation}"
            )));
        }
        if generation < -1 {
            return Err(Error::InvalidArgument(
                "generation parameter cannot be negative".to_string(),
            ));
        }
        Ok(collector::get_objects(self))
    }

    /// Returns whether the object is tracked by the collector.
    #[must_use]
    pub fn is_tracked(&self, op: ObjectRef) -> bool {
        op.is_tracked()
    }

    /// Returns whether the object's finalizer has already run.
    #[must_use]
    pub fn is_finalized(&self, op: ObjectRef) -> bool {
        op.is_finalized()
    }

    /// Returns the tracked objects that directly refer to any of `targets`. Each entry carries a
    /// new reference.
    #[must_use]
    pub fn get_referrers(&self, targets: &[ObjectRef]) -> Vec<ObjectRef> {
        collector::get_referrers(self, targets)
    }

    /// Returns the objects directly referred to by `targets`. Each entry carries a new reference.
    #[must_use]
    pub fn get_referents(&self, targets: &[ObjectRef]) -> Vec<ObjectRef> {
        collector::get_referents(targets)
    }

    /// Accepted for API compatibility; the collector has no permanent generation.
    pub fn freeze(&self) {}

    /// Accepted for API compatibility; the collector has no permanent generation.
    pub fn unfreeze(&self) {}

    /// Number of objects in the permanent generation; always zero.
    #[must_use]
    pub fn get_freeze_count(&self) -> usize {
        0
    }

    /// Registers a callback invoked with `"start"` and `"stop"` phases around collections.
    pub fn register_callback(&self, callback: GcCallback) {
        self.gc.register_callback(callback);
    }

    /// Returns the unreachable-but-uncollectable objects found so far. The entries stay owned by
    /// the garbage list; clearing the list with [`Runtime::clear_garbage`] releases them.
    #[must_use]
    pub fn garbage(&self) -> Vec<ObjectRef> {
        self.gc.garbage.lock().clone()
    }

    /// Releases every object held by the garbage list.
    pub fn clear_garbage(&self) {
        let garbage: Vec<ObjectRef> = std::mem::take(&mut *self.gc.garbage.lock());
        for op in garbage {
            object::decref(self, op);
        }
    }

    /// Heap-walk containment check: whether `target` is a live tracked object.
    #[must_use]
    pub fn find_object(&self, target: ObjectRef) -> bool {
        collector::find_object(self, target)
    }

    /// Runs the final collection before teardown and releases the garbage and callback lists.
    /// Returns the number of unreachable objects found.
    pub fn shutdown(&self, thread: &ThreadHandle) -> usize {
        collector::shutdown(self, thread)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Every handle holds an Arc to the runtime, so no threads remain here. Return the page
        // memory; objects still referenced at teardown are deliberately leaked in place.
        self.qsbr.drain();
        for page in self.abandoned.drain_all() {
            crate::heap::free_page(page);
        }
    }
}
