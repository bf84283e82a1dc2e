//! Mutator thread states and the thread status machine.
//!
//! Every mutator registers with the runtime and receives a [`ThreadHandle`]. The handle's status
//! word has three states: Attached (running managed code), Detached (released the runtime, e.g.
//! around a blocking call), and Parked (suspended for the collector). All transitions go through
//! compare-and-swap on the status word; threads that lose the race to attach park on the word
//! itself and retry once the collector releases them.
//!
//! A thread must not be suspended while it holds a can't-stop guard; the collector falls back to
//! signalling the eval breaker, and the mutator parks itself at its next safe point.

use crate::collector;
use crate::heap::{Heap, HeapTag, NUM_HEAP_TAGS};
use crate::object::{self, ObjectRef, PAYLOAD_ALIGN, TypeDescriptor};
use crate::queue::WorkQueue;
use crate::runtime::Runtime;
use crate::shared_keys::{self, SharedKeysRef};
use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Thread status values held in the status word.
pub(crate) const STATUS_DETACHED: usize = 0;
pub(crate) const STATUS_ATTACHED: usize = 1;
pub(crate) const STATUS_PARKED: usize = 2;

thread_local! {
    static CURRENT_TID: Cell<u64> = const { Cell::new(0) };
}

/// Thread ids are process-wide so a stale id can never alias a thread of another runtime.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime-assigned id of the calling OS thread, or zero if unregistered.
pub(crate) fn current_thread_id() -> u64 {
    CURRENT_TID.with(Cell::get)
}

/// Shared per-thread state: the status word, heaps, deferred-work queue, and QSBR token.
pub(crate) struct ThreadState {
    pub(crate) id: u64,
    pub(crate) status: AtomicUsize,
    /// Set by the coordinator to request a self-park at the next safe point
    pub(crate) eval_breaker: AtomicBool,
    /// Nonzero while the thread is inside a reentrancy-hostile section
    pub(crate) cant_stop: AtomicU32,
    /// QSBR sequence last observed by this thread; zero while offline
    pub(crate) qsbr_seq: AtomicU64,
    pub(crate) queue: Arc<WorkQueue>,
    heaps: [Heap; NUM_HEAP_TAGS],
}

impl ThreadState {
    fn new(id: u64, initial_status: usize, debug_allocator: bool) -> Self {
        Self {
            id,
            status: AtomicUsize::new(initial_status),
            eval_breaker: AtomicBool::new(false),
            cant_stop: AtomicU32::new(0),
            qsbr_seq: AtomicU64::new(0),
            queue: Arc::new(WorkQueue::new()),
            heaps: [
                Heap::new(HeapTag::Gc, id, debug_allocator),
                Heap::new(HeapTag::DictKeys, id, debug_allocator),
            ],
        }
    }

    pub(crate) fn heap(&self, tag: HeapTag) -> &Heap {
        &self.heaps[tag as usize]
    }

    pub(crate) fn status(&self) -> usize {
        self.status.load(Ordering::Acquire)
    }

    /// Blocks while the status word reads Parked.
    pub(crate) fn park_while_parked(&self) {
        let addr = std::ptr::from_ref(&self.status) as usize;
        // Safety: the callbacks do not panic and do not call into the parking lot.
        unsafe {
            parking_lot_core::park(
                addr,
                || self.status.load(Ordering::Acquire) == STATUS_PARKED,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                None,
            );
        }
    }

    /// Wakes every thread parked on the status word.
    pub(crate) fn unpark_all(&self) {
        let addr = std::ptr::from_ref(&self.status) as usize;
        // Safety: unpark_all has no invariants beyond the key being stable.
        unsafe {
            parking_lot_core::unpark_all(addr, DEFAULT_UNPARK_TOKEN);
        }
    }
}

/// Thread list plus the stop-the-world countdown it protects.
pub(crate) struct ThreadList {
    pub(crate) threads: Vec<Arc<ThreadState>>,
    /// Mutators the coordinator is still waiting on
    pub(crate) countdown: isize,
}

/// Registry of live mutator threads.
pub(crate) struct ThreadRegistry {
    pub(crate) list: Mutex<ThreadList>,
    index: DashMap<u64, Arc<ThreadState>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(ThreadList {
                threads: Vec::new(),
                countdown: 0,
            }),
            index: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<ThreadState>> {
        self.index.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn register(&self, rt: &Runtime) -> Arc<ThreadState> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let mut list = self.list.lock();
        // A thread arriving during a stop starts parked; it joins the world when the collector
        // releases everyone.
        let initial = if rt.world.stop_requested() {
            STATUS_PARKED
        } else {
            STATUS_DETACHED
        };
        let state = Arc::new(ThreadState::new(id, initial, rt.debug_allocator));
        list.threads.push(Arc::clone(&state));
        self.index.insert(id, Arc::clone(&state));
        trace!("registered mutator thread {id}");
        state
    }
}

/// Handle owned by a mutator OS thread. Dropping the handle unlinks the thread and abandons its
/// heaps to the runtime.
pub struct ThreadHandle {
    runtime: Arc<Runtime>,
    pub(crate) state: Arc<ThreadState>,
    /// Bound to the registering OS thread
    _not_send: PhantomData<*const ()>,
}

impl ThreadHandle {
    pub(crate) fn new(runtime: Arc<Runtime>, state: Arc<ThreadState>) -> Self {
        CURRENT_TID.with(|tid| tid.set(state.id));
        Self {
            runtime,
            state,
            _not_send: PhantomData,
        }
    }

    /// The runtime this thread belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The runtime-assigned thread id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Returns `true` while the thread is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.status() == STATUS_ATTACHED
    }

    /// Attaches the thread, blocking while the collector holds it parked.
    pub fn attach(&self) {
        loop {
            if self
                .state
                .status
                .compare_exchange(
                    STATUS_DETACHED,
                    STATUS_ATTACHED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.runtime.qsbr.online(&self.state);
                return;
            }
            debug_assert_ne!(
                self.state.status(),
                STATUS_ATTACHED,
                "thread {} attached twice",
                self.state.id
            );
            self.state.park_while_parked();
        }
    }

    /// Detaches the thread at a release point. If a stop-the-world is pending, the thread parks
    /// itself on the way out and may be the one to notify the coordinator.
    pub fn detach(&self) {
        debug_assert_eq!(self.state.status(), STATUS_ATTACHED);
        self.runtime.qsbr.offline(&self.state);
        self.state.status.store(STATUS_DETACHED, Ordering::Release);
        if self.runtime.world.stop_requested() {
            let mut list = self.runtime.registry.list.lock();
            if self.runtime.world.stop_requested()
                && self
                    .state
                    .status
                    .compare_exchange(
                        STATUS_DETACHED,
                        STATUS_PARKED,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                list.countdown -= 1;
                debug_assert!(list.countdown >= 0);
                if list.countdown == 0 {
                    self.runtime.world.notify_stopped();
                }
            }
        }
    }

    /// Safe point hook for the interpreter loop: parks the thread if the collector asked for a
    /// stop.
    pub fn safe_point(&self) {
        if self.state.eval_breaker.swap(false, Ordering::AcqRel) {
            self.stop_for_collector();
        }
    }

    fn stop_for_collector(&self) {
        debug_assert_eq!(self.state.status(), STATUS_ATTACHED);
        debug_assert_eq!(
            self.state.cant_stop.load(Ordering::Relaxed),
            0,
            "self-park inside a can't-stop section"
        );
        let rt = &self.runtime;
        {
            let list = rt.registry.list.lock();
            if list.countdown <= 0 {
                // Stale signal from a previous stop; nothing to do.
                return;
            }
        }
        rt.qsbr.offline(&self.state);
        self.state.status.store(STATUS_PARKED, Ordering::Release);
        {
            let mut list = rt.registry.list.lock();
            list.countdown -= 1;
            debug_assert!(list.countdown >= 0);
            if list.countdown == 0 {
                rt.world.notify_stopped();
            }
        }
        // Wait until the collector switches us back to Detached, then re-attach.
        loop {
            self.state.park_while_parked();
            if self
                .state
                .status
                .compare_exchange(
                    STATUS_DETACHED,
                    STATUS_ATTACHED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                rt.qsbr.online(&self.state);
                return;
            }
        }
    }

    /// Enters a section during which this thread must not be stopped, such as allocator internals.
    #[must_use]
    pub fn cant_stop_guard(&self) -> CantStopGuard<'_> {
        self.state.cant_stop.fetch_add(1, Ordering::Relaxed);
        CantStopGuard { state: &self.state }
    }

    /// Allocates an untracked object with a local refcount of one.
    ///
    /// # Panics
    ///
    /// If `T` requires more than 16-byte alignment.
    pub fn alloc_object<T: Send + Sync>(
        &self,
        ty: &'static TypeDescriptor,
        value: T,
    ) -> ObjectRef {
        debug_assert!(self.is_attached(), "allocation from a detached thread");
        assert!(
            align_of::<T>() <= PAYLOAD_ALIGN,
            "payload alignment above {PAYLOAD_ALIGN} is not supported"
        );
        let size = object::PAYLOAD_OFFSET + size_of::<T>();
        let block = self.state.heap(HeapTag::Gc).alloc(size);
        let op = unsafe { object::init_object(block, ty, self.state.id) };
        unsafe { op.payload_ptr().cast::<T>().write(value) };
        op
    }

    /// Allocates an object and enters it into the tracked set, running a collection if the
    /// live-object count crossed the threshold.
    pub fn alloc_tracked<T: Send + Sync>(
        &self,
        ty: &'static TypeDescriptor,
        value: T,
    ) -> ObjectRef {
        let op = self.alloc_object(ty, value);
        self.runtime.track(op);
        if self.runtime.gc.is_enabled() && self.runtime.gc.should_collect() {
            if let Err(error) = collector::collect_main(&self.runtime, self, collector::Reason::Heap)
            {
                tracing::warn!("allocation-triggered collection failed: {error}");
            }
        }
        op
    }

    /// Allocates a split keys block with `extra` payload bytes from the dict-keys heap.
    #[must_use]
    pub fn alloc_shared_keys(&self, extra: usize) -> SharedKeysRef {
        debug_assert!(self.is_attached(), "allocation from a detached thread");
        let block = self
            .state
            .heap(HeapTag::DictKeys)
            .alloc(shared_keys::KEYS_PAYLOAD_OFFSET + extra);
        unsafe { shared_keys::init_keys(block) }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let rt = Arc::clone(&self.runtime);
        if self.state.status() == STATUS_ATTACHED {
            self.detach();
        }
        rt.registry.index.remove(&self.state.id);
        {
            let mut list = rt.registry.list.lock();
            list.threads.retain(|t| t.id != self.state.id);
            // A coordinator may be counting on us; settle the countdown on the way out.
            if rt.world.stop_requested() && self.state.status() != STATUS_PARKED {
                list.countdown -= 1;
                debug_assert!(list.countdown >= 0);
                if list.countdown == 0 {
                    rt.world.notify_stopped();
                }
            }
        }
        // Keep the deferred-work queue alive for the next collection; other threads may still be
        // pushing into it.
        rt.adopt_orphan_queue(Arc::clone(&self.state.queue));
        for tag in [HeapTag::Gc, HeapTag::DictKeys] {
            let heap = self.state.heap(tag);
            heap.clear_free_cache();
            rt.abandoned.abandon(heap.take_all_pages());
        }
        CURRENT_TID.with(|tid| tid.set(0));
        trace!("unregistered mutator thread {}", self.state.id);
    }
}

/// RAII guard for a reentrancy-hostile section; the collector will not suspend the thread while
/// one is held.
pub struct CantStopGuard<'a> {
    state: &'a ThreadState,
}

impl Drop for CantStopGuard<'_> {
    fn drop(&mut self) {
        self.state.cant_stop.fetch_sub(1, Ordering::Relaxed);
    }
}
