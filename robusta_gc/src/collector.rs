//! The cycle collector.
//!
//! Cycle collection is refcount-based mark and scan over the heap itself. Under stop-the-world,
//! the collector copies every tracked object's refcount into its scratch word and subtracts one
//! for every reference held by another tracked object; objects left with a positive scratch count
//! are externally rooted, and everything transitively reachable from them survives. The rest are
//! partitioned, their weakrefs cleared, their finalizers run with the world resumed, resurrection
//! detected under a second pause, and the survivors' cycles broken with the world running again.
//!
//! Collections are serialized by an atomic flag; concurrent triggers return zero collected.

use crate::config::{CollectionInfo, Configuration, DebugFlags, GenerationStats};
use crate::error::{Error, Result};
use crate::heap::{self, HeapTag};
use crate::object::{self, GcBits, ObjectRef};
use crate::runtime::Runtime;
use crate::shared_keys;
use crate::thread::ThreadHandle;
use crate::weakref;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicU32, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Collection threshold floor.
const THRESHOLD_FLOOR: isize = 7000;

/// Why a collection was started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Reason {
    /// The live-object count crossed the threshold
    Heap,
    /// An explicit `collect` call
    Manual,
    /// The final collection before runtime teardown
    Shutdown,
}

/// Callback invoked around collections with a phase (`"start"` or `"stop"`) and counts.
pub type GcCallback = Arc<dyn Fn(&str, &CollectionInfo) + Send + Sync>;

/// Collector state owned by the runtime.
pub(crate) struct GcState {
    enabled: AtomicBool,
    /// Gates re-entry; one collection at a time
    collecting: AtomicBool,
    live: AtomicIsize,
    threshold: AtomicIsize,
    scale: AtomicI32,
    debug: AtomicU32,
    /// Unreachable-but-uncollectable objects, for the user to inspect
    pub(crate) garbage: Mutex<Vec<ObjectRef>>,
    callbacks: Mutex<Vec<GcCallback>>,
    stats: Mutex<GenerationStats>,
}

impl GcState {
    pub(crate) fn new(config: &Configuration) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            collecting: AtomicBool::new(false),
            live: AtomicIsize::new(0),
            threshold: AtomicIsize::new(config.threshold),
            scale: AtomicI32::new(config.scale),
            debug: AtomicU32::new(0),
            garbage: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            stats: Mutex::new(GenerationStats::default()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    pub(crate) fn live(&self) -> isize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn add_live(&self, delta: isize) {
        self.live.fetch_add(delta, Ordering::Relaxed);
    }

    /// Raw comparison against the threshold. A zero threshold is never reached "disabled": every
    /// allocation qualifies.
    pub(crate) fn should_collect(&self) -> bool {
        self.live.load(Ordering::Relaxed) >= self.threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn threshold(&self) -> isize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_threshold(&self, threshold: isize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub(crate) fn debug_flags(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.debug.load(Ordering::Relaxed))
    }

    pub(crate) fn set_debug(&self, flags: u32) {
        self.debug.store(flags, Ordering::Relaxed);
    }

    pub(crate) fn get_debug(&self) -> u32 {
        self.debug.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> GenerationStats {
        *self.stats.lock()
    }

    pub(crate) fn register_callback(&self, callback: GcCallback) {
        self.callbacks.lock().push(callback);
    }

    pub(crate) fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    fn snapshot_callbacks(&self) -> Vec<GcCallback> {
        self.callbacks.lock().clone()
    }

    fn update_threshold(&self) {
        let live = self.live.load(Ordering::Relaxed);
        let scale = self.scale.load(Ordering::Relaxed) as isize;
        let threshold = (live + live * scale / 100).max(THRESHOLD_FLOOR);
        self.threshold.store(threshold, Ordering::Relaxed);
    }
}

/// Transient work structures of one collection.
struct Collection {
    /// Scratch queue for breadth-first marking
    work: VecDeque<ObjectRef>,
    /// Objects currently believed unreachable
    unreachable: Vec<ObjectRef>,
    /// Weakrefs whose callbacks must fire
    wrcb_to_call: Vec<ObjectRef>,
    collected: usize,
    uncollectable: usize,
    long_lived: usize,
}

/// Runs user code, routing panics to the unraisable hook instead of unwinding through the
/// collector.
pub(crate) fn call_unraisable(rt: &Runtime, context: &str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        rt.report_unraisable(context, &message);
    }
}

fn invoke_callbacks(rt: &Runtime, phase: &str, collected: usize, uncollectable: usize) {
    let callbacks = rt.gc.snapshot_callbacks();
    if callbacks.is_empty() {
        return;
    }
    let info = CollectionInfo {
        generation: 0,
        collected,
        uncollectable,
    };
    for callback in callbacks {
        call_unraisable(rt, "collection callback", || callback(phase, &info));
    }
}

fn reason_is_valid(rt: &Runtime, reason: Reason) -> bool {
    match reason {
        Reason::Heap => rt.gc.is_enabled() && rt.gc.should_collect(),
        Reason::Manual | Reason::Shutdown => true,
    }
}

/// Merges every thread's deferred-work queue, including queues orphaned by exited threads.
fn merge_queued_objects(rt: &Runtime, to_dealloc: &mut Vec<ObjectRef>) {
    {
        let list = rt.registry.list.lock();
        for state in &list.threads {
            state.queue.process(rt, to_dealloc);
        }
    }
    let orphans: Vec<_> = rt.orphan_queues.lock().drain(..).collect();
    for queue in orphans {
        queue.process(rt, to_dealloc);
    }
    rt.stray_queue.process(rt, to_dealloc);
}

fn dealloc_non_gc(rt: &Runtime, to_dealloc: &mut Vec<ObjectRef>) {
    for op in to_dealloc.drain(..) {
        object::dealloc(rt, op);
    }
}

/// Root discovery: computes each tracked object's external refcount in its scratch word and marks
/// live split-keys blocks. Returns the number of keys blocks marked.
fn find_gc_roots(rt: &Runtime, reason: Reason) -> usize {
    let mut split_marked = 0;
    let _ = heap::visit_heaps(rt, HeapTag::Gc, true, &mut |block, _size| {
        let Some(block) = block else {
            return ControlFlow::Continue(());
        };
        let op = ObjectRef::from_block(block);
        // Split keys are marked through every dict that references them, tracked or not.
        if let Some(split) = op.type_desc().split_keys {
            if let Some(keys) = split(op) {
                if keys.is_tracked() && !keys.is_marked() {
                    keys.set_marked(true);
                    split_marked += 1;
                }
            }
        }
        if !op.is_tracked() {
            return ControlFlow::Continue(());
        }
        if let Some(policy) = op.type_desc().maybe_untrack {
            if policy(op) {
                object::untrack(rt, op);
                op.header().clear_bit(GcBits::FINALIZED);
                return ControlFlow::Continue(());
            }
        }
        if reason == Reason::Shutdown && op.header().has_bit(GcBits::DEFERRED) {
            // Deferred accounting ends at shutdown; the last references must really count.
            object::merge_refcount(op, 0);
        }
        let refcount = object::effective_refcount(op);
        debug_assert!(refcount >= 0, "negative refcount on {op:?}");
        if !op.is_unreachable() {
            op.set_owner_tid(0);
            op.header().set_bit(GcBits::UNREACHABLE);
        }
        op.add_gc_refs(refcount);
        // Subtract internal references; objects left positive are externally rooted.
        let _ = op.traverse(&mut |child| {
            if child.is_tracked() {
                child.gc_decref();
            }
            ControlFlow::Continue(())
        });
        ControlFlow::Continue(())
    });
    split_marked
}

/// Breadth-first revival of everything reachable from `op`.
fn mark_reachable_from(op: ObjectRef, work: &mut VecDeque<ObjectRef>) {
    work.push_back(op);
    while let Some(current) = work.pop_front() {
        let _ = current.traverse(&mut |child| {
            if child.is_tracked() && child.is_unreachable() {
                child.header().clear_bit(GcBits::UNREACHABLE);
                child.set_gc_refs(0);
                work.push_back(child);
            }
            ControlFlow::Continue(())
        });
    }
}

/// Marks every object reachable from an external root.
fn mark_heap_reachable(rt: &Runtime, cx: &mut Collection) {
    let _ = heap::visit_heaps(rt, HeapTag::Gc, true, &mut |block, _size| {
        let Some(block) = block else {
            return ControlFlow::Continue(());
        };
        let op = ObjectRef::from_block(block);
        if !op.is_tracked() || op.gc_refs() == 0 || !op.is_unreachable() {
            return ControlFlow::Continue(());
        }
        debug_assert!(op.gc_refs() > 0, "refcount is too small on {op:?}");
        op.header().clear_bit(GcBits::UNREACHABLE);
        op.set_gc_refs(0);
        mark_reachable_from(op, &mut cx.work);
        ControlFlow::Continue(())
    });
}

/// Restores an object's owning thread from its page after the collection zeroed it.
fn restore_tid(op: ObjectRef) {
    let shared = op.header().shared_word();
    if object::is_merged(shared) {
        op.set_owner_tid(0);
    } else {
        let owner = heap::page_of(op.as_raw()).meta().owner_tid.load(Ordering::Relaxed);
        if owner == 0 {
            // The owning thread is gone; fold the biased count so any thread may release it.
            object::merge_refcount(op, 0);
        } else {
            op.set_owner_tid(owner);
        }
    }
}

/// Partitions the tracked population: reachable objects have their owner restored, legacy
/// finalizer objects go to the garbage list, the rest queue up as unreachable.
fn scan_heap(rt: &Runtime, cx: &mut Collection) {
    let debug_flags = rt.gc.debug_flags();
    let _ = heap::visit_heaps(rt, HeapTag::Gc, true, &mut |block, _size| {
        let Some(block) = block else {
            return ControlFlow::Continue(());
        };
        let op = ObjectRef::from_block(block);
        if !op.is_tracked() {
            return ControlFlow::Continue(());
        }
        restore_tid(op);
        if !op.is_unreachable() {
            cx.long_lived += 1;
        } else if op.type_desc().legacy_del {
            // Unreachable, but the legacy finalizer makes it unsafe to reclaim. The user has to
            // deal with it through the garbage list.
            op.header().clear_bit(GcBits::UNREACHABLE);
            cx.uncollectable += 1;
            if debug_flags.contains(DebugFlags::UNCOLLECTABLE) {
                debug!("uncollectable {op:?}");
            }
            object::incref_shared(op);
            rt.gc.garbage.lock().push(op);
        } else {
            cx.unreachable.push(op);
        }
        ControlFlow::Continue(())
    });
    // Approximate allocation order for the later passes.
    cx.unreachable.reverse();
}

/// Clears weakrefs to the unreachable set and queues the callbacks that may fire. Every
/// unreachable object is pinned with one merged reference so the later passes can hold it.
fn clear_weakrefs(rt: &Runtime, cx: &mut Collection) {
    let debug_flags = rt.gc.debug_flags();
    for &op in &cx.unreachable {
        object::merge_refcount(op, 1);
        if debug_flags.contains(DebugFlags::COLLECTABLE) {
            debug!("collectable {op:?}");
        }
        if weakref::is_weakref(op) {
            // A dying weakref must not fire or resurrect anything.
            weakref::detach(rt, op);
        }
        if !op.type_desc().weakref_support {
            continue;
        }
        for wr in weakref::refs_to(rt, op) {
            if !weakref::has_callback(wr) {
                continue;
            }
            if wr.is_unreachable() {
                // The weakref is trash itself; firing its callback could expose cleared objects.
                continue;
            }
            object::incref(wr);
            cx.wrcb_to_call.push(wr);
        }
        weakref::clear_all(rt, op, false);
    }
}

fn call_weakref_callbacks(rt: &Runtime, cx: &mut Collection) {
    for wr in cx.wrcb_to_call.drain(..) {
        if let Some(callback) = weakref::take_callback(wr) {
            call_unraisable(rt, "weakref callback", move || callback(wr));
        }
        object::decref(rt, wr);
    }
}

/// Runs first-time finalizers on the unreachable set.
fn finalize_garbage(rt: &Runtime, cx: &Collection) {
    for &op in &cx.unreachable {
        if op.is_finalized() {
            continue;
        }
        if let Some(finalize) = op.type_desc().finalize {
            op.header().set_bit(GcBits::FINALIZED);
            call_unraisable(rt, "finalizer", || finalize(rt, op));
        }
    }
}

/// Finds objects revived by finalizers or callbacks and marks everything reachable from them.
fn handle_resurrected_objects(cx: &mut Collection) {
    for &op in &cx.unreachable {
        debug_assert_eq!(op.gc_refs(), 0);
        debug_assert!(op.is_unreachable());
        let refcount = object::effective_refcount(op);
        debug_assert!(refcount > 0, "pinned object lost its pin: {op:?}");
        // Undo the pin, then subtract references held by other unreachable objects.
        op.set_gc_refs(refcount - 1);
    }
    for &op in &cx.unreachable {
        let _ = op.traverse(&mut |child| {
            if child.is_unreachable() {
                child.gc_decref();
            }
            ControlFlow::Continue(())
        });
    }
    for &op in &cx.unreachable {
        let refs = op.gc_refs();
        debug_assert!(refs >= 0);
        restore_tid(op);
        if refs == 0 || !op.is_unreachable() {
            continue;
        }
        op.header().clear_bit(GcBits::UNREACHABLE);
        op.set_gc_refs(0);
        mark_reachable_from(op, &mut cx.work);
    }
}

/// Clears every thread's allocation caches and retires emptied pages.
fn clear_all_freelists(rt: &Runtime) {
    let list = rt.registry.list.lock();
    for state in &list.threads {
        for tag in [HeapTag::Gc, HeapTag::DictKeys] {
            let heap = state.heap(tag);
            heap.clear_free_cache();
            for page in heap.take_empty_pages() {
                rt.qsbr.retire_page(page);
            }
        }
    }
    drop(list);
    for page in rt.abandoned.take_empty_pages() {
        rt.qsbr.retire_page(page);
    }
}

/// Breaks the remaining cycles: saves everything when SaveAll is set, otherwise runs the clear
/// hooks, then drops the pins so destruction runs through the normal refcount path.
fn delete_garbage(rt: &Runtime, cx: &mut Collection) {
    let save_all = rt.gc.debug_flags().contains(DebugFlags::SAVE_ALL);
    for op in std::mem::take(&mut cx.unreachable) {
        if op.is_unreachable() {
            cx.collected += 1;
            op.header().clear_bit(GcBits::UNREACHABLE);
            op.set_gc_refs(0);
            debug_assert!(
                object::effective_refcount(op) > 0,
                "refcount is too small on {op:?}"
            );
            if save_all {
                object::incref_shared(op);
                rt.gc.garbage.lock().push(op);
            } else if let Some(clear) = op.type_desc().clear {
                call_unraisable(rt, "clear hook", || clear(rt, op));
            }
        }
        object::decref(rt, op);
    }
}

#[cfg(debug_assertions)]
fn validate_tracked_heap(rt: &Runtime) {
    let _ = heap::visit_tracked(rt, &mut |op| {
        debug_assert_eq!(op.gc_refs(), 0, "dirty scratch word on {op:?}");
        debug_assert!(!op.is_unreachable(), "stale unreachable flag on {op:?}");
        debug_assert!(object::effective_refcount(op) >= 0);
        ControlFlow::Continue(())
    });
}

#[cfg(debug_assertions)]
fn validate_refcount(rt: &Runtime) {
    let _ = heap::visit_tracked(rt, &mut |op| {
        debug_assert!(object::effective_refcount(op) > 0);
        ControlFlow::Continue(())
    });
}

/// The main collection function; read this to understand how the process works.
pub(crate) fn collect_main(rt: &Runtime, thread: &ThreadHandle, reason: Reason) -> Result<usize> {
    if thread.state.cant_stop.load(Ordering::Relaxed) > 0 {
        // This thread is inside a section that does not allow a collection.
        return Ok(0);
    }
    if rt
        .gc
        .collecting
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // A collection is already in progress.
        return Ok(0);
    }
    if !reason_is_valid(rt, reason) {
        rt.gc.collecting.store(false, Ordering::Release);
        return Ok(0);
    }

    let debug_flags = rt.gc.debug_flags();
    let start_time = Instant::now();
    let session = rt.world.lock_session();
    rt.world.stop_the_world(rt, &thread.state);

    if reason != Reason::Shutdown {
        invoke_callbacks(rt, "start", 0, 0);
    }
    if debug_flags.contains(DebugFlags::STATS) {
        debug!("collecting heap, live objects: {}", rt.gc.live());
    }

    let mut cx = Collection {
        work: VecDeque::new(),
        unreachable: Vec::new(),
        wrcb_to_call: Vec::new(),
        collected: 0,
        uncollectable: 0,
        long_lived: 0,
    };
    // Reserve the scratch structures up front; failing here leaves every object untouched.
    let live_estimate = rt.gc.live().max(0) as usize;
    if cx.unreachable.try_reserve(live_estimate).is_err() || cx.work.try_reserve(64).is_err() {
        rt.world.start_the_world(rt);
        drop(session);
        rt.gc.collecting.store(false, Ordering::Release);
        return Err(Error::OutOfMemory("collector work queues".to_string()));
    }

    // Merge cross-thread refcount traffic. Dead tracked objects fall out of root discovery; dead
    // untracked ones wait for the world to resume, since their destructors run arbitrary code.
    let mut to_dealloc = Vec::new();
    merge_queued_objects(rt, &mut to_dealloc);
    #[cfg(debug_assertions)]
    validate_tracked_heap(rt);

    let split_marked = find_gc_roots(rt, reason);
    let (dead_keys, split_survivors) = rt.shared_keys.find_dead();
    debug_assert_eq!(split_marked, split_survivors);

    mark_heap_reachable(rt, &mut cx);
    scan_heap(rt, &mut cx);
    clear_weakrefs(rt, &mut cx);

    // Restart the world to run weakref callbacks and finalizers.
    rt.world.start_the_world(rt);
    dealloc_non_gc(rt, &mut to_dealloc);
    call_weakref_callbacks(rt, &mut cx);
    finalize_garbage(rt, &cx);

    rt.world.stop_the_world(rt, &thread.state);
    #[cfg(debug_assertions)]
    validate_refcount(rt);
    handle_resurrected_objects(&mut cx);
    shared_keys::free_dead_keys(rt, dead_keys);
    // Single generation: every collection is the highest one.
    clear_all_freelists(rt);
    rt.world.start_the_world(rt);

    delete_garbage(rt, &mut cx);
    if reason == Reason::Manual {
        // More precise block accounting for explicit collect calls.
        for tag in [HeapTag::Gc, HeapTag::DictKeys] {
            let heap = thread.state.heap(tag);
            heap.clear_free_cache();
            for page in heap.take_empty_pages() {
                rt.qsbr.retire_page(page);
            }
        }
    }
    drop(session);

    if debug_flags.contains(DebugFlags::STATS) {
        debug!(
            "done, {} unreachable, {} uncollectable, {:?} elapsed",
            cx.collected + cx.uncollectable,
            cx.uncollectable,
            start_time.elapsed()
        );
    }

    // Make memory reclaimed this cycle visible to the other threads.
    rt.qsbr.advance();
    rt.qsbr.quiescent(&thread.state);
    rt.qsbr.poll(rt);

    {
        let mut stats = rt.gc.stats.lock();
        stats.collections += 1;
        stats.collected += cx.collected;
        stats.uncollectable += cx.uncollectable;
    }
    rt.gc.update_threshold();
    trace!(
        "collection finished: {} collected, {} uncollectable, {} long lived",
        cx.collected, cx.uncollectable, cx.long_lived
    );

    if reason != Reason::Shutdown {
        invoke_callbacks(rt, "stop", cx.collected, cx.uncollectable);
    }
    rt.gc.collecting.store(false, Ordering::Release);
    Ok(cx.collected + cx.uncollectable)
}

/// Heap walk collecting every tracked object; each entry carries a new reference.
pub(crate) fn get_objects(rt: &Runtime) -> Vec<ObjectRef> {
    let mut objects = Vec::new();
    let _ = heap::visit_tracked(rt, &mut |op| {
        object::incref(op);
        objects.push(op);
        ControlFlow::Continue(())
    });
    objects
}

/// Heap walk collecting the tracked objects that directly refer to any of `targets`; each entry
/// carries a new reference.
pub(crate) fn get_referrers(rt: &Runtime, targets: &[ObjectRef]) -> Vec<ObjectRef> {
    let mut referrers = Vec::new();
    let _ = heap::visit_tracked(rt, &mut |op| {
        if targets.contains(&op) {
            return ControlFlow::Continue(());
        }
        let mut hit = false;
        let _ = op.traverse(&mut |child| {
            if targets.contains(&child) {
                hit = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        if hit {
            object::incref(op);
            referrers.push(op);
        }
        ControlFlow::Continue(())
    });
    referrers
}

/// Objects directly referred to by `targets`; each entry carries a new reference.
pub(crate) fn get_referents(targets: &[ObjectRef]) -> Vec<ObjectRef> {
    let mut referents = Vec::new();
    for op in targets {
        let _ = op.traverse(&mut |child| {
            object::incref(child);
            referents.push(child);
            ControlFlow::Continue(())
        });
    }
    referents
}

/// Heap-walk containment check.
pub(crate) fn find_object(rt: &Runtime, target: ObjectRef) -> bool {
    let mut found = false;
    let _ = heap::visit_tracked(rt, &mut |op| {
        if op == target {
            found = true;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found
}

/// The final collection before teardown: collects with error reporting suppressed, logs any
/// garbage left behind, then releases the garbage and callback lists.
pub(crate) fn shutdown(rt: &Runtime, thread: &ThreadHandle) -> usize {
    let unreachable = collect_main(rt, thread, Reason::Shutdown).unwrap_or(0);
    let debug_flags = rt.gc.debug_flags();
    let garbage: Vec<ObjectRef> = std::mem::take(&mut *rt.gc.garbage.lock());
    if !debug_flags.contains(DebugFlags::SAVE_ALL) && !garbage.is_empty() {
        warn!("{} uncollectable objects at shutdown", garbage.len());
        if debug_flags.contains(DebugFlags::UNCOLLECTABLE) {
            for op in &garbage {
                debug!("shutdown garbage {op:?}");
            }
        }
    }
    for op in garbage {
        object::decref(rt, op);
    }
    rt.gc.clear_callbacks();
    unreachable
}
