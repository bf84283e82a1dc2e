//! Object headers, type descriptors, and biased reference counting.
//!
//! Every collector-managed object is a heap block that starts with an [`ObjectHeader`]. The header
//! carries a pointer to the object's [`TypeDescriptor`], the owning-thread id, a biased reference
//! count (a non-atomic local count owned by the owning thread plus an atomic shared count that
//! absorbs cross-thread traffic), a byte of collector flags, and a scratch word used only while a
//! collection is running.
//!
//! The shared count is shifted left by two; the low bits hold the Merged flag (the local count has
//! been folded into the shared word and the object no longer has an owning thread) and the Queued
//! flag (a cross-thread decrement found the shared count at zero and was deferred to the owning
//! thread's work queue).

use crate::heap;
use crate::runtime::Runtime;
use crate::shared_keys::SharedKeysRef;
use crate::thread;
use crate::weakref;
use bitflags::bitflags;
use std::fmt;
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering};

pub(crate) const SHARED_SHIFT: u32 = 2;
pub(crate) const SHARED_MERGED: isize = 0b01;
pub(crate) const SHARED_QUEUED: isize = 0b10;

#[inline]
pub(crate) fn shared_count(shared: isize) -> isize {
    shared >> SHARED_SHIFT
}

#[inline]
pub(crate) fn is_merged(shared: isize) -> bool {
    shared & SHARED_MERGED != 0
}

bitflags! {
    /// Collector flags stored in the object header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct GcBits: u8 {
        /// The object participates in cycle collection
        const TRACKED = 1;
        /// The object's finalizer has run
        const FINALIZED = 2;
        /// Set during a collection while the object is a reclamation candidate
        const UNREACHABLE = 4;
        /// One unit of the refcount is borrowed from deferred accounting
        const DEFERRED = 8;
    }
}

/// Result type of traversal visitors; `Break` aborts the traversal.
pub type VisitResult = ControlFlow<()>;

/// Visits every owned child reference of an object.
pub type TraverseFn = fn(ObjectRef, &mut dyn FnMut(ObjectRef) -> VisitResult) -> VisitResult;

/// Static description of an object type: how to traverse, clear, finalize, and drop it.
///
/// Types whose objects are tracked must supply a `traverse` that visits every owned child
/// reference. The remaining hooks are optional.
pub struct TypeDescriptor {
    /// Type name used in diagnostics
    pub name: &'static str,
    /// Visits every owned child reference
    pub traverse: TraverseFn,
    /// Breaks reference cycles by dropping the object's owned references
    pub clear: Option<fn(&Runtime, ObjectRef)>,
    /// Finalizer; runs at most once per object lifetime
    pub finalize: Option<fn(&Runtime, ObjectRef)>,
    /// Legacy finalizer marker; unreachable objects of such types are uncollectable
    pub legacy_del: bool,
    /// Whether objects of this type may be the referent of weak references
    pub weakref_support: bool,
    /// Policy deciding whether an object can leave the tracked set during root discovery
    pub maybe_untrack: Option<fn(ObjectRef) -> bool>,
    /// Accessor for a dict-like object's split keys block
    pub split_keys: Option<fn(ObjectRef) -> Option<SharedKeysRef>>,
    /// Drops the payload in place
    pub drop: unsafe fn(*mut u8),
}

impl TypeDescriptor {
    /// Creates a descriptor with the mandatory hooks; the optional hooks default to `None`.
    #[must_use]
    pub const fn new(name: &'static str, traverse: TraverseFn, drop: unsafe fn(*mut u8)) -> Self {
        Self {
            name,
            traverse,
            clear: None,
            finalize: None,
            legacy_del: false,
            weakref_support: false,
            maybe_untrack: None,
            split_keys: None,
            drop,
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("legacy_del", &self.legacy_del)
            .field("weakref_support", &self.weakref_support)
            .finish()
    }
}

/// Traversal for leaf types with no owned child references.
pub fn traverse_noop(_op: ObjectRef, _visit: &mut dyn FnMut(ObjectRef) -> VisitResult) -> VisitResult {
    ControlFlow::Continue(())
}

/// Drops a payload of type `T` in place.
///
/// # Safety
///
/// `ptr` must point to a valid, initialized `T` that is not dropped again afterwards.
pub unsafe fn drop_payload<T>(ptr: *mut u8) {
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) }
}

/// Header at the start of every collector-managed heap block.
#[repr(C)]
pub struct ObjectHeader {
    ty: &'static TypeDescriptor,
    /// Owning thread id; zero when the refcount is merged or the owning thread has exited
    tid: AtomicU64,
    /// Local refcount; written only by the owning thread, so relaxed atomics stand in for a
    /// plain field
    ref_local: AtomicU32,
    /// Shared refcount, shifted by two with Merged and Queued flags in the low bits
    ref_shared: AtomicIsize,
    gc_bits: AtomicU8,
    /// Collector scratch word; zero outside a collection
    gc_refs: AtomicIsize,
    /// Head of the list of weak references to this object
    pub(crate) weaklist: AtomicPtr<ObjectHeader>,
}

/// Offset of the payload within an object block.
pub(crate) const PAYLOAD_OFFSET: usize = size_of::<ObjectHeader>().next_multiple_of(16);

/// Maximum payload alignment supported by the block layout.
pub(crate) const PAYLOAD_ALIGN: usize = 16;

impl ObjectHeader {
    #[inline]
    pub(crate) fn bits(&self) -> GcBits {
        GcBits::from_bits_truncate(self.gc_bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn has_bit(&self, bit: GcBits) -> bool {
        self.bits().contains(bit)
    }

    #[inline]
    pub(crate) fn set_bit(&self, bit: GcBits) {
        self.gc_bits.fetch_or(bit.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_bit(&self, bit: GcBits) {
        self.gc_bits.fetch_and(!bit.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn shared_word(&self) -> isize {
        self.ref_shared.load(Ordering::Relaxed)
    }
}

/// A reference to a collector-managed object.
///
/// `ObjectRef` is a plain copyable handle, like a borrowed object pointer inside a language
/// runtime; it does not own a reference count. Operations that hand out new references say so in
/// their documentation, and callers balance them with [`Runtime::decref`].
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// Safety: ObjectRef is an address; all shared mutation of the header goes through atomics, and
// payload access is the embedder's responsibility (payloads use their own synchronization).
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub(crate) fn from_header(ptr: NonNull<ObjectHeader>) -> Self {
        Self(ptr)
    }

    /// Reconstructs an object reference from a raw heap block pointer.
    pub(crate) fn from_block(block: NonNull<u8>) -> Self {
        Self(block.cast())
    }

    #[inline]
    pub(crate) fn header(&self) -> &ObjectHeader {
        // Safety: the header lives until the block is freed, and a freed block is never reachable
        // through a live ObjectRef under the refcount and collection protocols.
        unsafe { self.0.as_ref() }
    }

    /// Returns the object's type descriptor.
    #[must_use]
    pub fn type_desc(&self) -> &'static TypeDescriptor {
        self.header().ty
    }

    /// Returns the raw header address, for identity comparison and diagnostics.
    #[must_use]
    pub fn as_raw(&self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline]
    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        // Safety: blocks are always allocated with room for the header plus the payload.
        unsafe { self.as_raw().add(PAYLOAD_OFFSET) }
    }

    /// Returns a reference to the object's payload.
    ///
    /// # Safety
    ///
    /// `T` must be the payload type the object was allocated with, and the object must be alive.
    #[must_use]
    pub unsafe fn payload<T>(&self) -> &T {
        unsafe { &*self.payload_ptr().cast::<T>() }
    }

    /// Returns `true` if the object participates in cycle collection.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.header().has_bit(GcBits::TRACKED)
    }

    /// Returns `true` if the object's finalizer has already run.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.header().has_bit(GcBits::FINALIZED)
    }

    #[inline]
    pub(crate) fn is_unreachable(&self) -> bool {
        self.header().has_bit(GcBits::UNREACHABLE)
    }

    #[inline]
    pub(crate) fn gc_refs(&self) -> isize {
        self.header().gc_refs.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_gc_refs(&self, refs: isize) {
        self.header().gc_refs.store(refs, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_gc_refs(&self, refs: isize) {
        self.header().gc_refs.fetch_add(refs, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn gc_decref(&self) {
        self.header().gc_refs.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn owner_tid(&self) -> u64 {
        self.header().tid.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_owner_tid(&self, tid: u64) {
        self.header().tid.store(tid, Ordering::Relaxed);
    }

    pub(crate) fn traverse(&self, visit: &mut dyn FnMut(ObjectRef) -> VisitResult) -> VisitResult {
        (self.type_desc().traverse)(*self, visit)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:#x}>", self.type_desc().name, self.as_raw() as usize)
    }
}

/// Writes a fresh header into a newly allocated block. The object starts with a local refcount of
/// one, biased to the allocating thread.
pub(crate) unsafe fn init_object(
    block: NonNull<u8>,
    ty: &'static TypeDescriptor,
    tid: u64,
) -> ObjectRef {
    let header = block.cast::<ObjectHeader>();
    unsafe {
        header.as_ptr().write(ObjectHeader {
            ty,
            tid: AtomicU64::new(tid),
            ref_local: AtomicU32::new(1),
            ref_shared: AtomicIsize::new(0),
            gc_bits: AtomicU8::new(0),
            gc_refs: AtomicIsize::new(0),
            weaklist: AtomicPtr::new(std::ptr::null_mut()),
        });
    }
    ObjectRef::from_header(header)
}

/// Effective refcount: local plus shared minus the deferred adjustment. Non-negative between
/// collection phases.
pub(crate) fn effective_refcount(op: ObjectRef) -> isize {
    let header = op.header();
    let local = header.ref_local.load(Ordering::Relaxed) as isize;
    let shared = shared_count(header.ref_shared.load(Ordering::Relaxed));
    let deferred = isize::from(header.has_bit(GcBits::DEFERRED));
    local + shared - deferred
}

/// Increments the refcount: the owning thread bumps the local count, everyone else the shared
/// count.
pub(crate) fn incref(op: ObjectRef) {
    let header = op.header();
    let tid = header.tid.load(Ordering::Relaxed);
    if tid != 0 && tid == thread::current_thread_id() {
        let local = header.ref_local.load(Ordering::Relaxed);
        header.ref_local.store(local + 1, Ordering::Relaxed);
    } else {
        header.ref_shared.fetch_add(1 << SHARED_SHIFT, Ordering::AcqRel);
    }
}

/// Unconditionally bumps the shared count. Used where the caller is known not to be the owner,
/// such as collector-held lists.
pub(crate) fn incref_shared(op: ObjectRef) {
    op.header().ref_shared.fetch_add(1 << SHARED_SHIFT, Ordering::AcqRel);
}

/// Decrements the refcount, deallocating the object when it reaches zero.
pub(crate) fn decref(rt: &Runtime, op: ObjectRef) {
    let header = op.header();
    let tid = header.tid.load(Ordering::Relaxed);
    if tid != 0 && tid == thread::current_thread_id() {
        let local = header.ref_local.load(Ordering::Relaxed);
        debug_assert!(local > 0, "local refcount underflow on {op:?}");
        header.ref_local.store(local - 1, Ordering::Relaxed);
        if local == 1 {
            // Local count exhausted: release the bias and fold into the shared word.
            header.tid.store(0, Ordering::Relaxed);
            let old = header.ref_shared.fetch_or(SHARED_MERGED, Ordering::AcqRel);
            if shared_count(old) == 0 && old & SHARED_QUEUED == 0 {
                dealloc(rt, op);
            }
        }
    } else {
        decref_shared(rt, op);
    }
}

fn decref_shared(rt: &Runtime, op: ObjectRef) {
    let header = op.header();
    // Grab the owner before touching the count; the owning thread may release it once the Queued
    // flag is visible.
    let tid = header.tid.load(Ordering::Relaxed);
    loop {
        let old = header.ref_shared.load(Ordering::Relaxed);
        if shared_count(old) == 0 && old & (SHARED_MERGED | SHARED_QUEUED) == 0 {
            // The reference being released is carried by the owner's local count. Mark the object
            // queued and hand the decrement to the owning thread.
            let new = old | SHARED_QUEUED;
            if header
                .ref_shared
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                rt.queue_deferred_decref(tid, op);
                return;
            }
        } else {
            debug_assert!(
                shared_count(old) > 0 || !is_merged(old),
                "shared refcount underflow on {op:?}"
            );
            let new = old - (1 << SHARED_SHIFT);
            if header
                .ref_shared
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if is_merged(new) && shared_count(new) == 0 {
                    dealloc(rt, op);
                }
                return;
            }
        }
    }
}

/// Folds the local count into the shared word, applying `extra` and discharging any deferred
/// adjustment. The object loses its owning thread. Callers must hold exclusive access to the
/// refcount, either by stopping the world or by being the sole remaining owner.
pub(crate) fn merge_refcount(op: ObjectRef, extra: isize) -> isize {
    let header = op.header();
    let local = header.ref_local.load(Ordering::Relaxed) as isize;
    let shared = shared_count(header.ref_shared.load(Ordering::Relaxed));
    let deferred = isize::from(header.has_bit(GcBits::DEFERRED));
    let refcount = local + shared + extra - deferred;
    header.clear_bit(GcBits::DEFERRED);
    header.tid.store(0, Ordering::Relaxed);
    header.ref_local.store(0, Ordering::Relaxed);
    header
        .ref_shared
        .store((refcount << SHARED_SHIFT) | SHARED_MERGED, Ordering::Release);
    refcount
}

/// Marks one unit of the object's refcount as borrowed from deferred accounting.
pub(crate) fn enable_deferred_refcount(op: ObjectRef) {
    let header = op.header();
    if !header.has_bit(GcBits::DEFERRED) {
        header.set_bit(GcBits::DEFERRED);
        incref(op);
    }
}

/// Enters the object into the tracked set.
pub(crate) fn track(rt: &Runtime, op: ObjectRef) {
    debug_assert!(!op.is_tracked(), "{op:?} already tracked");
    op.header().set_bit(GcBits::TRACKED);
    rt.gc.add_live(1);
}

/// Removes the object from the tracked set; tolerant of double untracking. The scratch word is
/// reset in case the object leaves mid-collection with partial counts in it.
pub(crate) fn untrack(rt: &Runtime, op: ObjectRef) {
    if op.is_tracked() {
        op.header().clear_bit(GcBits::TRACKED);
        op.set_gc_refs(0);
        rt.gc.add_live(-1);
    }
}

/// Destroys an object whose refcount reached zero: clears weak references (invoking their
/// callbacks), runs a not-yet-run finalizer (which may resurrect the object), releases owned
/// children, drops the payload, and returns the block to its page.
pub(crate) fn dealloc(rt: &Runtime, op: ObjectRef) {
    let header = op.header();
    let was_tracked = op.is_tracked();
    if was_tracked {
        untrack(rt, op);
    }
    let ty = op.type_desc();
    if let Some(finalize) = ty.finalize {
        if !op.is_finalized() {
            header.set_bit(GcBits::FINALIZED);
            crate::collector::call_unraisable(rt, "finalizer", || finalize(rt, op));
            if effective_refcount(op) > 0 {
                // The finalizer resurrected the object; it will come back here when the new
                // references are released.
                if was_tracked {
                    track(rt, op);
                }
                return;
            }
        }
    }
    if !header.weaklist.load(Ordering::Relaxed).is_null() {
        weakref::clear_all(rt, op, true);
    }
    if weakref::is_weakref(op) {
        weakref::detach(rt, op);
    }
    let mut children = Vec::new();
    let _ = op.traverse(&mut |child| {
        children.push(child);
        ControlFlow::Continue(())
    });
    unsafe { (ty.drop)(op.payload_ptr()) };
    for child in children {
        decref(rt, child);
    }
    heap::free_block(rt, op.as_raw());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_word_packing() {
        let packed = (5_isize << SHARED_SHIFT) | SHARED_MERGED;
        assert_eq!(shared_count(packed), 5);
        assert!(is_merged(packed));
        assert!(!is_merged(7 << SHARED_SHIFT));
    }

    #[test]
    fn payload_offset_is_aligned() {
        assert_eq!(PAYLOAD_OFFSET % PAYLOAD_ALIGN, 0);
        assert!(PAYLOAD_OFFSET >= size_of::<ObjectHeader>());
    }
}
