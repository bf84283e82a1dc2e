//! Weak references.
//!
//! A weak reference is itself a tracked object whose payload holds a raw pointer to its referent,
//! doubly-linked into the referent's weakref list, plus an optional callback fired when the
//! referent dies. Clearing a weakref never keeps its referent alive; upgrading takes a new strong
//! reference under the runtime's weakref lock, which also guards every list mutation.

use crate::collector;
use crate::error::{Error, Result};
use crate::object::{self, ObjectHeader, ObjectRef, TypeDescriptor};
use crate::runtime::Runtime;
use crate::thread::ThreadHandle;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Callback fired when a weakref's referent dies; receives the weakref object.
pub type WeakCallback = Box<dyn FnOnce(ObjectRef) + Send>;

/// Payload of a weakref object.
pub struct WeakRefObject {
    referent: AtomicPtr<ObjectHeader>,
    next: AtomicPtr<ObjectHeader>,
    prev: AtomicPtr<ObjectHeader>,
    callback: Mutex<Option<WeakCallback>>,
}

/// Type descriptor for weakref objects.
pub static WEAKREF_TYPE: TypeDescriptor = TypeDescriptor::new(
    "weakref",
    object::traverse_noop,
    object::drop_payload::<WeakRefObject>,
);

/// Returns `true` if the object is a weakref.
#[must_use]
pub fn is_weakref(op: ObjectRef) -> bool {
    std::ptr::eq(op.type_desc(), &WEAKREF_TYPE)
}

unsafe fn data(wr: ObjectRef) -> &'static WeakRefObject {
    debug_assert!(is_weakref(wr));
    unsafe { &*wr.payload_ptr().cast::<WeakRefObject>() }
}

/// Creates a weak reference to `referent`, optionally with a callback.
///
/// # Errors
///
/// `InvalidArgument` if the referent's type does not support weak references.
pub fn new_weakref(
    thread: &ThreadHandle,
    referent: ObjectRef,
    callback: Option<WeakCallback>,
) -> Result<ObjectRef> {
    if !referent.type_desc().weakref_support {
        return Err(Error::InvalidArgument(format!(
            "type {} does not support weak references",
            referent.type_desc().name
        )));
    }
    let rt = thread.runtime();
    let wr = thread.alloc_object(
        &WEAKREF_TYPE,
        WeakRefObject {
            referent: AtomicPtr::new(referent.as_raw().cast()),
            next: AtomicPtr::new(std::ptr::null_mut()),
            prev: AtomicPtr::new(std::ptr::null_mut()),
            callback: Mutex::new(callback),
        },
    );
    rt.track(wr);
    let _guard = rt.weakref_lock.lock();
    let head = referent.header().weaklist.load(Ordering::Relaxed);
    unsafe {
        data(wr).next.store(head, Ordering::Relaxed);
        if let Some(head) = NonNull::new(head) {
            data(ObjectRef::from_header(head))
                .prev
                .store(wr.as_raw().cast(), Ordering::Relaxed);
        }
    }
    referent
        .header()
        .weaklist
        .store(wr.as_raw().cast(), Ordering::Relaxed);
    Ok(wr)
}

/// Returns a new strong reference to the referent, or `None` if it has died.
#[must_use]
pub fn upgrade(rt: &Runtime, wr: ObjectRef) -> Option<ObjectRef> {
    let _guard = rt.weakref_lock.lock();
    let referent = unsafe { data(wr) }.referent.load(Ordering::Relaxed);
    NonNull::new(referent).map(|ptr| {
        let op = ObjectRef::from_header(ptr);
        object::incref(op);
        op
    })
}

/// Returns the referent without taking a reference, or `None` if it has died.
#[must_use]
pub fn peek(rt: &Runtime, wr: ObjectRef) -> Option<ObjectRef> {
    let _guard = rt.weakref_lock.lock();
    let referent = unsafe { data(wr) }.referent.load(Ordering::Relaxed);
    NonNull::new(referent).map(ObjectRef::from_header)
}

/// Unlinks `wr` from its referent's list while holding the weakref lock.
fn unlink_locked(wr: ObjectRef) {
    let payload = unsafe { data(wr) };
    let Some(referent) = NonNull::new(payload.referent.load(Ordering::Relaxed)) else {
        return;
    };
    let referent = ObjectRef::from_header(referent);
    let prev = payload.prev.load(Ordering::Relaxed);
    let next = payload.next.load(Ordering::Relaxed);
    if let Some(prev) = NonNull::new(prev) {
        unsafe { data(ObjectRef::from_header(prev)) }
            .next
            .store(next, Ordering::Relaxed);
    } else {
        referent.header().weaklist.store(next, Ordering::Relaxed);
    }
    if let Some(next) = NonNull::new(next) {
        unsafe { data(ObjectRef::from_header(next)) }
            .prev
            .store(prev, Ordering::Relaxed);
    }
    payload.prev.store(std::ptr::null_mut(), Ordering::Relaxed);
    payload.next.store(std::ptr::null_mut(), Ordering::Relaxed);
    payload
        .referent
        .store(std::ptr::null_mut(), Ordering::Relaxed);
}

/// Detaches `wr` from its referent so it can no longer resurrect it. The callback is left in
/// place but will never fire through this weakref.
pub(crate) fn detach(rt: &Runtime, wr: ObjectRef) {
    let _guard = rt.weakref_lock.lock();
    unlink_locked(wr);
}

/// Snapshot of the weakrefs currently pointing at `op`.
pub(crate) fn refs_to(rt: &Runtime, op: ObjectRef) -> Vec<ObjectRef> {
    let _guard = rt.weakref_lock.lock();
    let mut refs = Vec::new();
    let mut cursor = op.header().weaklist.load(Ordering::Relaxed);
    while let Some(ptr) = NonNull::new(cursor) {
        let wr = ObjectRef::from_header(ptr);
        refs.push(wr);
        cursor = unsafe { data(wr) }.next.load(Ordering::Relaxed);
    }
    refs
}

pub(crate) fn has_callback(wr: ObjectRef) -> bool {
    unsafe { data(wr) }.callback.lock().is_some()
}

pub(crate) fn take_callback(wr: ObjectRef) -> Option<WeakCallback> {
    unsafe { data(wr) }.callback.lock().take()
}

/// Clears every weakref to `op`. When `invoke_callbacks` is set (the plain refcount death path),
/// the callbacks fire after the referent pointers are cleared, so no callback can observe a live
/// referent through its weakref.
pub(crate) fn clear_all(rt: &Runtime, op: ObjectRef, invoke_callbacks: bool) {
    let mut pending = Vec::new();
    {
        let _guard = rt.weakref_lock.lock();
        let mut cursor = op.header().weaklist.load(Ordering::Relaxed);
        while let Some(ptr) = NonNull::new(cursor) {
            let wr = ObjectRef::from_header(ptr);
            let payload = unsafe { data(wr) };
            cursor = payload.next.load(Ordering::Relaxed);
            payload
                .referent
                .store(std::ptr::null_mut(), Ordering::Relaxed);
            payload.prev.store(std::ptr::null_mut(), Ordering::Relaxed);
            payload.next.store(std::ptr::null_mut(), Ordering::Relaxed);
            if invoke_callbacks {
                if let Some(callback) = payload.callback.lock().take() {
                    pending.push((wr, callback));
                }
            }
        }
        op.header()
            .weaklist
            .store(std::ptr::null_mut(), Ordering::Relaxed);
    }
    for (wr, callback) in pending {
        collector::call_unraisable(rt, "weakref callback", move || callback(wr));
    }
}
