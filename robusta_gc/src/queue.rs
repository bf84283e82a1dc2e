//! Per-thread deferred-work queues.
//!
//! A decrement that crosses thread boundaries cannot touch the owner's local refcount. When the
//! shared count is already at zero, the decrementing thread flags the object Queued and enqueues
//! it here; the owning thread's queue is drained under stop-the-world during the next collection,
//! when every producer is quiescent.

use crate::object::{self, ObjectRef};
use crate::runtime::Runtime;
use crossbeam_queue::SegQueue;

/// Kind of deferred work attached to a queued object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WorkKind {
    /// A cross-thread decrement that found the shared count at zero
    Decref,
}

/// Lock-free queue of deferred `(object, kind)` work items.
pub(crate) struct WorkQueue {
    items: SegQueue<(ObjectRef, WorkKind)>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, op: ObjectRef, kind: WorkKind) {
        self.items.push((op, kind));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Applies every queued item. Tracked objects whose refcount reaches zero are left for the
    /// running collection; untracked ones are handed back for deallocation once the world is
    /// restarted. Callers guarantee producers are quiescent (the world is stopped).
    pub(crate) fn process(&self, rt: &Runtime, to_dealloc: &mut Vec<ObjectRef>) {
        debug_assert!(rt.world.is_stopped());
        while let Some((op, kind)) = self.items.pop() {
            match kind {
                WorkKind::Decref => {
                    // Merging rewrites the shared word, clearing the Queued flag and applying the
                    // deferred decrement.
                    let refcount = object::merge_refcount(op, -1);
                    debug_assert!(refcount >= 0, "deferred decref underflow on {op:?}");
                    if refcount == 0 && !op.is_tracked() {
                        to_dealloc.push(op);
                    }
                }
            }
        }
    }
}
