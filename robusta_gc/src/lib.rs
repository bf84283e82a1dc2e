//! # Robusta GC
//!
//! ## Overview
//!
//! A concurrent, cycle-collecting garbage collector for the Robusta VM. Objects are reclaimed
//! immediately through per-object biased reference counting; reference cycles are reclaimed by a
//! stop-the-world tracing pass that walks the segregated heaps directly, with no per-generation
//! object lists.
//!
//! ## Features
//!
//! ### 🧵 **Free-Threaded Mutators**
//! - **No global interpreter lock**: mutator threads run managed code in parallel
//! - **Biased reference counting**: owner-thread decrements stay non-atomic; cross-thread
//!   traffic lands in a shared atomic counter with deferred hand-off queues
//! - **Three-state thread machine**: Attached / Detached / Parked, driven by compare-and-swap
//!   with address-based parking
//!
//! ### 🌍 **Stop-the-World Coordination**
//! - **Safe-point signalling**: attached threads park themselves at eval-breaker checks
//! - **Remote parking**: detached threads are parked by the collector without their help
//! - **Bounded rescan waits**: the coordinator polls late arrivals on a one-shot event
//!
//! ### ♻️ **Cycle Collection**
//! - **Refcount-based mark and scan**: external roots found by subtracting internal references
//! - **Finalizers and resurrection**: finalizers run once, revived objects survive the cycle
//! - **Weakref clearing**: callbacks fire only for weakrefs that outlive their referents
//! - **Legacy finalizers**: uncollectable cycles surface on the garbage list instead of leaking
//!   silently
//!
//! ## Architecture
//!
//! A collection proceeds in phases:
//!
//! 1. **Stop the world & merge**: every mutator is parked; deferred cross-thread refcount
//!    traffic is folded into owner-visible counts.
//! 2. **Root discovery**: each tracked object's refcount is copied into a scratch word and
//!    internal references are subtracted; a positive remainder marks an external root.
//! 3. **Mark**: everything transitively reachable from an external root is revived breadth-first.
//! 4. **Partition**: reachable objects get their owning thread restored; unreachable objects
//!    with legacy finalizers go to the garbage list; the rest queue for reclamation.
//! 5. **Weakrefs**: weak references to the dying set are cleared, callbacks scheduled.
//! 6. **Finalize**: the world resumes while callbacks and finalizers run.
//! 7. **Resurrection**: a second pause re-derives external refcounts; revived objects and
//!    everything they reach survive.
//! 8. **Break cycles**: clear hooks drop the remaining internal references and the normal
//!    refcount path destroys the objects.
//! 9. **Accounting**: the threshold is recomputed, quiescent-state reclamation advances, and
//!    registered callbacks observe the result.
//!
//! ## Thread Safety
//!
//! All coordination state is atomic or lock-protected; mutators are suspended only at safe
//! points they choose, never while holding an allocator or critical-section guard.

mod collector;
mod config;
mod error;
mod heap;
mod object;
mod qsbr;
mod queue;
mod runtime;
mod shared_keys;
mod thread;
mod weakref;
mod world;

pub use collector::GcCallback;
pub use config::{CollectionInfo, Configuration, DebugFlags, GenerationStats};
pub use error::{Error, Result};
pub use object::{
    ObjectRef, TraverseFn, TypeDescriptor, VisitResult, drop_payload, traverse_noop,
};
pub use runtime::{Runtime, UnraisableHook};
pub use shared_keys::{SharedKeys, SharedKeysRef};
pub use thread::{CantStopGuard, ThreadHandle};
pub use weakref::{WEAKREF_TYPE, WeakCallback, WeakRefObject, is_weakref, new_weakref, peek, upgrade};
