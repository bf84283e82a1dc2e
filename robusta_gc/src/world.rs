//! The stop-the-world coordinator.
//!
//! One coordinator runs at a time, serialized by the session mutex. Stopping counts the other
//! registered mutators, remote-parks the detached ones, signals the attached ones through their
//! eval breakers, and waits on a one-shot event with a bounded timeout, rescanning on every wake
//! because threads detach concurrently with parking. The last mutator to park is the notifier;
//! so is a mutator that detaches or unlinks while a stop is pending.

use crate::runtime::Runtime;
use crate::thread::{STATUS_ATTACHED, STATUS_DETACHED, STATUS_PARKED, ThreadState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Bounded wait between rescans of the thread list.
const STOP_RESCAN_WAIT: Duration = Duration::from_millis(1);

/// One-shot notification event.
struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    /// Waits up to `timeout` for the event; returns whether it was set.
    fn timed_wait(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            let _ = self.cond.wait_for(&mut flag, timeout);
        }
        *flag
    }

    fn reset(&self) {
        *self.flag.lock() = false;
    }
}

/// Global stop-the-world state.
pub(crate) struct World {
    /// Serializes stop-the-world sessions; held by the collector across a collection
    session: Mutex<()>,
    /// Nesting count of stop requests; written under the thread-list lock
    stop_requested: AtomicU32,
    /// Id of the stopping thread, for the re-entrancy check
    stopper: AtomicU64,
    stopped: AtomicBool,
    stop_event: Event,
}

impl World {
    pub(crate) fn new() -> Self {
        Self {
            session: Mutex::new(()),
            stop_requested: AtomicU32::new(0),
            stopper: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_event: Event::new(),
        }
    }

    /// Acquires the session mutex; the guard must outlive the stop/start pairs of a collection.
    pub(crate) fn lock_session(&self) -> MutexGuard<'_, ()> {
        self.session.lock()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire) > 0
    }

    /// True between the return of `stop_the_world` and the next `start_the_world`.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Called by the mutator whose park brought the countdown to zero.
    pub(crate) fn notify_stopped(&self) {
        self.stop_event.notify();
    }

    /// Remote-parks detached threads and signals attached ones. Returns the number parked.
    /// The caller holds the thread-list lock.
    fn park_detached_threads(threads: &[Arc<ThreadState>], this_id: u64) -> isize {
        let mut parked = 0;
        for state in threads {
            if state.id == this_id {
                continue;
            }
            let status = state.status();
            if status == STATUS_DETACHED
                && state.cant_stop.load(Ordering::Relaxed) == 0
                && state
                    .status
                    .compare_exchange(
                        STATUS_DETACHED,
                        STATUS_PARKED,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                parked += 1;
            } else if status == STATUS_ATTACHED {
                state.eval_breaker.store(true, Ordering::Release);
            }
        }
        parked
    }

    /// Blocks until every other mutator is parked. The calling thread stays attached. Re-entrant
    /// from the thread that already holds the world stopped.
    pub(crate) fn stop_the_world(&self, rt: &Runtime, this: &ThreadState) {
        debug_assert!(self.session.is_locked());

        let mut list = rt.registry.list.lock();
        if self.stop_requested.load(Ordering::Relaxed) > 0 {
            debug_assert_eq!(
                self.stopper.load(Ordering::Relaxed),
                this.id,
                "nested stop from a different thread"
            );
            self.stop_requested.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stop_requested.store(1, Ordering::Release);
        self.stopper.store(this.id, Ordering::Relaxed);

        // Count every registered mutator except ourselves. Threads that arrived during an earlier
        // pause of this session are already parked and need no waiting.
        debug_assert_eq!(this.status(), STATUS_ATTACHED);
        let waiting = list
            .threads
            .iter()
            .filter(|state| state.status() != STATUS_PARKED)
            .count() as isize;
        list.countdown = waiting - 1;

        let parked = Self::park_detached_threads(&list.threads, this.id);
        list.countdown -= parked;
        debug_assert!(list.countdown >= 0);
        let mut stopped_all = list.countdown == 0;
        drop(list);

        while !stopped_all {
            if self.stop_event.timed_wait(STOP_RESCAN_WAIT) {
                debug_assert_eq!(rt.registry.list.lock().countdown, 0);
                self.stop_event.reset();
                break;
            }
            // Rescan: threads that detached since the last pass can be parked directly.
            let mut list = rt.registry.list.lock();
            let parked = Self::park_detached_threads(&list.threads, this.id);
            list.countdown -= parked;
            debug_assert!(list.countdown >= 0);
            stopped_all = parked > 0 && list.countdown == 0;
        }

        self.stopped.store(true, Ordering::Release);
        trace!("world stopped by thread {}", this.id);
    }

    /// Releases every parked thread; outermost caller only.
    pub(crate) fn start_the_world(&self, rt: &Runtime) {
        debug_assert!(self.session.is_locked());

        let list = rt.registry.list.lock();
        if self.stop_requested.load(Ordering::Relaxed) > 1 {
            self.stop_requested.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        self.stop_requested.store(0, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
        for state in &list.threads {
            if state
                .status
                .compare_exchange(
                    STATUS_PARKED,
                    STATUS_DETACHED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                state.unpark_all();
            }
        }
        trace!("world restarted");
    }
}
