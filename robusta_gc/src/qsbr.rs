//! Quiescent-state-based reclamation.
//!
//! Pages retired by the collector cannot be returned to the system while another thread might
//! still be reading them. Each retired page is stamped with a goal sequence; once every online
//! thread has observed a sequence at or past the goal, the page is freed. The collector advances
//! the global sequence exactly once per collection and polls afterwards.

use crate::heap::{self, PagePtr};
use crate::runtime::Runtime;
use crate::thread::ThreadState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Qsbr {
    /// Global write sequence; starts at one so zero can mean "offline"
    wr_seq: AtomicU64,
    retired: Mutex<Vec<(u64, PagePtr)>>,
}

impl Qsbr {
    pub(crate) fn new() -> Self {
        Self {
            wr_seq: AtomicU64::new(1),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Marks the thread online, observing the current sequence.
    pub(crate) fn online(&self, state: &ThreadState) {
        state
            .qsbr_seq
            .store(self.wr_seq.load(Ordering::Acquire), Ordering::Release);
    }

    /// Marks the thread offline; it no longer delays reclamation.
    pub(crate) fn offline(&self, state: &ThreadState) {
        state.qsbr_seq.store(0, Ordering::Release);
    }

    /// Records a quiescent state for the thread.
    pub(crate) fn quiescent(&self, state: &ThreadState) {
        self.online(state);
    }

    /// Advances the global sequence, making prior retirements eligible once observed.
    pub(crate) fn advance(&self) -> u64 {
        self.wr_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Defers freeing of an empty page until every thread has passed a quiescent point.
    pub(crate) fn retire_page(&self, page: PagePtr) {
        let goal = self.wr_seq.load(Ordering::Acquire) + 1;
        self.retired.lock().push((goal, page));
    }

    /// Frees every retired page whose goal sequence all online threads have observed.
    pub(crate) fn poll(&self, rt: &Runtime) {
        let minimum = {
            let list = rt.registry.list.lock();
            list.threads
                .iter()
                .map(|state| state.qsbr_seq.load(Ordering::Acquire))
                .filter(|seq| *seq != 0)
                .min()
                .unwrap_or(u64::MAX)
        };
        self.retired.lock().retain(|(goal, page)| {
            if *goal <= minimum {
                heap::free_page(*page);
                false
            } else {
                true
            }
        });
    }

    /// Frees everything still pending; runtime teardown only.
    pub(crate) fn drain(&self) {
        for (_goal, page) in self.retired.lock().drain(..) {
            heap::free_page(page);
        }
    }
}
