//! Split dict-keys blocks.
//!
//! Dicts sharing a keys table keep it in a block allocated from the dict-keys heap. Tracked keys
//! blocks live on a per-runtime list; during root discovery the collector marks the block of
//! every dict it sees, and blocks that remain unmarked when the marking round is over are swept.

use crate::heap;
use crate::runtime::Runtime;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Header at the start of every split keys block. The dict's actual key table follows it.
#[repr(C)]
pub struct SharedKeys {
    /// On the runtime's tracked list
    tracked: AtomicBool,
    /// Transient mark set while a collection scans dicts
    marked: AtomicBool,
}

/// Offset of the embedder-owned payload within a keys block.
pub(crate) const KEYS_PAYLOAD_OFFSET: usize = size_of::<SharedKeys>().next_multiple_of(16);

/// A reference to a split keys block.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct SharedKeysRef(NonNull<SharedKeys>);

// Safety: the header is all atomics; the payload is the embedder's to synchronize.
unsafe impl Send for SharedKeysRef {}
unsafe impl Sync for SharedKeysRef {}

impl SharedKeysRef {
    fn header(&self) -> &SharedKeys {
        // Safety: keys blocks are freed only by the sweep, which runs after every dict that could
        // reference them is gone.
        unsafe { self.0.as_ref() }
    }

    /// Returns the raw block address.
    #[must_use]
    pub fn as_raw(&self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// Returns a pointer to the embedder-owned payload after the header.
    #[must_use]
    pub fn payload_ptr(&self) -> *mut u8 {
        // Safety: blocks are allocated with room for the header plus the payload.
        unsafe { self.as_raw().add(KEYS_PAYLOAD_OFFSET) }
    }

    pub(crate) fn is_tracked(&self) -> bool {
        self.header().tracked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.header().marked.store(marked, Ordering::Relaxed);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.header().marked.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SharedKeysRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<shared keys at {:#x}>", self.as_raw() as usize)
    }
}

/// Writes a fresh header into a newly allocated keys block.
pub(crate) unsafe fn init_keys(block: NonNull<u8>) -> SharedKeysRef {
    let keys = block.cast::<SharedKeys>();
    unsafe {
        keys.as_ptr().write(SharedKeys {
            tracked: AtomicBool::new(false),
            marked: AtomicBool::new(false),
        });
    }
    SharedKeysRef(keys)
}

/// Per-runtime list of tracked keys blocks.
#[derive(Default)]
pub(crate) struct SharedKeysList {
    entries: parking_lot::Mutex<Vec<SharedKeysRef>>,
}

impl SharedKeysList {
    /// Enters a keys block into the tracked list.
    pub(crate) fn track(&self, keys: SharedKeysRef) {
        if !keys.header().tracked.swap(true, Ordering::Relaxed) {
            self.entries.lock().push(keys);
        }
    }

    /// Separates marked blocks (keeping them, with the mark cleared) from unmarked ones, which
    /// are unlinked and returned for sweeping. The second value counts the survivors.
    pub(crate) fn find_dead(&self) -> (Vec<SharedKeysRef>, usize) {
        let mut dead = Vec::new();
        let mut survivors = 0;
        self.entries.lock().retain(|keys| {
            if keys.is_marked() {
                keys.set_marked(false);
                survivors += 1;
                true
            } else {
                keys.header().tracked.store(false, Ordering::Relaxed);
                dead.push(*keys);
                false
            }
        });
        (dead, survivors)
    }
}

/// Frees swept keys blocks.
pub(crate) fn free_dead_keys(rt: &Runtime, dead: Vec<SharedKeysRef>) {
    for keys in dead {
        heap::free_block(rt, keys.as_raw());
    }
}
