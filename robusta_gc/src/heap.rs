//! Segregated page heaps and the block visitor.
//!
//! Memory is organized into aligned pages. Each page carries metadata (block size, heap tag,
//! owning thread, liveness bitmap) at its start, so any block pointer maps back to its page by
//! address masking. Every thread owns one heap per tag; the collector-managed heap is tagged
//! [`HeapTag::Gc`], split dict-keys blocks come from [`HeapTag::DictKeys`].
//!
//! When the debug allocator is active, every block in a `Gc`-tagged page carries a two-word
//! prefix: a size word whose low bit means "allocation live", and a guard word. Visitors skip
//! dead blocks and advance past both words before exposing the block. The dict-keys heap never
//! uses the debug wrapper.
//!
//! Heaps of threads that exit are handed to the runtime's abandoned pool, where the visitor picks
//! them up from the pending-abandoned and visited-abandoned lists.

use crate::object::ObjectRef;
use crate::runtime::Runtime;
use crate::thread;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Page size and alignment; block pointers are masked to this to recover their page.
pub(crate) const PAGE_SIZE: usize = 1 << 16;
const PAGE_MASK: usize = !(PAGE_SIZE - 1);
/// Offset of the first block within a page.
const BLOCKS_OFFSET: usize = 256;
/// Smallest block stride.
const MIN_BLOCK: usize = 64;
/// Largest size-class stride; bigger blocks get a dedicated page.
const MAX_CLASS_BLOCK: usize = 4096;
const NUM_CLASSES: usize = 7;
const FREE_MAP_WORDS: usize = 16;
/// Size of the debug allocator's per-block prefix: a size word plus a guard word.
pub(crate) const DEBUG_PREFIX: usize = 2 * size_of::<usize>();
const GUARD_WORD: usize = 0xFDFD_FDFD_FDFD_FDFD_u64 as usize;

/// Heap tags; each thread owns one heap per tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum HeapTag {
    /// Collector-managed object blocks
    Gc = 0,
    /// Split dict-keys blocks
    DictKeys = 1,
}

pub(crate) const NUM_HEAP_TAGS: usize = 2;

/// Per-page metadata, always at the start of the page allocation.
#[repr(C)]
pub(crate) struct PageMeta {
    /// Block stride, including the debug prefix when active
    block_size: usize,
    capacity: usize,
    /// Total allocation size of the page, a multiple of [`PAGE_SIZE`]
    alloc_size: usize,
    tag: HeapTag,
    debug: bool,
    /// Owning thread id; zero once the page is abandoned
    pub(crate) owner_tid: AtomicU64,
    used: AtomicUsize,
    free_map: [AtomicU64; FREE_MAP_WORDS],
}

const _: () = assert!(size_of::<PageMeta>() <= BLOCKS_OFFSET);

/// A raw page handle.
#[derive(Clone, Copy)]
pub(crate) struct PagePtr(NonNull<PageMeta>);

// Safety: pages are plain memory whose shared metadata is all atomic.
unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

impl PagePtr {
    pub(crate) fn meta(&self) -> &PageMeta {
        // Safety: the page allocation lives until free_page, which only runs once no block in it
        // is reachable.
        unsafe { self.0.as_ref() }
    }

    fn base(&self) -> *mut u8 {
        self.0.as_ptr().cast()
    }
}

impl PageMeta {
    pub(crate) fn tag(&self) -> HeapTag {
        self.tag
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.used.load(Ordering::Relaxed) == 0
    }

    fn block_start(&self, slot: usize) -> *mut u8 {
        let base = std::ptr::from_ref(self) as usize;
        (base + BLOCKS_OFFSET + slot * self.block_size) as *mut u8
    }

    fn is_live(&self, slot: usize) -> bool {
        let bits = self.free_map[slot / 64].load(Ordering::Relaxed);
        bits & (1 << (slot % 64)) != 0
    }

    /// Claims a specific slot; used by the freelist cache. Fails if the slot was re-taken.
    fn try_claim(&self, slot: usize) -> bool {
        let word = &self.free_map[slot / 64];
        let mask = 1_u64 << (slot % 64);
        loop {
            let bits = word.load(Ordering::Relaxed);
            if bits & mask != 0 {
                return false;
            }
            if word
                .compare_exchange(bits, bits | mask, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.used.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    /// Finds and claims any free slot.
    fn try_alloc(&self) -> Option<usize> {
        let words = self.capacity.div_ceil(64);
        for index in 0..words {
            let word = &self.free_map[index];
            loop {
                let bits = word.load(Ordering::Relaxed);
                let free = !bits;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                let slot = index * 64 + bit;
                if slot >= self.capacity {
                    return None;
                }
                if word
                    .compare_exchange(bits, bits | (1 << bit), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.used.fetch_add(1, Ordering::Relaxed);
                    return Some(slot);
                }
            }
        }
        None
    }

    fn free_slot(&self, slot: usize) {
        let mask = 1_u64 << (slot % 64);
        let old = self.free_map[slot / 64].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(old & mask != 0, "double free of page slot {slot}");
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Exposes the usable portion of a claimed slot, writing the debug prefix when active.
    fn expose(&self, slot: usize) -> NonNull<u8> {
        let start = self.block_start(slot);
        let ptr = if self.debug {
            unsafe {
                start.cast::<usize>().write((self.block_size & !1) | 1);
                start.cast::<usize>().add(1).write(GUARD_WORD);
                start.add(DEBUG_PREFIX)
            }
        } else {
            start
        };
        NonNull::new(ptr).expect("page block pointer is never null")
    }
}

fn class_for(needed: usize) -> usize {
    let stride = needed.next_power_of_two().max(MIN_BLOCK);
    (stride.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize
}

fn class_stride(class: usize) -> usize {
    MIN_BLOCK << class
}

fn new_page(block_size: usize, capacity: usize, tag: HeapTag, debug: bool, owner_tid: u64) -> PagePtr {
    let alloc_size = (BLOCKS_OFFSET + block_size * capacity).next_multiple_of(PAGE_SIZE);
    let layout =
        Layout::from_size_align(alloc_size, PAGE_SIZE).expect("page layout is always valid");
    let mem = unsafe { std::alloc::alloc_zeroed(layout) };
    let Some(mem) = NonNull::new(mem) else {
        std::alloc::handle_alloc_error(layout);
    };
    let page = mem.cast::<PageMeta>();
    unsafe {
        page.as_ptr().write(PageMeta {
            block_size,
            capacity,
            alloc_size,
            tag,
            debug,
            owner_tid: AtomicU64::new(owner_tid),
            used: AtomicUsize::new(0),
            free_map: [const { AtomicU64::new(0) }; FREE_MAP_WORDS],
        });
    }
    PagePtr(page)
}

/// Releases a page's memory. The caller guarantees no block in it is reachable.
pub(crate) fn free_page(page: PagePtr) {
    let layout = Layout::from_size_align(page.meta().alloc_size, PAGE_SIZE)
        .expect("page layout is always valid");
    unsafe { std::alloc::dealloc(page.base(), layout) };
}

/// Recovers the page owning a block pointer.
pub(crate) fn page_of(block: *mut u8) -> PagePtr {
    let base = (block as usize & PAGE_MASK) as *mut PageMeta;
    PagePtr(NonNull::new(base).expect("block pointers are never in the zero page"))
}

/// A thread's heap for one tag: pages grouped by size class, plus dedicated pages for large
/// blocks and a small cache of recently freed slots.
pub(crate) struct Heap {
    tag: HeapTag,
    owner_tid: u64,
    debug: bool,
    /// Scratch bit for the visitor; prevents double visits within one walk
    pub(crate) visited: AtomicBool,
    pages: Mutex<HeapPages>,
    free_cache: Mutex<Vec<(PagePtr, usize)>>,
}

#[derive(Default)]
struct HeapPages {
    by_class: [Vec<PagePtr>; NUM_CLASSES],
    huge: Vec<PagePtr>,
}

impl Heap {
    pub(crate) fn new(tag: HeapTag, owner_tid: u64, debug_allocator: bool) -> Self {
        // Dict-keys blocks never get the debug wrapper; their cell layout is consumed raw.
        let debug = debug_allocator && matches!(tag, HeapTag::Gc);
        Self {
            tag,
            owner_tid,
            debug,
            visited: AtomicBool::new(false),
            pages: Mutex::new(HeapPages::default()),
            free_cache: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a block with at least `usable` usable bytes.
    pub(crate) fn alloc(&self, usable: usize) -> NonNull<u8> {
        let needed = usable + if self.debug { DEBUG_PREFIX } else { 0 };
        if needed <= MAX_CLASS_BLOCK {
            let class = class_for(needed);
            let stride = class_stride(class);
            {
                let mut cache = self.free_cache.lock();
                while let Some((page, slot)) = cache.pop() {
                    if page.meta().block_size == stride && page.meta().try_claim(slot) {
                        return page.meta().expose(slot);
                    }
                }
            }
            let mut pages = self.pages.lock();
            for page in pages.by_class[class].iter().rev() {
                if let Some(slot) = page.meta().try_alloc() {
                    return page.meta().expose(slot);
                }
            }
            let capacity = ((PAGE_SIZE - BLOCKS_OFFSET) / stride).min(FREE_MAP_WORDS * 64);
            let page = new_page(stride, capacity, self.tag, self.debug, self.owner_tid);
            pages.by_class[class].push(page);
            let slot = page.meta().try_alloc().expect("fresh page has a free slot");
            page.meta().expose(slot)
        } else {
            let stride = needed.next_multiple_of(16);
            let page = new_page(stride, 1, self.tag, self.debug, self.owner_tid);
            let mut pages = self.pages.lock();
            pages.huge.push(page);
            let slot = page.meta().try_alloc().expect("fresh page has a free slot");
            page.meta().expose(slot)
        }
    }

    fn cache_free(&self, page: PagePtr, slot: usize) {
        self.free_cache.lock().push((page, slot));
    }

    /// Drops the free-slot cache. Slots remain free in their page bitmaps.
    pub(crate) fn clear_free_cache(&self) {
        self.free_cache.lock().clear();
    }

    /// Removes and returns empty pages.
    pub(crate) fn take_empty_pages(&self) -> Vec<PagePtr> {
        let mut pages = self.pages.lock();
        let mut empty = Vec::new();
        let HeapPages { by_class, huge } = &mut *pages;
        for list in by_class.iter_mut().chain(std::iter::once(huge)) {
            list.retain(|page| {
                if page.meta().is_empty() {
                    empty.push(*page);
                    false
                } else {
                    true
                }
            });
        }
        empty
    }

    /// Removes every page from the heap, for hand-off to the abandoned pool.
    pub(crate) fn take_all_pages(&self) -> Vec<PagePtr> {
        let mut pages = self.pages.lock();
        let mut all = Vec::new();
        let HeapPages { by_class, huge } = &mut *pages;
        for list in by_class.iter_mut().chain(std::iter::once(huge)) {
            all.append(list);
        }
        all
    }

    fn visit(
        &self,
        include_free: bool,
        f: &mut dyn FnMut(Option<NonNull<u8>>, usize) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let pages = self.pages.lock();
        for list in pages.by_class.iter().chain(std::iter::once(&pages.huge)) {
            for page in list {
                visit_page_blocks(*page, include_free, f)?;
            }
        }
        ControlFlow::Continue(())
    }
}

/// Walks every block slot of a page. Live blocks are exposed past any debug prefix; free slots
/// are reported as `None` when `include_free` is set.
pub(crate) fn visit_page_blocks(
    page: PagePtr,
    include_free: bool,
    f: &mut dyn FnMut(Option<NonNull<u8>>, usize) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let meta = page.meta();
    let usable = meta.block_size - if meta.debug { DEBUG_PREFIX } else { 0 };
    for slot in 0..meta.capacity {
        let start = meta.block_start(slot);
        let (live, block) = if meta.debug {
            // The first prefix word is the block size; its low bit marks the allocation live.
            let prefix = unsafe { *start.cast::<usize>() };
            (prefix & 1 == 1, unsafe { start.add(DEBUG_PREFIX) })
        } else {
            (meta.is_live(slot), start)
        };
        if live {
            f(NonNull::new(block), usable)?;
        } else if include_free {
            f(None, usable)?;
        }
    }
    ControlFlow::Continue(())
}

/// Returns a block to its page. Owner-thread frees also feed the owner heap's slot cache.
pub(crate) fn free_block(rt: &Runtime, block: *mut u8) {
    let page = page_of(block);
    let meta = page.meta();
    let start = if meta.debug {
        unsafe { block.sub(DEBUG_PREFIX) }
    } else {
        block
    };
    let base = page.base() as usize;
    let slot = (start as usize - base - BLOCKS_OFFSET) / meta.block_size;
    if meta.debug {
        unsafe {
            let prefix = start.cast::<usize>();
            prefix.write(*prefix & !1);
        }
    }
    let owner = meta.owner_tid.load(Ordering::Relaxed);
    if owner != 0 && owner == thread::current_thread_id() {
        if let Some(state) = rt.registry.get(owner) {
            state.heap(meta.tag()).cache_free(page, slot);
        }
    }
    meta.free_slot(slot);
}

/// Pool of pages whose owning threads have exited. The visitor walks both lists; after a full
/// walk, freshly abandoned pages move to the visited list.
#[derive(Default)]
pub(crate) struct AbandonedPool {
    pending: Mutex<Vec<PagePtr>>,
    visited: Mutex<Vec<PagePtr>>,
}

impl AbandonedPool {
    /// Takes ownership of a dying thread's pages.
    pub(crate) fn abandon(&self, pages: Vec<PagePtr>) {
        let mut pending = self.pending.lock();
        for page in pages {
            page.meta().owner_tid.store(0, Ordering::Relaxed);
            pending.push(page);
        }
    }

    fn visit(
        &self,
        tag: HeapTag,
        include_free: bool,
        f: &mut dyn FnMut(Option<NonNull<u8>>, usize) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        for list in [&self.pending, &self.visited] {
            let pages = list.lock();
            for page in pages.iter() {
                if page.meta().tag() == tag {
                    visit_page_blocks(*page, include_free, f)?;
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn promote_pending(&self) {
        let mut pending = self.pending.lock();
        self.visited.lock().append(&mut pending);
    }

    /// Frees pages that have become empty.
    pub(crate) fn take_empty_pages(&self) -> Vec<PagePtr> {
        let mut empty = Vec::new();
        for list in [&self.pending, &self.visited] {
            list.lock().retain(|page| {
                if page.meta().is_empty() {
                    empty.push(*page);
                    false
                } else {
                    true
                }
            });
        }
        empty
    }

    pub(crate) fn drain_all(&self) -> Vec<PagePtr> {
        let mut all: Vec<PagePtr> = self.pending.lock().drain(..).collect();
        all.extend(self.visited.lock().drain(..));
        all
    }
}

/// Walks every block of every heap with the given tag: each live thread's heap (guarded by the
/// per-heap visited bit) plus the abandoned pools, under the thread-list lock.
pub(crate) fn visit_heaps(
    rt: &Runtime,
    tag: HeapTag,
    include_free: bool,
    f: &mut dyn FnMut(Option<NonNull<u8>>, usize) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let list = rt.registry.list.lock();
    let mut result = ControlFlow::Continue(());
    for state in &list.threads {
        let heap = state.heap(tag);
        if heap.visited.swap(true, Ordering::AcqRel) {
            continue;
        }
        result = heap.visit(include_free, f);
        if result.is_break() {
            break;
        }
    }
    if result.is_continue() {
        result = rt.abandoned.visit(tag, include_free, f);
    }
    for state in &list.threads {
        state.heap(tag).visited.store(false, Ordering::Release);
    }
    rt.abandoned.promote_pending();
    result
}

/// Second visit mode: native per-object iteration over the tracked population.
pub(crate) fn visit_tracked(
    rt: &Runtime,
    f: &mut dyn FnMut(ObjectRef) -> ControlFlow<()>,
) -> ControlFlow<()> {
    visit_heaps(rt, HeapTag::Gc, false, &mut |block, _size| {
        if let Some(block) = block {
            let op = ObjectRef::from_block(block);
            if op.is_tracked() {
                return f(op);
            }
        }
        ControlFlow::Continue(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(class_for(1), 0);
        assert_eq!(class_for(64), 0);
        assert_eq!(class_for(65), 1);
        assert_eq!(class_for(4096), 6);
        assert_eq!(class_stride(0), 64);
        assert_eq!(class_stride(6), 4096);
    }

    #[test]
    fn page_alloc_and_masking() {
        let page = new_page(64, 16, HeapTag::Gc, false, 7);
        let slot = page.meta().try_alloc().expect("slot");
        let block = page.meta().expose(slot);
        let found = page_of(block.as_ptr());
        assert_eq!(found.base(), page.base());
        assert_eq!(found.meta().owner_tid.load(Ordering::Relaxed), 7);
        assert!(!found.meta().is_empty());
        page.meta().free_slot(slot);
        assert!(found.meta().is_empty());
        free_page(page);
    }

    #[test]
    fn debug_prefix_liveness() {
        let page = new_page(128, 8, HeapTag::Gc, true, 1);
        let slot = page.meta().try_alloc().expect("slot");
        let block = page.meta().expose(slot);
        let start = unsafe { block.as_ptr().sub(DEBUG_PREFIX) };
        let prefix = unsafe { *start.cast::<usize>() };
        assert_eq!(prefix & 1, 1);
        let mut live = 0;
        let _ = visit_page_blocks(page, true, &mut |block, usable| {
            assert_eq!(usable, 128 - DEBUG_PREFIX);
            if block.is_some() {
                live += 1;
            }
            ControlFlow::Continue(())
        });
        assert_eq!(live, 1);
        free_page(page);
    }
}
