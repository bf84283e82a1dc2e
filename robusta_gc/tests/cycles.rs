//! Cycle collection tests: plain cycles, finalizers, legacy finalizers, and resurrection.

use parking_lot::Mutex;
use robusta_gc::{
    DebugFlags, ObjectRef, Runtime, ThreadHandle, TypeDescriptor, VisitResult, drop_payload,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Node {
    children: Mutex<Vec<ObjectRef>>,
    drops: Option<Arc<AtomicUsize>>,
    finalizes: Option<Arc<AtomicUsize>>,
    resurrect_into: Option<Arc<Mutex<Option<ObjectRef>>>>,
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn node_traverse(op: ObjectRef, visit: &mut dyn FnMut(ObjectRef) -> VisitResult) -> VisitResult {
    for child in unsafe { op.payload::<Node>() }.children.lock().iter() {
        visit(*child)?;
    }
    VisitResult::Continue(())
}

fn node_clear(rt: &Runtime, op: ObjectRef) {
    let children: Vec<ObjectRef> =
        unsafe { op.payload::<Node>() }.children.lock().drain(..).collect();
    for child in children {
        rt.decref(child);
    }
}

fn node_finalize(rt: &Runtime, op: ObjectRef) {
    let node = unsafe { op.payload::<Node>() };
    if let Some(finalizes) = &node.finalizes {
        finalizes.fetch_add(1, Ordering::SeqCst);
    }
    if let Some(global) = &node.resurrect_into {
        rt.incref(op);
        *global.lock() = Some(op);
    }
}

static NODE: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("node", node_traverse, drop_payload::<Node>);
    ty.clear = Some(node_clear);
    ty
};

static FINALIZED_NODE: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("node.finalized", node_traverse, drop_payload::<Node>);
    ty.clear = Some(node_clear);
    ty.finalize = Some(node_finalize);
    ty
};

static LEGACY_NODE: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("node.legacy", node_traverse, drop_payload::<Node>);
    ty.clear = Some(node_clear);
    ty.legacy_del = true;
    ty
};

fn new_node(
    mutator: &ThreadHandle,
    ty: &'static TypeDescriptor,
    drops: &Arc<AtomicUsize>,
) -> ObjectRef {
    mutator.alloc_tracked(
        ty,
        Node {
            children: Mutex::new(Vec::new()),
            drops: Some(Arc::clone(drops)),
            finalizes: None,
            resurrect_into: None,
        },
    )
}

fn link(rt: &Runtime, parent: ObjectRef, child: ObjectRef) {
    rt.incref(child);
    unsafe { parent.payload::<Node>() }.children.lock().push(child);
}

#[test_log::test]
fn simple_cycle_is_collected() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    let a = new_node(&mutator, &NODE, &drops);
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    // The cycle keeps both alive until a collection runs.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    let unreachable = rt.collect(&mutator, 2).unwrap();
    assert_eq!(unreachable, 2);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert!(rt.garbage().is_empty());
    assert_eq!(rt.get_count().0, 0);
}

#[test_log::test]
fn acyclic_objects_die_through_refcounting() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    let parent = new_node(&mutator, &NODE, &drops);
    let child = new_node(&mutator, &NODE, &drops);
    link(&rt, parent, child);
    rt.decref(child);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    rt.decref(parent);
    // No collection needed; the chain unwinds through plain decrefs.
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test_log::test]
fn consecutive_collections_are_idempotent() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    let a = new_node(&mutator, &NODE, &drops);
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    assert_eq!(rt.collect(&mutator, 2).unwrap(), 2);
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 0);
}

#[test_log::test]
fn cycle_with_finalizer_runs_it_once() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));
    let finalizes = Arc::new(AtomicUsize::new(0));

    let a = mutator.alloc_tracked(
        &FINALIZED_NODE,
        Node {
            children: Mutex::new(Vec::new()),
            drops: Some(Arc::clone(&drops)),
            finalizes: Some(Arc::clone(&finalizes)),
            resurrect_into: None,
        },
    );
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    let unreachable = rt.collect(&mutator, 2).unwrap();
    assert_eq!(unreachable, 2);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert!(rt.garbage().is_empty());
}

#[test_log::test]
fn legacy_finalizer_makes_cycle_uncollectable() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    let a = new_node(&mutator, &LEGACY_NODE, &drops);
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    let unreachable = rt.collect(&mutator, 2).unwrap();
    assert_eq!(unreachable, 1);
    assert_eq!(rt.get_stats()[0].uncollectable, 1);
    // The legacy object surfaces on the garbage list; its cycle partner stays alive through it.
    let garbage = rt.garbage();
    assert_eq!(garbage, vec![a]);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(rt.find_object(b));

    // Breaking the cycle by hand lets everything go.
    let children: Vec<ObjectRef> =
        unsafe { a.payload::<Node>() }.children.lock().drain(..).collect();
    for child in children {
        rt.decref(child);
    }
    rt.clear_garbage();
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test_log::test]
fn finalizer_resurrection_defers_reclamation() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));
    let finalizes = Arc::new(AtomicUsize::new(0));
    let global: Arc<Mutex<Option<ObjectRef>>> = Arc::default();

    let a = mutator.alloc_tracked(
        &FINALIZED_NODE,
        Node {
            children: Mutex::new(Vec::new()),
            drops: Some(Arc::clone(&drops)),
            finalizes: Some(Arc::clone(&finalizes)),
            resurrect_into: Some(Arc::clone(&global)),
        },
    );
    link(&rt, a, a);
    rt.decref(a);

    // The finalizer stores the object into the global, resurrecting it.
    assert_eq!(rt.collect(&mutator, 0).unwrap(), 0);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    let resurrected = global.lock().take().unwrap();

    // Dropping the global root lets the next collection reclaim it; the finalizer does not run
    // again.
    rt.decref(resurrected);
    assert_eq!(rt.collect(&mutator, 0).unwrap(), 1);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test_log::test]
fn save_all_routes_garbage_to_the_list() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    rt.set_debug(DebugFlags::SAVE_ALL.bits());
    let a = new_node(&mutator, &NODE, &drops);
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    assert_eq!(rt.collect(&mutator, 2).unwrap(), 2);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(rt.garbage().len(), 2);

    rt.set_debug(0);
    rt.clear_garbage();
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 2);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test_log::test]
fn long_chain_cycle_is_collected_whole() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    let nodes: Vec<ObjectRef> = (0..50).map(|_| new_node(&mutator, &NODE, &drops)).collect();
    for pair in nodes.windows(2) {
        link(&rt, pair[0], pair[1]);
    }
    link(&rt, nodes[49], nodes[0]);
    for op in &nodes {
        rt.decref(*op);
    }

    assert_eq!(rt.collect(&mutator, 2).unwrap(), 50);
    assert_eq!(drops.load(Ordering::SeqCst), 50);
}

#[test_log::test]
fn reachable_subgraph_survives_collection() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let drops = Arc::new(AtomicUsize::new(0));

    // root -> a <-> b ; the cycle hangs off a live root and must survive.
    let root = new_node(&mutator, &NODE, &drops);
    let a = new_node(&mutator, &NODE, &drops);
    let b = new_node(&mutator, &NODE, &drops);
    link(&rt, root, a);
    link(&rt, a, b);
    link(&rt, b, a);
    rt.decref(a);
    rt.decref(b);

    assert_eq!(rt.collect(&mutator, 2).unwrap(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(rt.find_object(a));

    rt.decref(root);
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 2);
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}
