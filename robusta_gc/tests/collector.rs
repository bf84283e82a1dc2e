//! Public collector API tests: flags, thresholds, counts, stats, object queries, callbacks.

use parking_lot::Mutex;
use robusta_gc::{
    Configuration, Error, ObjectRef, Runtime, SharedKeysRef, ThreadHandle, TypeDescriptor,
    VisitResult, drop_payload, traverse_noop,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Item {
    drops: Option<Arc<AtomicUsize>>,
}

impl Drop for Item {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

static ITEM: TypeDescriptor =
    TypeDescriptor::new("item", traverse_noop, drop_payload::<Item>);

struct Pair {
    items: Mutex<Vec<ObjectRef>>,
}

fn pair_traverse(op: ObjectRef, visit: &mut dyn FnMut(ObjectRef) -> VisitResult) -> VisitResult {
    for item in unsafe { op.payload::<Pair>() }.items.lock().iter() {
        visit(*item)?;
    }
    VisitResult::Continue(())
}

fn pair_clear(rt: &Runtime, op: ObjectRef) {
    let items: Vec<ObjectRef> =
        unsafe { op.payload::<Pair>() }.items.lock().drain(..).collect();
    for item in items {
        rt.decref(item);
    }
}

fn pair_untrack_policy(op: ObjectRef) -> bool {
    // Leave the tracked set once every element is a non-container.
    let mut only_atoms = true;
    let _ = pair_traverse(op, &mut |item| {
        if item.is_tracked() {
            only_atoms = false;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    only_atoms
}

static PAIR: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("pair", pair_traverse, drop_payload::<Pair>);
    ty.clear = Some(pair_clear);
    ty.maybe_untrack = Some(pair_untrack_policy);
    ty
};

fn finalized_noop(_rt: &Runtime, _op: ObjectRef) {}

static FINALIZED_PAIR: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("pair.finalized", pair_traverse, drop_payload::<Pair>);
    ty.clear = Some(pair_clear);
    ty.finalize = Some(finalized_noop);
    ty
};

struct Dict {
    keys: Option<SharedKeysRef>,
}

fn dict_split_keys(op: ObjectRef) -> Option<SharedKeysRef> {
    unsafe { op.payload::<Dict>() }.keys
}

static DICT: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("dict", traverse_noop, drop_payload::<Dict>);
    ty.split_keys = Some(dict_split_keys);
    ty
};

fn new_item(mutator: &ThreadHandle) -> ObjectRef {
    mutator.alloc_tracked(&ITEM, Item { drops: None })
}

#[test_log::test]
fn enable_disable_round_trip() {
    let rt = Runtime::new();
    assert!(rt.is_enabled());
    assert!(rt.disable());
    assert!(!rt.is_enabled());
    assert!(!rt.disable());
    assert!(!rt.enable());
    assert!(rt.is_enabled());
}

#[test_log::test]
fn collect_validates_the_generation_argument() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    assert!(matches!(
        rt.collect(&mutator, -1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        rt.collect(&mutator, 3),
        Err(Error::InvalidArgument(_))
    ));
    // All in-range generations behave identically.
    for generation in 0..=2 {
        assert_eq!(rt.collect(&mutator, generation).unwrap(), 0);
    }
}

#[test_log::test]
fn get_count_follows_the_tracked_population() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    assert_eq!(rt.get_count(), (0, 0, 0));
    let items: Vec<ObjectRef> = (0..3).map(|_| new_item(&mutator)).collect();
    assert_eq!(rt.get_count(), (3, 0, 0));
    for item in items {
        rt.decref(item);
    }
    assert_eq!(rt.get_count(), (0, 0, 0));
}

#[test_log::test]
fn threshold_round_trip_and_update() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    assert_eq!(rt.get_threshold(), (7000, 0, 0));
    rt.set_threshold(123);
    assert_eq!(rt.get_threshold(), (123, 0, 0));
    // A collection recomputes the threshold from the live count, floored at 7000.
    rt.collect(&mutator, 2).unwrap();
    assert_eq!(rt.get_threshold(), (7000, 0, 0));
}

#[test_log::test]
fn zero_threshold_collects_on_every_allocation() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    rt.set_threshold(0);
    let before = rt.get_stats()[0].collections;
    let item = new_item(&mutator);
    assert!(rt.get_stats()[0].collections > before);
    rt.decref(item);
}

#[test_log::test]
fn disabled_collector_ignores_the_threshold() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    rt.disable();
    rt.set_threshold(0);
    let item = new_item(&mutator);
    assert_eq!(rt.get_stats()[0].collections, 0);
    // Explicit collections still run while disabled.
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 0);
    assert_eq!(rt.get_stats()[0].collections, 1);
    rt.decref(item);
}

#[test_log::test]
fn stats_accumulate_across_collections() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let a = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(Vec::new()) });
    let b = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(Vec::new()) });
    rt.incref(b);
    unsafe { a.payload::<Pair>() }.items.lock().push(b);
    rt.incref(a);
    unsafe { b.payload::<Pair>() }.items.lock().push(a);
    rt.decref(a);
    rt.decref(b);

    rt.collect(&mutator, 2).unwrap();
    let stats = rt.get_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].collections, 1);
    assert_eq!(stats[0].collected, 2);
    assert_eq!(stats[0].uncollectable, 0);
}

#[test_log::test]
fn get_objects_returns_the_tracked_population() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let a = new_item(&mutator);
    let b = new_item(&mutator);

    let objects = rt.get_objects(-1).unwrap();
    assert_eq!(objects.len(), 2);
    assert!(objects.contains(&a));
    assert!(objects.contains(&b));
    for op in objects {
        rt.decref(op);
    }

    assert!(matches!(rt.get_objects(3), Err(Error::InvalidArgument(_))));
    assert!(matches!(rt.get_objects(-2), Err(Error::InvalidArgument(_))));
    rt.decref(a);
    rt.decref(b);
}

#[test_log::test]
fn referrers_and_referents() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let item = new_item(&mutator);
    rt.incref(item);
    let pair = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(vec![item]) });

    let referrers = rt.get_referrers(&[item]);
    assert_eq!(referrers, vec![pair]);
    for op in referrers {
        rt.decref(op);
    }

    let referents = rt.get_referents(&[pair]);
    assert_eq!(referents, vec![item]);
    for op in referents {
        rt.decref(op);
    }

    assert!(rt.get_referrers(&[pair]).is_empty());
    rt.decref(pair);
    rt.decref(item);
}

#[test_log::test]
fn untrack_hides_objects_from_the_collector() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    let item = new_item(&mutator);
    assert!(rt.is_tracked(item));
    rt.untrack(item);
    assert!(!rt.is_tracked(item));
    assert_eq!(rt.get_count().0, 0);
    assert!(!rt.find_object(item));
    rt.decref(item);
}

#[test_log::test]
fn atom_only_containers_untrack_during_collection() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let item = new_item(&mutator);
    rt.untrack(item);
    rt.incref(item);
    let pair = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(vec![item]) });
    assert!(rt.is_tracked(pair));

    rt.collect(&mutator, 2).unwrap();
    assert!(!rt.is_tracked(pair));
    rt.decref(pair);
    rt.decref(item);
}

#[test_log::test]
fn finalized_flag_is_observable() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let pair = mutator.alloc_tracked(&FINALIZED_PAIR, Pair { items: Mutex::new(Vec::new()) });
    rt.incref(pair);
    unsafe { pair.payload::<Pair>() }.items.lock().push(pair);
    assert!(!rt.is_finalized(pair));

    // Make it cyclic garbage so the collector finalizes it, kept alive through SaveAll.
    rt.set_debug(robusta_gc::DebugFlags::SAVE_ALL.bits());
    rt.decref(pair);
    rt.collect(&mutator, 2).unwrap();
    assert_eq!(rt.garbage(), vec![pair]);
    assert!(rt.is_finalized(pair));

    rt.set_debug(0);
    rt.clear_garbage();
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 1);
}

#[test_log::test]
fn split_keys_blocks_follow_their_dicts() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let keys = mutator.alloc_shared_keys(64);
    rt.track_shared_keys(keys);
    let dict = mutator.alloc_tracked(&DICT, Dict { keys: Some(keys) });

    // The keys block is marked through its dict on every collection and survives.
    rt.collect(&mutator, 2).unwrap();
    rt.collect(&mutator, 2).unwrap();
    assert!(rt.find_object(dict));

    // Once the dict is gone, the next collection sweeps the unmarked block.
    rt.decref(dict);
    rt.collect(&mutator, 2).unwrap();
}

#[test_log::test]
fn debug_allocator_mode_collects_cycles_too() {
    let rt = Runtime::with_config(Configuration {
        debug_allocator: true,
        ..Configuration::default()
    });
    let mutator = rt.register_thread();
    mutator.attach();

    let a = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(Vec::new()) });
    let b = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(Vec::new()) });
    rt.incref(b);
    unsafe { a.payload::<Pair>() }.items.lock().push(b);
    rt.incref(a);
    unsafe { b.payload::<Pair>() }.items.lock().push(a);
    rt.decref(a);
    rt.decref(b);

    assert_eq!(rt.collect(&mutator, 2).unwrap(), 2);
    assert_eq!(rt.get_count().0, 0);
    assert!(rt.get_objects(-1).unwrap().is_empty());
}

#[test_log::test]
fn freeze_operations_are_noops() {
    let rt = Runtime::new();
    rt.freeze();
    rt.unfreeze();
    assert_eq!(rt.get_freeze_count(), 0);
}

#[test_log::test]
fn callbacks_observe_both_phases() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&log);
    rt.register_callback(Arc::new(move |phase, info| {
        sink.lock().push(format!("{phase}:{}:{}", info.collected, info.uncollectable));
    }));

    rt.collect(&mutator, 2).unwrap();
    assert_eq!(log.lock().as_slice(), ["start:0:0", "stop:0:0"]);
}

#[test_log::test]
fn shutdown_collects_and_releases_the_garbage_list() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let a = mutator.alloc_tracked(&PAIR, Pair { items: Mutex::new(Vec::new()) });
    rt.incref(a);
    unsafe { a.payload::<Pair>() }.items.lock().push(a);
    rt.decref(a);

    assert_eq!(rt.shutdown(&mutator), 1);
    assert!(rt.garbage().is_empty());
    assert_eq!(rt.get_count().0, 0);
}

#[test_log::test]
fn collection_callback_panics_reach_the_unraisable_hook() {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();

    let reports: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let sink = Arc::clone(&reports);
    rt.set_unraisable_hook(Some(Box::new(move |context, message| {
        sink.lock().push((context.to_string(), message.to_string()));
    })));
    rt.register_callback(Arc::new(|phase, _info| {
        if phase == "stop" {
            panic!("callback exploded");
        }
    }));

    // The panic is captured and reported; the collection itself succeeds.
    assert_eq!(rt.collect(&mutator, 2).unwrap(), 0);
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "collection callback");
    assert!(reports[0].1.contains("callback exploded"));
}
