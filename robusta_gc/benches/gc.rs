use criterion::{Criterion, criterion_group, criterion_main};
use parking_lot::Mutex;
use robusta_gc::{ObjectRef, Runtime, TypeDescriptor, VisitResult, drop_payload};
use std::time::Duration;

struct Node {
    children: Mutex<Vec<ObjectRef>>,
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

static NODE: TypeDescriptor = {
    let mut ty = TypeDescriptor::new("node", node_traverse, drop_payload::<Node>);
    ty.clear = Some(node_clear);
    ty
};

fn benchmarks(criterion: &mut Criterion) {
    bench_refcount_lifecycle(criterion);
    bench_cycle_collection(criterion);
}

fn bench_refcount_lifecycle(criterion: &mut Criterion) {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    rt.disable();

    criterion.bench_function("alloc_and_release", |bencher| {
        bencher.iter(|| {
            for _ in 0..1_000 {
                let op = mutator.alloc_tracked(
                    &NODE,
                    Node {
                        children: Mutex::new(Vec::new()),
                    },
                );
                rt.decref(op);
            }
        });
    });
}

fn bench_cycle_collection(criterion: &mut Criterion) {
    let rt = Runtime::new();
    let mutator = rt.register_thread();
    mutator.attach();
    rt.disable();

    criterion.bench_function("collect_cycles", |bencher| {
        bencher.iter(|| {
            for _ in 0..100 {
                let a = mutator.alloc_tracked(
                    &NODE,
                    Node {
                        children: Mutex::new(Vec::new()),
                    },
                );
                let b = mutator.alloc_tracked(
                    &NODE,
                    Node {
                        children: Mutex::new(Vec::new()),
                    },
                );
                rt.incref(b);
                unsafe { a.payload::<Node>() }.children.lock().push(b);
                rt.incref(a);
                unsafe { b.payload::<Node>() }.children.lock().push(a);
                rt.decref(a);
                rt.decref(b);
            }
            rt.collect(&mutator, 2).expect("collection failed");
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmarks
);
criterion_main!(benches);
