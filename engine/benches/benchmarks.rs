//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use tether_engine::{
    invert_field_map, split_changes, transform_object_fields, Change, ChangeMode, FieldMap,
    Origin, PathType, PendingSave, PendingTree, Store, UnmappedKeys,
};

fn todos(count: usize) -> Value {
    let map: serde_json::Map<String, Value> = (0..count)
        .map(|i| {
            (
                format!("t{i}"),
                json!({"text": format!("todo {i}"), "done": i % 2 == 0, "tags": ["a", "b"]}),
            )
        })
        .collect();
    Value::Object(map)
}

fn bench_node_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_operations");

    group.bench_function("observable_new", |b| {
        let store = Store::new();
        b.iter(|| store.observable(black_box(json!({"a": 1}))))
    });

    group.bench_function("child_lookup", |b| {
        let store = Store::new();
        let root = store.observable(todos(100));
        b.iter(|| root.child(black_box("t50")).child("text"))
    });

    group.bench_function("set_leaf_unobserved", |b| {
        let store = Store::new();
        let root = store.observable(todos(100));
        let leaf = root.at(["t50", "done"]);
        let mut flag = false;
        b.iter(|| {
            flag = !flag;
            leaf.set(black_box(json!(flag)))
        })
    });

    group.bench_function("set_leaf_with_root_listener", |b| {
        let store = Store::new();
        let root = store.observable(todos(100));
        let _sub = root.on_change(|params| {
            black_box(params.changes.len());
        });
        let leaf = root.at(["t50", "done"]);
        let mut flag = false;
        b.iter(|| {
            flag = !flag;
            leaf.set(black_box(json!(flag)))
        })
    });

    group.finish();
}

fn bench_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("batching");

    for writes in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("batched_writes", writes), &writes, |b, &n| {
            let store = Store::new();
            let root = store.observable(todos(100));
            let _sub = root.on_change(|params| {
                black_box(params.changes.len());
            });
            let mut round = 0u64;
            b.iter(|| {
                round += 1;
                store.batch_with(|| {
                    for i in 0..n {
                        let key = format!("t{}", i % 100);
                        let _ = root.at([key.as_str(), "text"]).set(json!(round));
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_computed(c: &mut Criterion) {
    let mut group = c.benchmark_group("computed");

    group.bench_function("recompute_on_change", |b| {
        let store = Store::new();
        let root = store.observable(todos(100));
        let r = root.clone();
        let done = store.computed(move || {
            let count = r
                .get()
                .as_object()
                .map_or(0, |m| m.values().filter(|t| t["done"] == json!(true)).count());
            json!(count)
        });
        let _sub = done.on_change(|_| {});
        let leaf = root.at(["t1", "done"]);
        let mut flag = false;
        b.iter(|| {
            flag = !flag;
            leaf.set(black_box(json!(flag)))
        })
    });

    group.finish();
}

fn bench_sync_helpers(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_helpers");

    let map = FieldMap::from_json(&json!({
        "_dict": {"text": "t", "done": "d", "tags": "g"}
    }))
    .unwrap_or_default();

    for size in [10usize, 100, 1000] {
        let value = todos(size);
        group.bench_with_input(BenchmarkId::new("transform_save", size), &value, |b, v| {
            b.iter(|| transform_object_fields(black_box(v), &map, UnmappedKeys::PassThrough))
        });
        let saved = transform_object_fields(&value, &map, UnmappedKeys::PassThrough);
        group.bench_with_input(BenchmarkId::new("transform_load", size), &saved, |b, v| {
            b.iter(|| {
                transform_object_fields(black_box(v), &invert_field_map(&map), UnmappedKeys::PassThrough)
            })
        });
    }

    group.bench_function("pending_tree_insert_1000", |b| {
        b.iter(|| {
            let mut tree = PendingTree::new();
            for i in 0..1000u64 {
                let path = vec![format!("t{}", i % 200), "text".to_string()];
                tree.insert(PendingSave::new(
                    path,
                    vec![PathType::Object; 2],
                    json!(i),
                    i,
                ));
            }
            tree
        })
    });

    group.bench_function("split_large_batch", |b| {
        let change = Change::at(
            vec!["todos".to_string()],
            vec![PathType::Object],
            todos(1000),
            ChangeMode::Set,
            Origin::Local,
        );
        b.iter(|| split_changes(black_box(vec![change.clone()]), 4096))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_node_operations,
    bench_batching,
    bench_computed,
    bench_sync_helpers,
);
criterion_main!(benches);
