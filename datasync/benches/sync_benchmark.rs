//! Benchmarks for the datasync hot paths.
//!
//! Run with: `cargo bench -p datasync`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use datasync::broadcast::{Outgoing, PeerHandle, SubscriberRegistry};
use datasync::client::OutboundQueue;
use datasync::ops::{self, path, Operation};
use datasync::protocol::{CommandMessage, DataKey, UserContext};
use datasync::provider::Provider;
use datasync::storage::{DocumentStore, StoreConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn key() -> DataKey {
    DataKey::new("default", "bench", "1").unwrap()
}

/// A document shaped like a small form: nested objects plus a list of rows.
fn medium_document(rows: usize) -> Value {
    let rows: Vec<Value> = (0..rows)
        .map(|i| {
            json!({
                "id": i,
                "label": format!("row {i}"),
                "done": i % 3 == 0,
                "tags": ["alpha", "beta"],
            })
        })
        .collect();
    json!({
        "title": "Quarterly plan",
        "owner": {"name": "ops", "team": {"size": 12}},
        "rows": rows,
    })
}

// ─── Wire codec ──────────────────────────────────────────────────────────────

fn bench_encode_message(c: &mut Criterion) {
    let msg = CommandMessage::document(key(), medium_document(50));

    c.bench_function("encode_document_50_rows", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_decode_message(c: &mut Criterion) {
    let frame = CommandMessage::document(key(), medium_document(50))
        .encode()
        .unwrap();

    c.bench_function("decode_document_50_rows", |b| {
        b.iter(|| {
            black_box(CommandMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

// ─── Operations ──────────────────────────────────────────────────────────────

fn bench_diff(c: &mut Criterion) {
    let before = medium_document(100);
    let mut after = before.clone();
    after["title"] = json!("Quarterly plan (rev 2)");
    after["rows"][42]["done"] = json!(true);
    after["owner"]["team"]["size"] = json!(13);

    c.bench_function("diff_100_rows_3_changes", |b| {
        b.iter(|| {
            black_box(ops::diff(black_box(&before), black_box(&after)));
        })
    });
}

fn bench_apply(c: &mut Criterion) {
    let document = medium_document(100);
    let changes: Vec<Operation> = (0..10)
        .map(|i| Operation::Set {
            path: path(&format!("rows.{i}.label")),
            before: None,
            after: json!(format!("edited {i}")),
        })
        .collect();

    c.bench_function("apply_10_ops", |b| {
        b.iter(|| {
            let mut target = document.clone();
            ops::apply(&mut target, black_box(&changes)).unwrap();
            black_box(target);
        })
    });
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = SubscriberRegistry::new();
    let mut receivers: Vec<mpsc::Receiver<Outgoing>> = Vec::new();
    rt.block_on(async {
        for _ in 0..100 {
            let (tx, rx) = mpsc::channel(1024);
            registry.subscribe(&key(), &Arc::new(PeerHandle::new(tx))).await;
            receivers.push(rx);
        }
    });
    let msg = CommandMessage::document(key(), json!({"count": 1}));

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let sent = registry.broadcast(&key(), black_box(&msg)).await.unwrap();
                black_box(sent);
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

// ─── Client queue ────────────────────────────────────────────────────────────

fn bench_outbound_queue(c: &mut Criterion) {
    let msg = CommandMessage::set_ops(
        key(),
        &[Operation::Set {
            path: path("count"),
            before: Some(json!(1)),
            after: json!(2),
        }],
    );

    c.bench_function("outbound_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OutboundQueue::new(10_000);
            for _ in 0..1000 {
                queue.enqueue(msg.clone());
            }
            black_box(queue.drain());
        })
    });
}

// ─── Provider ────────────────────────────────────────────────────────────────

fn bench_concurrency_set(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let provider = Provider::in_memory();
    let ctx = UserContext::anonymous();

    c.bench_function("provider_concurrency_set", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let changes = [Operation::Set {
                path: path("count"),
                before: None,
                after: json!(n),
            }];
            rt.block_on(async {
                provider
                    .concurrency_set(&key(), black_box(&changes), &ctx)
                    .await
                    .unwrap()
                    .release();
            });
        })
    });
}

// ─── Storage ─────────────────────────────────────────────────────────────────

fn bench_save_document(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let document = medium_document(100);

    c.bench_function("save_document_100_rows", |b| {
        b.iter(|| {
            black_box(store.save_document(&key(), black_box(&document)).unwrap());
        })
    });
}

fn bench_load_document(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    store.save_document(&key(), &medium_document(100)).unwrap();

    c.bench_function("load_document_100_rows", |b| {
        b.iter(|| {
            black_box(store.load_document(black_box(&key())).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_encode_message,
    bench_decode_message,
    bench_diff,
    bench_apply,
    bench_broadcast_100_peers,
    bench_outbound_queue,
    bench_concurrency_set,
    bench_save_document,
    bench_load_document,
);
criterion_main!(benches);
