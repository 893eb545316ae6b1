use criterion::{black_box, criterion_group, criterion_main, Criterion};

use merkle_kv_mobile::event::{self, ReplicationEvent};
use merkle_kv_mobile::store::{LwwEngine, StateDigest, StorageEntry};

fn sample_event(seq: u64) -> ReplicationEvent {
    ReplicationEvent {
        key: format!("user:{}", seq % 1000),
        node_id: "bench-node".to_string(),
        seq,
        timestamp_ms: 1_637_142_400_000 + seq,
        tombstone: false,
        value: Some("x".repeat(128)),
    }
}

fn bench_codec(c: &mut Criterion) {
    let event = sample_event(42);
    let bytes = event::encode(&event).unwrap();

    c.bench_function("event_encode", |b| {
        b.iter(|| event::encode(black_box(&event)).unwrap())
    });
    c.bench_function("event_decode", |b| {
        b.iter(|| event::decode(black_box(&bytes)).unwrap())
    });
}

fn bench_lww_apply(c: &mut Criterion) {
    c.bench_function("lww_apply_1k", |b| {
        b.iter(|| {
            let engine = LwwEngine::in_memory(86_400_000);
            for seq in 0..1000u64 {
                engine
                    .put(StorageEntry::live(
                        format!("k{}", seq % 100),
                        "v",
                        seq,
                        "bench-node",
                        seq,
                    ))
                    .unwrap();
            }
            black_box(engine.len())
        })
    });
}

fn bench_digest(c: &mut Criterion) {
    let engine = LwwEngine::in_memory(86_400_000);
    for seq in 0..1000u64 {
        engine
            .put(StorageEntry::live(
                format!("k{}", seq),
                "v",
                seq,
                "bench-node",
                seq,
            ))
            .unwrap();
    }
    let snapshot = engine.scan_all();
    c.bench_function("digest_1k_entries", |b| {
        b.iter(|| StateDigest::compute(black_box(&snapshot)))
    });
}

criterion_group!(benches, bench_codec, bench_lww_apply, bench_digest);
criterion_main!(benches);
