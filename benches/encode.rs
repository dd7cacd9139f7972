//! Encode and scan throughput over a synthetic corpus.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use trailpack::{Db, Encoder, Uuid};

const NUM_EVENTS: u64 = 50_000;
const NUM_TRAILS: u64 = 500;

fn uuid(n: u64) -> Uuid {
    let mut u = [0u8; 16];
    u[..8].copy_from_slice(&n.to_be_bytes());
    u
}

fn build(path: &std::path::Path) {
    let mut enc = Encoder::new(path, &["user", "action", "page"]).unwrap();
    for e in 0..NUM_EVENTS {
        let user = format!("user{}", e % NUM_TRAILS);
        let action = ["view", "click", "close"][(e % 3) as usize];
        let page = format!("/page/{}", e % 40);
        enc.add(
            &uuid(e % NUM_TRAILS),
            e,
            &[user.as_bytes(), action.as_bytes(), page.as_bytes()],
        )
        .unwrap();
    }
    enc.finalize().unwrap();
}

fn bench_encode(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(NUM_EVENTS));
    group.sample_size(10);
    group.bench_function("build_store", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let path = dir.path().join(format!("bench{i}"));
            i += 1;
            build(&path);
        });
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan");
    build(&path);
    let db = Db::open(&path).unwrap();

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(NUM_EVENTS));
    group.bench_function("full_scan", |b| {
        b.iter(|| {
            let mut cursor = db.cursor();
            let mut events = 0u64;
            for t in 0..db.num_trails() {
                cursor.seek(t).unwrap();
                while cursor.next().is_some() {
                    events += 1;
                }
            }
            assert_eq!(events, NUM_EVENTS);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_scan);
criterion_main!(benches);
