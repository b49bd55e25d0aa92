use config::StoreConfig;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use kvstore::{IndexedStore, RecordLayout};
use std::path::Path;
use tempfile::tempdir;

const N_KEYS: u64 = 10_000;
const VALUE_SIZE: usize = 52;

fn bench_config() -> StoreConfig {
    StoreConfig {
        sync_on_finish: false,
        ..StoreConfig::default()
    }
}

fn open_store(dir: &Path) -> IndexedStore {
    IndexedStore::open(
        dir,
        "bench",
        RecordLayout::fixed(VALUE_SIZE as u32),
        N_KEYS,
        bench_config(),
    )
    .unwrap()
}

fn write_session(store: &IndexedStore) {
    let value = vec![b'x'; VALUE_SIZE];
    store.start_writing().unwrap();
    for key in 0..N_KEYS {
        store.put(key, &value).unwrap();
    }
    store.end_writing(0, N_KEYS - 1).unwrap();
}

fn kvstore_session_benchmark(c: &mut Criterion) {
    c.bench_function("kvstore_session_10k_puts", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = open_store(dir.path());
                (dir, store)
            },
            |(_dir, store)| write_session(&store),
            BatchSize::SmallInput,
        );
    });
}

fn kvstore_get_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    write_session(&store);

    c.bench_function("kvstore_get_hit_10k", |b| {
        b.iter(|| {
            for key in 0..N_KEYS {
                assert!(store.get(key).unwrap().is_some());
            }
        });
    });
}

fn kvstore_merge_benchmark(c: &mut Criterion) {
    c.bench_function("kvstore_merge_4_sessions_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = open_store(dir.path());
                for _ in 0..4 {
                    write_session(&store);
                }
                (dir, store)
            },
            |(_dir, store)| {
                let report = store.merge().unwrap();
                assert_eq!(report.records_copied, N_KEYS);
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    kvstore_session_benchmark,
    kvstore_get_benchmark,
    kvstore_merge_benchmark
);
criterion_main!(benches);
