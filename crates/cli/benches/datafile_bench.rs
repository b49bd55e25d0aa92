use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use datafile::{DataFileReader, DataFileWriter, DataMode, RecordLayout};
use std::path::Path;
use tempfile::tempdir;

const N_RECORDS: u64 = 10_000;
const VALUE_SIZE: usize = 52;

fn write_file(dir: &Path) -> DataFileReader {
    let mut writer =
        DataFileWriter::create(dir, "bench", 0, RecordLayout::fixed(VALUE_SIZE as u32), false)
            .unwrap();
    writer.set_sync(false);
    let value = vec![b'x'; VALUE_SIZE];
    for key in 0..N_RECORDS {
        writer.store_data(key, &[], &value).unwrap();
    }
    writer.finish_writing().unwrap();
    DataFileReader::open(writer.path()).unwrap()
}

fn datafile_write_benchmark(c: &mut Criterion) {
    c.bench_function("datafile_write_10k_fixed", |b| {
        b.iter_batched(
            || tempdir().unwrap(),
            |dir| {
                write_file(dir.path());
            },
            BatchSize::SmallInput,
        );
    });
}

fn datafile_read_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let reader = write_file(dir.path());
    let stride = RecordLayout::fixed(VALUE_SIZE as u32)
        .fixed_record_size()
        .unwrap();

    c.bench_function("datafile_positional_read_10k", |b| {
        b.iter(|| {
            for i in 0..N_RECORDS {
                let v = reader.read_data(i * stride, DataMode::Value).unwrap();
                assert_eq!(v.len(), VALUE_SIZE);
            }
        });
    });
}

fn datafile_scan_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let reader = write_file(dir.path());

    c.bench_function("datafile_scan_keys_10k", |b| {
        b.iter(|| {
            let keys = reader.scan_keys().unwrap();
            assert_eq!(keys.len() as u64, N_RECORDS);
        });
    });
}

criterion_group!(
    benches,
    datafile_write_benchmark,
    datafile_read_benchmark,
    datafile_scan_benchmark
);
criterion_main!(benches);
