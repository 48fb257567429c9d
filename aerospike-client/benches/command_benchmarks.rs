//! Request encoding throughput benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use aerospike_client::command::{Bins, Command, ReadCommand, WriteCommand};
use aerospike_client::core::key::compute_digest;
use aerospike_client::core::msgpack;
use aerospike_client::{BasePolicy, Bin, Key, OperationType, Value, WritePolicy};

fn sample_list(len: usize) -> Value {
    Value::List(
        (0..len)
            .map(|i| {
                if i % 2 == 0 {
                    Value::Int(i as i64 * 1_000)
                } else {
                    Value::String(format!("item-{}", i))
                }
            })
            .collect(),
    )
}

fn bench_value_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("msgpack_pack");

    for len in [8usize, 64, 512] {
        let value = sample_list(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("list", len), &value, |b, value| {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            b.iter(|| {
                buf.clear();
                msgpack::pack_value(&mut buf, black_box(value)).unwrap();
                black_box(buf.len())
            })
        });
    }

    let map = Value::Map(
        (0..32)
            .map(|i| (Value::String(format!("k{}", i)), Value::Float(i as f64 / 3.0)))
            .collect(),
    );
    group.bench_function("map_32", |b| {
        let mut buf = BytesMut::with_capacity(4096);
        b.iter(|| {
            buf.clear();
            msgpack::pack_value(&mut buf, black_box(&map)).unwrap();
            black_box(buf.len())
        })
    });

    group.finish();
}

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    group.bench_function("string_key", |b| {
        let user_key = Value::from("user-000042");
        b.iter(|| compute_digest(black_box("users"), black_box(&user_key)).unwrap())
    });

    group.bench_function("integer_key", |b| {
        let user_key = Value::Int(42);
        b.iter(|| compute_digest(black_box("users"), black_box(&user_key)).unwrap())
    });

    group.bench_function("blob_key_1k", |b| {
        let user_key = Value::Blob(vec![7u8; 1024]);
        b.iter(|| compute_digest(black_box("users"), black_box(&user_key)).unwrap())
    });

    group.finish();
}

fn bench_request_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_building");
    let key = Key::new("test", "users", "user-000042").unwrap();

    group.bench_function("read_all", |b| {
        let policy = BasePolicy::default();
        let bins = Bins::All;
        let mut buf = BytesMut::with_capacity(1024);
        b.iter(|| {
            let mut command = ReadCommand::new(&policy, &key, &bins);
            command.write_buffer(&mut buf).unwrap();
            black_box(buf.len())
        })
    });

    for count in [1usize, 10, 50] {
        let bins: Vec<Bin> = (0..count)
            .map(|i| Bin::new(format!("bin{}", i), sample_list(4)))
            .collect();
        group.bench_with_input(BenchmarkId::new("put", count), &bins, |b, bins| {
            let policy = WritePolicy::default();
            let mut buf = BytesMut::with_capacity(8 * 1024);
            b.iter(|| {
                let mut command = WriteCommand::new(&policy, &key, bins, OperationType::Write);
                command.write_buffer(&mut buf).unwrap();
                black_box(buf.len())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_value_packing, bench_digest, bench_request_building);
criterion_main!(benches);
