// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cache throughput benchmarks.
//
// Run with:
//   cargo bench --bench cache
//
// Groups:
//   set — store a fresh value (bump allocation, occasional zone eviction)
//   set_in_place — overwrite an existing entry of the same size
//   get — hash lookup + payload copy
//
// Each group exercises the same workload at three value sizes:
//   small  — 64 bytes   (below the minimum payload reservation)
//   medium — 4 KiB      (typical cached object)
//   large  — 256 KiB    (several entries per zone)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmcache::Cache;

const REGION_SIZE: usize = 16 * 1024 * 1024;

const SIZES: &[(&str, usize)] = &[
    ("small_64", 64),
    ("medium_4096", 4096),
    ("large_262144", 256 * 1024),
];

fn bench_cache(name: &str) -> Cache {
    let name = format!("bench_{name}_{}", std::process::id());
    Cache::clear_storage(&name);
    Cache::open(&name, REGION_SIZE).expect("cache open")
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");

    for &(label, size) in SIZES {
        let cache = bench_cache(&format!("set_{label}"));
        let value = vec![0xABu8; size];
        let mut i = 0u64;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            b.iter(|| {
                // Rotate keys so the working set churns through the ring.
                let key = format!("key{}", i % 4096);
                i += 1;
                cache.set(key.as_bytes(), black_box(&value), false).unwrap();
            });
        });

        cache.destroy().unwrap();
    }

    group.finish();
}

fn bench_set_in_place(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_in_place");

    for &(label, size) in SIZES {
        let cache = bench_cache(&format!("inplace_{label}"));
        let value = vec![0xCDu8; size];
        cache.set(b"hot", &value, false).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            b.iter(|| {
                cache.set(b"hot", black_box(&value), false).unwrap();
            });
        });

        cache.destroy().unwrap();
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for &(label, size) in SIZES {
        let cache = bench_cache(&format!("get_{label}"));
        let value = vec![0xEFu8; size];
        for i in 0..32 {
            let key = format!("key{i}");
            cache.set(key.as_bytes(), &value, false).unwrap();
        }
        let mut i = 0u64;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            b.iter(|| {
                let key = format!("key{}", i % 32);
                i += 1;
                black_box(cache.get(key.as_bytes()).unwrap());
            });
        });

        cache.destroy().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_set, bench_set_in_place, bench_get);
criterion_main!(benches);
