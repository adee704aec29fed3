//! Benchmarks for the dictionary and eviction sampler.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use keystone::config::{MaxmemoryPolicy, MemoryConfig};
use keystone::db::{Db, StoredObject, Value};
use keystone::dict::Dict;
use keystone::evict::{Clock, Evictor};

fn bench_dict_add(c: &mut Criterion) {
    c.bench_function("dict_add_100k_with_rehash", |b| {
        b.iter(|| {
            let mut dict: Dict<u64, u64> = Dict::with_seed(1);
            for i in 0..100_000u64 {
                let _ = dict.add(i, i);
            }
            black_box(dict.len());
        })
    });
}

fn bench_dict_find(c: &mut Criterion) {
    let mut dict: Dict<u64, u64> = Dict::with_seed(1);
    for i in 0..100_000u64 {
        let _ = dict.add(i, i);
    }
    while dict.rehash(100) {}

    c.bench_function("dict_find_1k_of_100k", |b| {
        b.iter(|| {
            let mut hits = 0;
            for i in (0..100_000u64).step_by(100) {
                if dict.find(black_box(&i)).is_some() {
                    hits += 1;
                }
            }
            black_box(hits);
        })
    });
}

fn bench_sample_entries(c: &mut Criterion) {
    let mut dict: Dict<u64, u64> = Dict::with_seed(1);
    for i in 0..100_000u64 {
        let _ = dict.add(i, i);
    }
    let mut rng = SmallRng::seed_from_u64(7);

    c.bench_function("dict_sample_5_of_100k", |b| {
        b.iter(|| black_box(dict.sample_entries(5, &mut rng)))
    });
}

fn bench_pick_candidate(c: &mut Criterion) {
    let clock = Clock::from_unix_ms(2_000_000_000);
    let now = clock.lru();
    let mut dbs: Vec<Db> = (0..16).map(Db::new).collect();
    for i in 0..160_000u32 {
        let key = Bytes::from(format!("key:{i}"));
        let object = StoredObject::new(Value::Str(Bytes::from_static(b"v")), now - (i % 10_000));
        dbs[(i % 16) as usize].set(key, object);
    }

    let config = MemoryConfig {
        policy: MaxmemoryPolicy::AllkeysLru,
        ..Default::default()
    };
    let mut evictor = Evictor::with_seed(&config, 3);

    c.bench_function("evictor_pick_lru_16_dbs_160k_keys", |b| {
        b.iter(|| black_box(evictor.pick_candidate(&dbs, &clock)))
    });
}

criterion_group!(
    benches,
    bench_dict_add,
    bench_dict_find,
    bench_sample_entries,
    bench_pick_candidate
);
criterion_main!(benches);
