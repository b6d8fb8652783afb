use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hibf::InterleavedBloomFilter;

fn bench_emplace(c: &mut Criterion) {
    let n = 50_000u64;
    let bins = 64;
    let bin_size_bits = 400_000;
    let hash_count = 2;

    c.bench_function("ibf/emplace", |b| {
        b.iter_batched(
            || InterleavedBloomFilter::new(bins, bin_size_bits, hash_count).unwrap(),
            |mut ibf| {
                for i in 0..n {
                    ibf.emplace(black_box(i), (i % bins as u64) as usize);
                }
                black_box(ibf);
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_bulk_contains(c: &mut Criterion) {
    let n = 50_000u64;
    let bins = 64;
    let bin_size_bits = 400_000;
    let hash_count = 2;

    let mut ibf = InterleavedBloomFilter::new(bins, bin_size_bits, hash_count).unwrap();
    for i in 0..n {
        ibf.emplace(i, (i % bins as u64) as usize);
    }

    c.bench_function("ibf/bulk_contains_present", |b| {
        let mut agent = ibf.containment_agent();
        b.iter(|| {
            for i in 0..n {
                black_box(agent.bulk_contains(black_box(i)));
            }
        });
    });

    c.bench_function("ibf/bulk_contains_absent", |b| {
        let mut agent = ibf.containment_agent();
        b.iter(|| {
            for i in n..n * 2 {
                black_box(agent.bulk_contains(black_box(i)));
            }
        });
    });
}

fn bench_counting_agent(c: &mut Criterion) {
    let n = 50_000u64;
    let bins = 64;
    let bin_size_bits = 400_000;
    let hash_count = 2;

    let mut ibf = InterleavedBloomFilter::new(bins, bin_size_bits, hash_count).unwrap();
    for i in 0..n {
        ibf.emplace(i, (i % bins as u64) as usize);
    }
    let values: Vec<u64> = (0..n).collect();

    c.bench_function("ibf/counting_agent_bulk_count", |b| {
        let mut agent = ibf.counting_agent::<u32>();
        b.iter(|| {
            black_box(agent.bulk_count(values.iter().copied()));
        });
    });
}

criterion_group!(benches, bench_emplace, bench_bulk_contains, bench_counting_agent);
criterion_main!(benches);
