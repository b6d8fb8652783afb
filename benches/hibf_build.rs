use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hibf::insert_iterator::InsertIterator;
use hibf::{Config, HierarchicalInterleavedBloomFilter};
use std::sync::Arc;

fn make_config(num_user_bins: usize, elements_per_bin: u64) -> Config {
    let mut config = Config {
        number_of_user_bins: num_user_bins,
        input_fn: Some(Box::new(move |ub: usize, it: &mut InsertIterator<'_>| {
            let base = ub as u64 * elements_per_bin;
            for v in base..base + elements_per_bin {
                it.push(v);
            }
        })),
        ..Config::default()
    };
    config.threads = 1;
    config
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("hibf/build_1000_bins", |b| {
        b.iter_batched(
            || {
                let mut config = make_config(1000, 200);
                config.validate_and_set_defaults().unwrap();
                config
            },
            |mut config| black_box(HierarchicalInterleavedBloomFilter::new(&mut config).unwrap()),
            BatchSize::LargeInput,
        );
    });
}

fn bench_query(c: &mut Criterion) {
    let mut config = make_config(1000, 200);
    config.validate_and_set_defaults().unwrap();
    let hibf = Arc::new(HierarchicalInterleavedBloomFilter::new(&mut config).unwrap());
    let query: Vec<u64> = (0..200).collect();

    c.bench_function("hibf/membership_for", |b| {
        let mut agent = hibf.membership_agent();
        b.iter(|| {
            black_box(agent.membership_for(black_box(&query), 1));
        });
    });

    c.bench_function("hibf/counting_agent_bulk_count", |b| {
        let mut agent = hibf.counting_agent::<u32>();
        b.iter(|| {
            black_box(agent.bulk_count(black_box(&query)));
        });
    });
}

criterion_group!(benches, bench_build, bench_query);
criterion_main!(benches);
