//! End-to-end scenarios exercising the public API across IBF and HIBF.

use hibf::insert_iterator::InsertIterator;
use hibf::layout::Layout;
use hibf::{Config, HierarchicalInterleavedBloomFilter, InterleavedBloomFilter};

fn config_for(bins: Vec<Vec<u64>>) -> Config {
    let bins = std::sync::Arc::new(bins);
    let mut config = Config {
        number_of_user_bins: bins.len(),
        input_fn: Some(Box::new(move |ub: usize, it: &mut InsertIterator<'_>| {
            for &v in &bins[ub] {
                it.push(v);
            }
        })),
        ..Config::default()
    };
    config.threads = 1;
    config
}

#[test]
fn direct_hashes_scenario() {
    let u0: Vec<u64> = (1..=10).collect();
    let u1: Vec<u64> = (1..=5).collect();
    let u2: Vec<u64> = vec![3, 9, 11];

    let mut config = config_for(vec![u0, u1, u2]);
    config.validate_and_set_defaults().unwrap();
    let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();
    let mut agent = hibf.membership_agent();

    let mut hits = agent.membership_for(&[3, 9, 12, 14], 2).to_vec();
    hits.sort_unstable();
    assert_eq!(hits, vec![0, 2]);

    let query: Vec<u64> = (0..=14).collect();
    let mut hits = agent.membership_for(&query, 5).to_vec();
    hits.sort_unstable();
    assert_eq!(hits, vec![0, 1]);
}

#[test]
fn empty_overlap_scenario_disjoint_ranges_recover_exact_bin() {
    let bins: Vec<Vec<u64>> = (0..50u64).map(|i| (i * i..(i + 1) * (i + 1)).collect()).collect();
    let mut config = config_for(bins);
    config.validate_and_set_defaults().unwrap();
    let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();
    let mut agent = hibf.membership_agent();

    for i in 5u64..50 {
        let query: Vec<u64> = (i * i + 5..i * i + 9).collect();
        let hits = agent.membership_for(&query, 4).to_vec();
        assert_eq!(hits, vec![i], "bin {i} not uniquely recovered");
    }
}

#[test]
fn high_overlap_scenario_neighbouring_bins_share_elements() {
    let bins: Vec<Vec<u64>> = (0..100u64).map(|i| (i * 5..i * 5 + 35).collect()).collect();
    let mut config = config_for(bins);
    config.validate_and_set_defaults().unwrap();
    let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();
    let mut agent = hibf.membership_agent();

    let i = 50u64;
    let query: Vec<u64> = (5 * i..5 * i + 5).collect();
    let hits = agent.membership_for(&query, 5).to_vec();
    let expected: Vec<u64> = (i - 6..=i).collect();
    assert_eq!(hits, expected);
}

#[test]
fn counting_scenario_identical_bins_agree_within_split_fp_allowance() {
    let shared: Vec<u64> = (0..500).collect();
    let bins: Vec<Vec<u64>> = (0..50).map(|_| shared.clone()).collect();
    let mut config = config_for(bins);
    config.validate_and_set_defaults().unwrap();
    let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

    let query: Vec<u64> = (0..500).collect();
    let mut counting = hibf.counting_agent::<u32>();
    let counts = counting.bulk_count(&query);
    for &c in counts {
        assert!((500..=520).contains(&c), "count {c} out of expected range");
    }
}

#[test]
fn fpr_bound_scenario_observed_rate_matches_theory() {
    let hash_count = 2usize;
    let bin_size_bits = 4096usize;
    let n = 500u64;

    let mut ibf = InterleavedBloomFilter::new(1, bin_size_bits, hash_count).unwrap();
    for v in 0..n {
        ibf.emplace(v, 0);
    }

    let trials = 100_000u64;
    let mut positives = 0u64;
    let mut agent = ibf.containment_agent();
    for v in n..(n + trials) {
        if agent.bulk_contains(v.wrapping_mul(0x9E3779B97F4A7C15) ^ v).get(0) {
            positives += 1;
        }
    }

    let observed = positives as f64 / trials as f64;
    let k = hash_count as f64;
    let expected = (1.0 - (-k * n as f64 / bin_size_bits as f64).exp()).powf(k);

    assert!(
        (observed - expected).abs() <= expected.max(0.001) * 0.2 + 0.01,
        "observed fpr {observed} too far from theoretical {expected}"
    );
}

#[test]
fn layout_round_trip_preserves_bin_to_user_tables() {
    let bins: Vec<Vec<u64>> = (0..30u64).map(|i| (i * 100..i * 100 + 80).collect()).collect();
    let mut config = config_for(bins);
    config.validate_and_set_defaults().unwrap();
    let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

    let mut buf = Vec::new();
    hibf.write_binary(&mut buf).unwrap();
    let loaded = HierarchicalInterleavedBloomFilter::read_binary(&mut std::io::Cursor::new(buf)).unwrap();

    assert_eq!(loaded.number_of_user_bins(), hibf.number_of_user_bins());
    assert_eq!(loaded.number_of_ibfs(), hibf.number_of_ibfs());

    let mut original_agent = hibf.membership_agent();
    let mut loaded_agent = loaded.membership_agent();
    for i in 0u64..30 {
        let probe = i * 100 + 3;
        assert_eq!(
            original_agent.membership_for(&[probe], 1).to_vec(),
            loaded_agent.membership_for(&[probe], 1).to_vec(),
        );
    }
}

#[test]
fn layout_text_format_round_trips_independently_of_the_ibf_tree() {
    let layout = Layout {
        max_bins: vec![],
        user_bins: vec![],
    };
    let mut text = String::new();
    layout.write_to(&mut text).unwrap();
    let parsed = Layout::read_from(&text).unwrap();
    assert_eq!(layout, parsed);
}

#[cfg(feature = "serde")]
#[test]
fn config_text_block_round_trips_through_the_public_api() {
    let mut config = config_for(vec![vec![1, 2, 3]]);
    config.tmax = 64;
    config.alpha = 2.0;

    let mut text = String::new();
    config.write_to(&mut text).unwrap();

    let mut restored = Config::default();
    restored.read_from(&text).unwrap();
    assert_eq!(restored.number_of_user_bins, 1);
    assert_eq!(restored.tmax, 64);
    assert_eq!(restored.alpha, 2.0);
}
