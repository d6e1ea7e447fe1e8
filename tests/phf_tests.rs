//! Black-box tests of the public API: key types, hashers, and persistence.

use pthash::bucketer::SkewBucketer;
use pthash::encoders::DictionaryDictionary;
use pthash::hash::{MurmurHash64, Xxh3Hash128};
use pthash::{BuildConfig, DefaultPartitionedPhf, DefaultPhf, SinglePhf};

fn distinct_string_keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{:04x}-{:04x}", i / 256, i % 256)).collect()
}

fn assert_bijective<K, F: Fn(&K) -> u64>(keys: &[K], f: F) {
    let mut seen = vec![false; keys.len()];
    for key in keys {
        let idx = f(key) as usize;
        assert!(idx < keys.len());
        assert!(!seen[idx], "duplicate index {idx}");
        seen[idx] = true;
    }
}

#[test]
fn string_keys() {
    let keys = distinct_string_keys(10_000);
    let config = BuildConfig {
        seed: 1,
        ..Default::default()
    };
    let f = DefaultPhf::build_in_internal_memory(&keys, &config).unwrap();
    assert_bijective(&keys, |k| f.get(k));
    // &str queries hash identically to String keys.
    assert_eq!(f.get("key-0000-0001"), f.get(&keys[1]));
}

#[test]
fn alternative_hashers() {
    let keys: Vec<u64> = (0..20_000u64).collect();
    let config = BuildConfig {
        seed: 3,
        ..Default::default()
    };
    let f = SinglePhf::<Xxh3Hash128, SkewBucketer, DictionaryDictionary>::build_in_internal_memory(
        &keys, &config,
    )
    .unwrap();
    assert_bijective(&keys, |k| f.get(k));

    let f = SinglePhf::<MurmurHash64, SkewBucketer, DictionaryDictionary>::build_in_internal_memory(
        &keys, &config,
    )
    .unwrap();
    assert_bijective(&keys, |k| f.get(k));
}

#[test]
fn serde_round_trip_preserves_queries() {
    let keys = pthash::util::generate_keys(30_000);
    let config = BuildConfig {
        seed: 8,
        ..Default::default()
    };
    let f = DefaultPhf::build_in_internal_memory(&keys, &config).unwrap();
    let bytes = bincode::serialize(&f).unwrap();
    let g: DefaultPhf = bincode::deserialize(&bytes).unwrap();
    for key in &keys {
        assert_eq!(f.get(key), g.get(key));
    }

    let config = BuildConfig {
        seed: 8,
        avg_partition_size: 100_000,
        num_threads: 2,
        ..Default::default()
    };
    let keys = pthash::util::generate_keys(200_000);
    let f = DefaultPartitionedPhf::build_in_internal_memory(&keys, &config).unwrap();
    let bytes = bincode::serialize(&f).unwrap();
    let g: DefaultPartitionedPhf = bincode::deserialize(&bytes).unwrap();
    for key in &keys {
        assert_eq!(f.get(key), g.get(key));
    }
}

#[test]
fn byte_slice_keys() {
    let keys: Vec<Vec<u8>> = (0..5000u32).map(|i| i.to_be_bytes().to_vec()).collect();
    let config = BuildConfig {
        seed: 12,
        ..Default::default()
    };
    let f = DefaultPhf::build_in_internal_memory(&keys, &config).unwrap();
    assert_bijective(&keys, |k| f.get(k));
}
