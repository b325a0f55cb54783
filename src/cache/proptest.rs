//! Property-Based Tests for the cache facade
//!
//! Random put/get/delete sequences are checked against a `HashMap` model,
//! before and after a forced compaction pass.

#![cfg(test)]

use std::collections::HashMap;

use proptest::prelude::*;
use tempfile::tempdir;

use super::BlockCache;
use crate::config::{CacheConfig, MIN_CAPACITY_PER_BLOCK};

#[derive(Debug, Clone)]
enum Op {
    Put(u8, Vec<u8>),
    Get(u8),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<u8>(), prop::collection::vec(any::<u8>(), 0..4096))
            .prop_map(|(k, v)| Op::Put(k, v)),
        3 => any::<u8>().prop_map(Op::Get),
        1 => any::<u8>().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: the cache behaves like a map, and a merge pass with a zero
    /// threshold moves entries without changing any value.
    #[test]
    fn prop_cache_matches_model(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let root = tempdir()?;
        let config = CacheConfig::new()
            .with_capacity_per_block(MIN_CAPACITY_PER_BLOCK)?
            .with_initial_block_count(1)?
            .with_concurrency_level(2)?
            .with_dirty_ratio_threshold(0.0)?;
        let cache: BlockCache<u8> = BlockCache::open(root.path().join("cache"), config)?;
        let mut model: HashMap<u8, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    cache.put(k, &v)?;
                    model.insert(k, v);
                }
                Op::Get(k) => {
                    let got = cache.get(&k)?;
                    prop_assert_eq!(got.as_deref(), model.get(&k).map(|v| &v[..]));
                }
                Op::Delete(k) => {
                    let got = cache.delete(&k)?;
                    prop_assert_eq!(got.map(|b| b.to_vec()), model.remove(&k));
                }
            }
        }

        let expected_bytes: i64 = model.values().map(|v| v.len() as i64).sum();
        prop_assert_eq!(cache.len(), model.len());
        prop_assert_eq!(cache.stored_bytes(), expected_bytes);
        prop_assert_eq!(cache.storage().used(), expected_bytes);

        cache.run_merge()?;
        prop_assert_eq!(cache.storage().used(), expected_bytes);
        for (k, v) in &model {
            let got = cache.get(k)?;
            prop_assert_eq!(got.as_deref(), Some(&v[..]));
        }
        cache.close()?;
    }
}
