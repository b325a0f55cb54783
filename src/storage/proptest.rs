//! Property-Based Tests for the storage engine
//!
//! # Test Properties
//!
//! 1. **Roundtrip**: every live pointer reads back the last bytes written
//! 2. **Used-byte conservation**: manager `used()` equals the sum of live
//!    pointer lengths after any sequence of store/update/remove
//! 3. **Dirty accounting**: used + dirty never exceeds what was allocated

#![cfg(test)]

use proptest::prelude::*;
use tempfile::tempdir;

use super::manager::StorageManager;
use super::pointer::Pointer;
use crate::config::StorageMode;

/// Small blocks so short op sequences still cross block boundaries
const BLOCK: u32 = 64 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Store(Vec<u8>),
    Update(usize, Vec<u8>),
    Remove(usize),
}

// =============================================================================
// Property Strategies
// =============================================================================

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..8192)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => payload_strategy().prop_map(Op::Store),
        2 => (any::<usize>(), payload_strategy()).prop_map(|(i, p)| Op::Update(i, p)),
        1 => any::<usize>().prop_map(Op::Remove),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..120)
}

fn mode_strategy() -> impl Strategy<Value = StorageMode> {
    prop_oneof![
        Just(StorageMode::PureFile),
        Just(StorageMode::MemoryMappedPlusFile),
        Just(StorageMode::OffHeapPlusFile),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: live pointers always read back their payload and the
    /// manager's used bytes equal the sum of live lengths.
    #[test]
    fn prop_store_update_remove_conserves_used(
        mode in mode_strategy(),
        ops in ops_strategy(),
    ) {
        let dir = tempdir()?;
        // budget of 4 blocks, then file downgrade
        let manager = StorageManager::new(dir.path(), BLOCK, 2, mode, 4 * BLOCK as u64)?;
        let mut live: Vec<(Pointer, Vec<u8>)> = Vec::new();
        let mut allocated: i64 = 0;

        for op in ops {
            match op {
                Op::Store(payload) => {
                    let pointer = manager.store(&payload)?;
                    allocated += payload.len() as i64;
                    live.push((pointer, payload));
                }
                Op::Update(i, payload) if !live.is_empty() => {
                    let idx = i % live.len();
                    let old_len = live[idx].0.length() as usize;
                    let pointer = manager.update(&live[idx].0, &payload)?;
                    if payload.len() > old_len {
                        allocated += payload.len() as i64;
                    }
                    live[idx] = (pointer, payload);
                }
                Op::Remove(i) if !live.is_empty() => {
                    let idx = i % live.len();
                    let (pointer, payload) = live.swap_remove(idx);
                    let removed = manager.remove(&pointer)?;
                    prop_assert_eq!(&removed[..], &payload[..]);
                }
                _ => {}
            }

            let expected: i64 = live.iter().map(|(p, _)| p.length() as i64).sum();
            prop_assert_eq!(manager.used(), expected);
            prop_assert!(manager.dirty() >= 0);
        }

        for (pointer, payload) in &live {
            let read = manager.retrieve(pointer)?;
            prop_assert_eq!(&read[..], &payload[..]);
        }
        prop_assert!(manager.used() + manager.dirty() <= allocated);
        manager.close()?;
    }

    /// Property: cleaning never reclaims a block that still holds live data.
    #[test]
    fn prop_clean_keeps_live_blocks(
        payloads in prop::collection::vec(payload_strategy(), 1..80),
        drop_mask in prop::collection::vec(any::<bool>(), 80),
    ) {
        let dir = tempdir()?;
        let manager = StorageManager::new(dir.path(), BLOCK, 1, StorageMode::OffHeapPlusFile, 8 * BLOCK as u64)?;

        let mut kept = Vec::new();
        for (payload, drop) in payloads.iter().zip(drop_mask.iter()) {
            let pointer = manager.store(payload)?;
            if *drop {
                manager.remove_light(&pointer);
            } else {
                kept.push((pointer, payload.clone()));
            }
        }

        manager.clean()?;
        for (pointer, payload) in &kept {
            prop_assert!(pointer.block().used() > 0 || pointer.length() == 0);
            let read = manager.retrieve(pointer)?;
            prop_assert_eq!(&read[..], &payload[..]);
        }
    }
}
