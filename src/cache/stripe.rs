//! Striped read/write locks
//!
//! A fixed table of `2^level` locks guarding the key space. Keys map to a
//! stripe by hash, so unrelated keys rarely contend while all writers of one
//! key serialize.
//!
//! # Design
//!
//! - Power-of-2 stripe count enables fast modulo via bitwise AND
//! - Each lock sits on its own cache line to prevent false sharing
//! - The hasher is deterministic, so a key maps to the same stripe for the
//!   lifetime of the process (maintenance groups keys by stripe)

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::MAX_CONCURRENCY_LEVEL;
use crate::error::{Error, Result};

/// Cache line size for padding
pub const CACHE_LINE_SIZE: usize = 64;

#[repr(align(64))]
#[derive(Default)]
struct Stripe(RwLock<()>);

/// Table of `2^level` reader/writer locks
pub struct StripedLock {
    stripes: Box<[Stripe]>,
    mask: usize,
}

impl StripedLock {
    /// Create `2^level` stripes; `level` must be within `0..=11`
    pub fn new(level: u8) -> Result<Self> {
        if level > MAX_CONCURRENCY_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "concurrency level must be within 0..={MAX_CONCURRENCY_LEVEL}, got {level}"
            )));
        }
        let count = 1usize << level;
        Ok(Self {
            stripes: (0..count).map(|_| Stripe::default()).collect(),
            mask: count - 1,
        })
    }

    /// Stripe guarding `key`
    pub fn stripe_index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    pub fn read<K: Hash + ?Sized>(&self, key: &K) -> RwLockReadGuard<'_, ()> {
        self.read_stripe(self.stripe_index(key))
    }

    pub fn write<K: Hash + ?Sized>(&self, key: &K) -> RwLockWriteGuard<'_, ()> {
        self.write_stripe(self.stripe_index(key))
    }

    pub fn read_stripe(&self, index: usize) -> RwLockReadGuard<'_, ()> {
        self.stripes[index & self.mask].0.read()
    }

    pub fn write_stripe(&self, index: usize) -> RwLockWriteGuard<'_, ()> {
        self.stripes[index & self.mask].0.write()
    }

    /// Number of stripes
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
