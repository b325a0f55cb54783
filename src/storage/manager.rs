//! Storage Manager - pool of storage blocks
//!
//! Exactly one block is active and receives appends. Blocks that filled up
//! stay in the used list until every value in them has been released, at
//! which point [`StorageManager::clean`] moves them to the free pool. The
//! free pool always hands out the lowest index first so low-numbered blocks
//! are reused before the pool grows.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::backend::BackendKind;
use super::block::StorageBlock;
use super::pointer::Pointer;
use crate::config::StorageMode;
use crate::error::{Error, Result};

/// Block lists guarded by the block-switch lock
struct BlockPools {
    /// Includes the active block
    used: Vec<Arc<StorageBlock>>,
    free: BinaryHeap<Reverse<Arc<StorageBlock>>>,
    next_index: u32,
    /// Blocks of the configured kind still allowed before downgrading to files
    special_budget: u32,
}

/// Manages the block pool for one cache instance
pub struct StorageManager {
    dir: PathBuf,
    capacity_per_block: u32,
    kind: BackendKind,
    active: RwLock<Arc<StorageBlock>>,
    pools: Mutex<BlockPools>,
    downgraded_blocks: AtomicU64,
    special_blocks: AtomicU64,
    closed: AtomicBool,
}

impl StorageManager {
    /// Pre-allocate `initial_blocks` blocks and activate the lowest one
    pub fn new(
        dir: impl AsRef<Path>,
        capacity_per_block: u32,
        initial_blocks: u32,
        mode: StorageMode,
        max_offheap_bytes: u64,
    ) -> Result<Self> {
        if capacity_per_block == 0 {
            return Err(Error::InvalidArgument(
                "capacity per block must be > 0".into(),
            ));
        }
        if initial_blocks == 0 {
            return Err(Error::InvalidArgument(
                "initial block count must be > 0".into(),
            ));
        }

        let kind = BackendKind::for_mode(mode);
        let special_budget = match kind {
            BackendKind::File => 0,
            _ => u32::try_from(max_offheap_bytes / capacity_per_block as u64).unwrap_or(u32::MAX),
        };

        let mut pools = BlockPools {
            used: Vec::new(),
            free: BinaryHeap::new(),
            next_index: 0,
            special_budget,
        };

        let dir = dir.as_ref().to_path_buf();
        let downgraded_blocks = AtomicU64::new(0);
        let special_blocks = AtomicU64::new(0);
        for _ in 0..initial_blocks {
            let block = create_block(
                &dir,
                capacity_per_block,
                kind,
                &mut pools,
                &downgraded_blocks,
                &special_blocks,
            )?;
            pools.free.push(Reverse(block));
        }

        let active = pools
            .free
            .pop()
            .map(|Reverse(block)| block)
            .ok_or_else(|| Error::IllegalState("no initial block".into()))?;
        pools.used.push(Arc::clone(&active));

        info!(
            dir = %dir.display(),
            kind = %kind,
            capacity_per_block,
            initial_blocks,
            "Storage manager initialized"
        );

        Ok(Self {
            dir,
            capacity_per_block,
            kind,
            active: RwLock::new(active),
            pools: Mutex::new(pools),
            downgraded_blocks,
            special_blocks,
            closed: AtomicBool::new(false),
        })
    }

    /// Append `payload` to the active block, switching blocks when it is full
    pub fn store(&self, payload: &[u8]) -> Result<Pointer> {
        self.check_open()?;
        if payload.len() > self.capacity_per_block as usize {
            return Err(Error::ValueTooLarge {
                len: payload.len(),
                max: self.capacity_per_block as usize,
            });
        }

        let active = self.active_block();
        if let Some(pointer) = active.store(payload)? {
            return Ok(pointer);
        }

        let mut pools = self.pools.lock();
        // another thread may have switched already
        let active = self.active_block();
        if let Some(pointer) = active.store(payload)? {
            return Ok(pointer);
        }

        // Fill the next block before publishing it, so the fast path cannot
        // use up its space first.
        let next = self.next_block(&mut pools)?;
        let stored = next.store(payload);
        self.install_active(&mut pools, Arc::clone(&next));
        stored?.ok_or_else(|| {
            Error::IllegalState(format!(
                "fresh block {} cannot hold {} bytes",
                next.index(),
                payload.len()
            ))
        })
    }

    /// Store `payload` anywhere but `excluded`
    pub fn store_excluding(&self, payload: &[u8], excluded: &StorageBlock) -> Result<Pointer> {
        self.check_open()?;
        while self.active_block().index() == excluded.index() {
            let mut pools = self.pools.lock();
            if self.active_block().index() != excluded.index() {
                break;
            }
            let next = self.next_block(&mut pools)?;
            self.install_active(&mut pools, next);
        }
        self.store(payload)
    }

    /// Rewrite the value at `pointer`, relocating it if it no longer fits
    pub fn update(&self, pointer: &Pointer, payload: &[u8]) -> Result<Pointer> {
        self.check_open()?;
        if let Some(updated) = pointer.block().update(pointer, payload)? {
            return Ok(updated);
        }
        let relocated = self.store(payload)?;
        pointer.block().remove_light(pointer);
        Ok(relocated)
    }

    pub fn retrieve(&self, pointer: &Pointer) -> Result<Bytes> {
        pointer.block().retrieve(pointer)
    }

    pub fn remove(&self, pointer: &Pointer) -> Result<Bytes> {
        pointer.block().remove(pointer)
    }

    pub fn remove_light(&self, pointer: &Pointer) {
        pointer.block().remove_light(pointer)
    }

    /// Return every block to the free pool and reactivate the lowest one
    pub fn free(&self) -> Result<()> {
        self.check_open()?;
        let mut pools = self.pools.lock();
        let used: Vec<_> = pools.used.drain(..).collect();
        for block in used {
            block.free()?;
            pools.free.push(Reverse(block));
        }
        let active = pools
            .free
            .pop()
            .map(|Reverse(block)| block)
            .ok_or_else(|| Error::IllegalState("free pool empty after free".into()))?;
        pools.used.push(Arc::clone(&active));
        *self.active.write() = active;
        Ok(())
    }

    /// Move every non-active used block holding no live bytes to the free
    /// pool. Returns the number of blocks reclaimed.
    pub fn clean(&self) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut pools = self.pools.lock();
        let active_index = self.active_block().index();

        let (empty, keep): (Vec<_>, Vec<_>) = pools
            .used
            .drain(..)
            .partition(|block| block.index() != active_index && block.used() == 0);
        pools.used = keep;

        let reclaimed = empty.len();
        let mut result = Ok(());
        for block in empty {
            if let Err(e) = block.free() {
                warn!(block = block.index(), error = %e, "Failed to reset block");
                result = Err(e);
            }
            pools.free.push(Reverse(block));
        }
        if reclaimed > 0 {
            debug!(reclaimed, free = pools.free.len(), "Reclaimed empty blocks");
        }
        result.map(|_| reclaimed)
    }

    /// Release every block. Stores fail with [`Error::Closed`] afterwards.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut pools = self.pools.lock();
        let mut first_err = None;
        let free: Vec<_> = pools.free.drain().map(|Reverse(b)| b).collect();
        for block in pools.used.drain(..).chain(free) {
            if let Err(e) = block.close() {
                warn!(block = block.index(), error = %e, "Failed to release block");
                first_err.get_or_insert(e);
            }
        }
        info!(dir = %self.dir.display(), "Storage manager closed");
        first_err.map_or(Ok(()), Err)
    }

    /// Pop the lowest free block, or create one. The block is private to
    /// the caller until [`Self::install_active`] publishes it.
    fn next_block(&self, pools: &mut BlockPools) -> Result<Arc<StorageBlock>> {
        match pools.free.pop() {
            Some(Reverse(block)) => Ok(block),
            None => create_block(
                &self.dir,
                self.capacity_per_block,
                self.kind,
                pools,
                &self.downgraded_blocks,
                &self.special_blocks,
            ),
        }
    }

    /// Track `next` as used and make it the active block
    fn install_active(&self, pools: &mut BlockPools, next: Arc<StorageBlock>) {
        pools.used.push(Arc::clone(&next));
        let previous = std::mem::replace(&mut *self.active.write(), Arc::clone(&next));
        debug!(from = previous.index(), to = next.index(), "Switched active block");
    }

    fn active_block(&self) -> Arc<StorageBlock> {
        Arc::clone(&self.active.read())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Live bytes across used blocks
    pub fn used(&self) -> i64 {
        self.pools.lock().used.iter().map(|b| b.used()).sum()
    }

    /// Dirty bytes across used blocks
    pub fn dirty(&self) -> i64 {
        self.pools.lock().used.iter().map(|b| b.dirty()).sum()
    }

    /// Capacity of all blocks, used and free
    pub fn capacity(&self) -> u64 {
        self.total_block_count() as u64 * self.capacity_per_block as u64
    }

    pub fn dirty_ratio(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.dirty() as f64 / capacity as f64
    }

    pub fn used_block_count(&self) -> usize {
        self.pools.lock().used.len()
    }

    pub fn free_block_count(&self) -> usize {
        self.pools.lock().free.len()
    }

    pub fn total_block_count(&self) -> usize {
        let pools = self.pools.lock();
        pools.used.len() + pools.free.len()
    }

    /// Blocks created as plain files after the memory budget ran out
    pub fn downgraded_blocks(&self) -> u64 {
        self.downgraded_blocks.load(Ordering::Relaxed)
    }

    /// Blocks created with the configured mmap or off-heap backend
    pub fn special_blocks(&self) -> u64 {
        self.special_blocks.load(Ordering::Relaxed)
    }

    pub fn active_index(&self) -> u32 {
        self.active_block().index()
    }

}

fn create_block(
    dir: &Path,
    capacity: u32,
    kind: BackendKind,
    pools: &mut BlockPools,
    downgraded: &AtomicU64,
    special: &AtomicU64,
) -> Result<Arc<StorageBlock>> {
    let index = pools.next_index;
    let kind = match kind {
        BackendKind::File => BackendKind::File,
        _ if pools.special_budget > 0 => {
            pools.special_budget -= 1;
            special.fetch_add(1, Ordering::Relaxed);
            kind
        }
        _ => {
            downgraded.fetch_add(1, Ordering::Relaxed);
            warn!(
                block = index,
                requested = %kind,
                "Memory budget exhausted, falling back to file storage"
            );
            BackendKind::File
        }
    };

    let block = StorageBlock::open(dir, index, capacity, kind)?;
    pools.next_index += 1;
    debug!(block = index, kind = %kind, capacity, "Created storage block");
    Ok(Arc::new(block))
}
