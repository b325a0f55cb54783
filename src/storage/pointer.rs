//! Pointer into a storage block

use std::fmt;
use std::sync::Arc;

use super::block::StorageBlock;

/// Location of one stored value: `(offset, length, block)`.
///
/// Immutable; an update yields a new pointer. Holding a pointer keeps the
/// block struct alive but does not keep the byte range valid: that is up to
/// the cache's locking protocol.
#[derive(Clone)]
pub struct Pointer {
    offset: u32,
    length: u32,
    block: Arc<StorageBlock>,
}

impl Pointer {
    pub(crate) fn new(offset: u32, length: u32, block: Arc<StorageBlock>) -> Self {
        Self {
            offset,
            length,
            block,
        }
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Block holding the bytes
    #[inline]
    pub fn block(&self) -> &Arc<StorageBlock> {
        &self.block
    }

    /// Index of the block holding the bytes
    #[inline]
    pub fn block_index(&self) -> u32 {
        self.block.index()
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
            && self.length == other.length
            && self.block.index() == other.block.index()
    }
}

impl Eq for Pointer {}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("block", &self.block.index())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}
