//! Persistent storage engine
//!
//! Layers, bottom up:
//! - [`StorageBackend`]: raw byte region (file, mmap or off-heap)
//! - [`StorageBlock`]: bump allocator with used/dirty accounting
//! - [`StorageManager`]: pool of blocks with one active block

pub mod backend;
pub mod block;
pub mod dir;
pub mod file;
pub mod manager;
pub mod mmap;
pub mod offheap;
pub mod pointer;
mod proptest;

pub use backend::{BackendKind, StorageBackend};
pub use block::{Allocation, StorageBlock};
pub use file::FileBackend;
pub use manager::StorageManager;
pub use mmap::MmapBackend;
pub use offheap::OffHeapBackend;
pub use pointer::Pointer;
