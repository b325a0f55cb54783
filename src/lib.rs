//! blockcache - Embedded Persistent Block Cache
//!
//! A key → byte-blob cache that keeps only a small index in memory and
//! spills every payload byte into large append-only storage blocks backed
//! by files, private memory maps or raw off-heap memory.
//!
//! # Architecture
//!
//! ```text
//! BlockCache ──▶ StripedLock + index ──▶ StorageManager ──▶ StorageBlock ──▶ StorageBackend
//!     ▲                                        ▲
//!     └──── purge / merge daemons ─────────────┘
//! ```
//!
//! - Blocks hand out space with a bump pointer and never reuse a range
//!   until the whole block is recycled.
//! - Overwritten, deleted and expired bytes are only counted as dirty.
//! - The purge daemon drops idle-expired entries; the merge daemon moves
//!   live entries out of mostly-dirty blocks so they can be recycled.
//! - Blocks are ephemeral: a cache always starts from an empty directory.
//!
//! # Modules
//!
//! - [`cache`] - Cache facade, entry handles, stripe locks, statistics
//! - [`config`] - Configuration
//! - [`error`] - Error types
//! - [`maintenance`] - Background purge and merge
//! - [`storage`] - Blocks, backends and the block pool
//! - [`store`] - Upper-layer store contract

pub mod cache;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use cache::{BlockCache, CacheKey, CacheStats};
pub use config::{CacheConfig, StorageMode};
pub use error::{Error, Result};
pub use maintenance::{MergeReport, PurgeReport};
pub use storage::{BackendKind, Pointer, StorageBlock, StorageManager};
pub use store::{CacheStore, TypedStore};
