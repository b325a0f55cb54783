//! Cache configuration
//!
//! All tunables of the cache and its storage engine. Setters validate the
//! same bounds as [`CacheConfig::validate`], which is also run when a cache
//! is opened, so a config built by hand (struct literal) cannot bypass them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default stripe bit width (2^8 = 256 stripe locks)
pub const DEFAULT_CONCURRENCY_LEVEL: u8 = 8;

/// Highest supported stripe bit width (2^11 = 2048 stripe locks)
pub const MAX_CONCURRENCY_LEVEL: u8 = 11;

/// Default block capacity (128MB)
pub const DEFAULT_CAPACITY_PER_BLOCK: u32 = 128 * 1024 * 1024;

/// Smallest block capacity a cache accepts (16MB)
pub const MIN_CAPACITY_PER_BLOCK: u32 = 16 * 1024 * 1024;

/// Default number of blocks allocated up front (1GB with default capacity)
pub const DEFAULT_INITIAL_BLOCK_COUNT: u32 = 8;

/// Default purge interval (5 minutes)
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default merge interval (10 minutes)
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default dirty ratio above which a block is compacted
pub const DEFAULT_DIRTY_RATIO_THRESHOLD: f64 = 0.5;

/// Default off-heap budget (2GB)
pub const DEFAULT_MAX_OFFHEAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default maximum value length (4MB)
pub const DEFAULT_MAX_VALUE_LENGTH: u32 = 4 * 1024 * 1024;

/// Where block payloads live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// Every block is a plain file
    #[default]
    PureFile,
    /// Memory-mapped blocks until the off-heap budget is spent, then files
    MemoryMappedPlusFile,
    /// Raw off-heap memory blocks until the budget is spent, then files
    OffHeapPlusFile,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::PureFile => write!(f, "file"),
            StorageMode::MemoryMappedPlusFile => write!(f, "mmap+file"),
            StorageMode::OffHeapPlusFile => write!(f, "offheap+file"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "purefile" => Ok(StorageMode::PureFile),
            "mmap" | "mmap+file" | "memorymappedplusfile" => Ok(StorageMode::MemoryMappedPlusFile),
            "offheap" | "offheap+file" | "offheapplusfile" => Ok(StorageMode::OffHeapPlusFile),
            other => Err(Error::InvalidConfig(format!("unknown storage mode: {}", other))),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Stripe lock bit width; the cache uses 2^level stripes
    pub concurrency_level: u8,
    /// Capacity of each storage block in bytes
    pub capacity_per_block: u32,
    /// Blocks allocated when the cache opens
    pub initial_block_count: u32,
    /// Delay between expiry purge passes
    #[serde(with = "millis")]
    pub purge_interval: Duration,
    /// Delay between compaction passes
    #[serde(with = "millis")]
    pub merge_interval: Duration,
    /// Blocks whose dirty ratio exceeds this are compacted
    pub dirty_ratio_threshold: f64,
    /// Budget for mmap/off-heap blocks; beyond it new blocks are file-backed
    pub max_offheap_bytes: u64,
    /// Block storage mode
    pub storage_mode: StorageMode,
    /// Largest value accepted by put
    pub max_value_length: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            capacity_per_block: DEFAULT_CAPACITY_PER_BLOCK,
            initial_block_count: DEFAULT_INITIAL_BLOCK_COUNT,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            merge_interval: DEFAULT_MERGE_INTERVAL,
            dirty_ratio_threshold: DEFAULT_DIRTY_RATIO_THRESHOLD,
            max_offheap_bytes: DEFAULT_MAX_OFFHEAP_BYTES,
            storage_mode: StorageMode::PureFile,
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_concurrency_level(mut self, level: u8) -> Result<Self> {
        check_concurrency_level(level)?;
        self.concurrency_level = level;
        Ok(self)
    }

    pub fn with_capacity_per_block(mut self, capacity: u32) -> Result<Self> {
        check_capacity_per_block(capacity)?;
        self.capacity_per_block = capacity;
        Ok(self)
    }

    pub fn with_initial_block_count(mut self, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidConfig(
                "initial_block_count must be > 0".into(),
            ));
        }
        self.initial_block_count = count;
        Ok(self)
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Result<Self> {
        check_interval("purge_interval", interval)?;
        self.purge_interval = interval;
        Ok(self)
    }

    pub fn with_merge_interval(mut self, interval: Duration) -> Result<Self> {
        check_interval("merge_interval", interval)?;
        self.merge_interval = interval;
        Ok(self)
    }

    pub fn with_dirty_ratio_threshold(mut self, threshold: f64) -> Result<Self> {
        check_dirty_ratio(threshold)?;
        self.dirty_ratio_threshold = threshold;
        Ok(self)
    }

    /// Limit mmap/off-heap usage.
    ///
    /// Only takes effect for [`StorageMode::MemoryMappedPlusFile`] and
    /// [`StorageMode::OffHeapPlusFile`]. Must hold at least one block.
    pub fn with_max_offheap_bytes(mut self, bytes: u64) -> Result<Self> {
        if bytes < self.capacity_per_block as u64 {
            return Err(Error::InvalidConfig(format!(
                "max_offheap_bytes ({}) must be >= capacity_per_block ({})",
                bytes, self.capacity_per_block
            )));
        }
        self.max_offheap_bytes = bytes;
        Ok(self)
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn with_max_value_length(mut self, len: u32) -> Result<Self> {
        if len == 0 || len > self.capacity_per_block {
            return Err(Error::InvalidConfig(format!(
                "max_value_length must be in 1..={}",
                self.capacity_per_block
            )));
        }
        self.max_value_length = len;
        Ok(self)
    }

    /// Check every bound
    pub fn validate(&self) -> Result<()> {
        check_concurrency_level(self.concurrency_level)?;
        check_capacity_per_block(self.capacity_per_block)?;
        if self.initial_block_count == 0 {
            return Err(Error::InvalidConfig(
                "initial_block_count must be > 0".into(),
            ));
        }
        check_interval("purge_interval", self.purge_interval)?;
        check_interval("merge_interval", self.merge_interval)?;
        check_dirty_ratio(self.dirty_ratio_threshold)?;
        if self.storage_mode != StorageMode::PureFile
            && self.max_offheap_bytes < self.capacity_per_block as u64
        {
            return Err(Error::InvalidConfig(format!(
                "max_offheap_bytes ({}) must be >= capacity_per_block ({})",
                self.max_offheap_bytes, self.capacity_per_block
            )));
        }
        if self.max_value_length == 0 || self.max_value_length > self.capacity_per_block {
            return Err(Error::InvalidConfig(format!(
                "max_value_length ({}) must be in 1..={}",
                self.max_value_length, self.capacity_per_block
            )));
        }
        Ok(())
    }
}

fn check_concurrency_level(level: u8) -> Result<()> {
    if level > MAX_CONCURRENCY_LEVEL {
        return Err(Error::InvalidConfig(format!(
            "concurrency_level must be between 0 and {} inclusive",
            MAX_CONCURRENCY_LEVEL
        )));
    }
    Ok(())
}

fn check_capacity_per_block(capacity: u32) -> Result<()> {
    if capacity < MIN_CAPACITY_PER_BLOCK {
        return Err(Error::InvalidConfig(format!(
            "capacity_per_block must be at least {} bytes",
            MIN_CAPACITY_PER_BLOCK
        )));
    }
    Ok(())
}

fn check_interval(name: &str, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::InvalidConfig(format!("{} must be > 0", name)));
    }
    Ok(())
}

fn check_dirty_ratio(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::InvalidConfig(
            "dirty_ratio_threshold must be between 0 and 1".into(),
        ));
    }
    Ok(())
}

/// Durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency_level, 8);
        assert_eq!(config.max_value_length, 4 * 1024 * 1024);
        assert_eq!(config.storage_mode, StorageMode::PureFile);
    }

    #[test]
    fn test_concurrency_level_bounds() {
        assert!(CacheConfig::new().with_concurrency_level(0).is_ok());
        assert!(CacheConfig::new().with_concurrency_level(11).is_ok());
        assert!(CacheConfig::new().with_concurrency_level(12).is_err());
    }

    #[test]
    fn test_capacity_minimum() {
        assert!(CacheConfig::new()
            .with_capacity_per_block(16 * 1024 * 1024)
            .is_ok());
        assert!(CacheConfig::new()
            .with_capacity_per_block(16 * 1024 * 1024 - 1)
            .is_err());
    }

    #[test]
    fn test_offheap_budget() {
        let config = CacheConfig::new()
            .with_capacity_per_block(16 * 1024 * 1024)
            .unwrap()
            .with_storage_mode(StorageMode::OffHeapPlusFile)
            .with_max_offheap_bytes(40 * 1024 * 1024)
            .unwrap();
        assert_eq!(config.max_offheap_bytes, 40 * 1024 * 1024);
        assert!(config.validate().is_ok());

        let too_small = CacheConfig::new().with_max_offheap_bytes(1024);
        assert!(too_small.is_err());
    }

    #[test]
    fn test_dirty_ratio_bounds() {
        assert!(CacheConfig::new().with_dirty_ratio_threshold(0.0).is_ok());
        assert!(CacheConfig::new().with_dirty_ratio_threshold(1.0).is_ok());
        assert!(CacheConfig::new().with_dirty_ratio_threshold(1.5).is_err());
        assert!(CacheConfig::new().with_dirty_ratio_threshold(-0.1).is_err());
    }

    #[test]
    fn test_validate_catches_struct_literal() {
        let config = CacheConfig {
            initial_block_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            max_value_length: DEFAULT_CAPACITY_PER_BLOCK + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_uses_millis() {
        let json = r#"{"purge_interval": 1500, "storage_mode": "OffHeapPlusFile"}"#;
        let config = CacheConfig::from_json_str(json).unwrap();
        assert_eq!(config.purge_interval, Duration::from_millis(1500));
        assert_eq!(config.storage_mode, StorageMode::OffHeapPlusFile);
        assert_eq!(config.merge_interval, DEFAULT_MERGE_INTERVAL);

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["purge_interval"], 1500);
    }

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!("file".parse::<StorageMode>().unwrap(), StorageMode::PureFile);
        assert_eq!(
            "mmap".parse::<StorageMode>().unwrap(),
            StorageMode::MemoryMappedPlusFile
        );
        assert_eq!(
            "OffHeap".parse::<StorageMode>().unwrap(),
            StorageMode::OffHeapPlusFile
        );
        assert!("tape".parse::<StorageMode>().is_err());
    }
}
