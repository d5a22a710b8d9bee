//! Engine configuration.

use std::sync::Arc;

use crate::bloom::FilterPolicy;
use crate::cache::ShardedCache;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::sstable::block::Block;

/// The block cache shared by every table opened with the same options.
pub type BlockCache = ShardedCache<Block>;

/// Target uncompressed size of a data block (default: 4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Entries between restart points in a data block (default: 16)
pub const DEFAULT_BLOCK_RESTART_INTERVAL: usize = 16;

/// On-disk block compression. The kind byte is part of the file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionKind {
    None = 0,
    Snappy = 1,
}

impl CompressionKind {
    pub fn from_u8(kind: u8) -> Option<CompressionKind> {
        match kind {
            0 => Some(CompressionKind::None),
            1 => Some(CompressionKind::Snappy),
            _ => None,
        }
    }
}

/// Options controlling how tables are built and read.
#[derive(Clone)]
pub struct Options {
    /// Key ordering. Must match between the builder of a file and every
    /// reader that opens it.
    pub comparator: Arc<dyn Comparator>,

    /// Treat recoverable inconsistencies found while opening files as hard
    /// errors, and verify checksums on internal reads.
    pub paranoid_checks: bool,

    /// Cache of uncompressed data blocks, shared across tables.
    pub block_cache: Option<BlockCache>,

    /// Target uncompressed size of a data block.
    pub block_size: usize,

    /// Entries between restart points in a data block. The index block
    /// always restarts on every entry.
    pub block_restart_interval: usize,

    /// Compression applied to data blocks that shrink enough to be worth it.
    pub compression: CompressionKind,

    /// Filter policy accelerating negative point lookups, if any.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            paranoid_checks: false,
            block_cache: None,
            block_size: DEFAULT_BLOCK_SIZE,
            block_restart_interval: DEFAULT_BLOCK_RESTART_INTERVAL,
            compression: CompressionKind::Snappy,
            filter_policy: None,
        }
    }
}

impl Options {
    /// Set the comparator
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Enable paranoid checks
    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    /// Set the shared block cache
    pub fn block_cache(mut self, cache: BlockCache) -> Self {
        self.block_cache = Some(cache);
        self
    }

    /// Set the data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval for data blocks
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the block compression kind
    pub fn compression(mut self, kind: CompressionKind) -> Self {
        self.compression = kind;
        self
    }

    /// Set the filter policy
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }
}

/// Options for a single read.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify the checksum of every block read.
    pub verify_checksums: bool,

    /// Whether blocks read for this call should populate the block cache.
    /// Bulk scans usually turn this off.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable checksum verification
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Control block-cache population for this read
    pub fn fill_cache(mut self, enabled: bool) -> Self {
        self.fill_cache = enabled;
        self
    }
}
