//! EmberDB storage core: immutable sorted tables, the in-memory table that
//! feeds them, and the sharded block cache they read through.
//!
//! Writes land in a [`memtable::Memtable`]; a full memtable is streamed out
//! through a [`sstable::builder::TableBuilder`] into an immutable file that
//! a [`sstable::table::Table`] later reads, with point lookups accelerated
//! by Bloom filters and data blocks shared across readers via the
//! [`cache::ShardedCache`].

#[macro_use]
pub mod error;

pub mod arena;
pub mod bloom;
pub mod cache;
pub mod coding;
pub mod comparator;
pub mod fs;
pub mod hash;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod options;
pub mod sstable;
pub mod table_cache;
pub mod wal;

pub use bloom::{BloomFilterPolicy, FilterPolicy};
pub use cache::{CacheHandle, ShardedCache};
pub use comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use error::{Error, Result};
pub use iterator::Iter;
pub use key::{LookupKey, SequenceNumber, ValueKind, MAX_SEQUENCE_NUMBER};
pub use memtable::Memtable;
pub use options::{BlockCache, CompressionKind, Options, ReadOptions};
pub use sstable::builder::TableBuilder;
pub use sstable::table::Table;
pub use table_cache::TableCache;
