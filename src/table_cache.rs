//! Caches open sorted tables keyed by file number.
//!
//! Opening a table costs a footer read, an index read, and possibly a filter
//! read, so readers share open tables through the same sharded LRU that
//! backs the block cache. Entries charge one unit each; capacity is "number
//! of open tables".

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::cache::{CacheHandle, ShardedCache};
use crate::coding::put_fixed64;
use crate::error::Result;
use crate::iterator::Iter;
use crate::options::{Options, ReadOptions};
use crate::sstable::table::Table;

/// Path of a numbered table file inside a database directory.
pub fn table_file_name(db_path: &Path, file_number: u64) -> PathBuf {
    db_path.join(format!("{file_number:06}.sst"))
}

pub struct TableCache {
    db_path: PathBuf,
    options: Options,
    cache: ShardedCache<Table>,
}

impl TableCache {
    /// `capacity` bounds how many tables stay open at once.
    pub fn new(db_path: impl Into<PathBuf>, options: Options, capacity: usize) -> TableCache {
        TableCache {
            db_path: db_path.into(),
            options,
            cache: ShardedCache::new(capacity),
        }
    }

    /// Point lookup through the numbered table; see
    /// [`Table::internal_get`].
    pub fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let handle = self.find_table(file_number, file_size)?;
        handle.value().internal_get(read_options, key, found)
    }

    /// Iterates the numbered table. The iterator keeps the table pinned in
    /// the cache until dropped.
    pub fn iter(
        &self,
        read_options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableCacheIter> {
        let handle = self.find_table(file_number, file_size)?;
        let table = handle.clone_value();
        Ok(TableCacheIter {
            inner: Box::new(table.iter(read_options)),
            _handle: handle,
        })
    }

    /// Drops the cache entry for a table file, typically after the file is
    /// deleted. Readers still holding the table keep it alive.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&cache_key(file_number));
    }

    fn find_table(&self, file_number: u64, file_size: u64) -> Result<CacheHandle<Table>> {
        let key = cache_key(file_number);
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(handle);
        }

        let path = table_file_name(&self.db_path, file_number);
        let file = File::open(&path)?;
        let table = Table::open(self.options.clone(), Box::new(file), file_size)?;
        Ok(self.cache.insert(&key, table, 1))
    }
}

fn cache_key(file_number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    put_fixed64(&mut key, file_number);
    key
}

/// A table iterator bundled with the cache handle that keeps its table
/// open.
pub struct TableCacheIter {
    inner: Box<dyn Iter>,
    _handle: CacheHandle<Table>,
}

impl Iter for TableCacheIter {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
    }

    fn next(&mut self) {
        self.inner.next();
    }

    fn prev(&mut self) {
        self.inner.prev();
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn status(&self) -> Result<()> {
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use crate::error::Error;
    use crate::options::CompressionKind;
    use crate::sstable::builder::TableBuilder;

    fn options() -> Options {
        Options::default().compression(CompressionKind::None)
    }

    /// Writes table file `file_number` with `count` entries and returns its
    /// size.
    fn write_table(dir: &Path, file_number: u64, count: u32) -> u64 {
        let path = table_file_name(dir, file_number);
        let mut file = File::create(path).expect("create failed");
        let mut builder = TableBuilder::new(options(), &mut file);
        for i in 0..count {
            builder
                .add(
                    format!("key_{i:04}").as_bytes(),
                    format!("val_{file_number}_{i:04}").as_bytes(),
                )
                .expect("add failed");
        }
        builder.finish().expect("finish failed");
        let size = builder.file_size();
        drop(builder);
        file.flush().expect("flush failed");
        size
    }

    fn lookup(cache: &TableCache, file_number: u64, file_size: u64, key: &[u8]) -> Option<Vec<u8>> {
        let mut result = None;
        cache
            .get(&ReadOptions::new(), file_number, file_size, key, &mut |k, v| {
                if k == key {
                    result = Some(v.to_vec());
                }
            })
            .expect("get failed");
        result
    }

    #[test]
    fn test_get_through_cache() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let size = write_table(dir.path(), 1, 100);
        let cache = TableCache::new(dir.path(), options(), 16);

        assert_eq!(
            lookup(&cache, 1, size, b"key_0042"),
            Some(b"val_1_0042".to_vec())
        );
        // Second read hits the cached table.
        assert_eq!(
            lookup(&cache, 1, size, b"key_0007"),
            Some(b"val_1_0007".to_vec())
        );
        assert_eq!(lookup(&cache, 1, size, b"zzz"), None);
    }

    #[test]
    fn test_multiple_files_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let size1 = write_table(dir.path(), 1, 10);
        let size2 = write_table(dir.path(), 2, 10);
        let cache = TableCache::new(dir.path(), options(), 16);

        assert_eq!(
            lookup(&cache, 1, size1, b"key_0003"),
            Some(b"val_1_0003".to_vec())
        );
        assert_eq!(
            lookup(&cache, 2, size2, b"key_0003"),
            Some(b"val_2_0003".to_vec())
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let cache = TableCache::new(dir.path(), options(), 16);
        let result = cache.get(&ReadOptions::new(), 42, 1000, b"key", &mut |_, _| {});
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_iter_scans_whole_file() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let size = write_table(dir.path(), 3, 50);
        let cache = TableCache::new(dir.path(), options(), 16);

        let mut iter = cache
            .iter(ReadOptions::new(), 3, size)
            .expect("iter failed");
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            assert_eq!(iter.key(), format!("key_{count:04}").as_bytes());
            count += 1;
            iter.next();
        }
        assert_eq!(count, 50);
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_evict_reopens_next_time() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let size = write_table(dir.path(), 4, 10);
        let cache = TableCache::new(dir.path(), options(), 16);

        assert!(lookup(&cache, 4, size, b"key_0001").is_some());
        cache.evict(4);
        // Still readable: the file is reopened on demand.
        assert!(lookup(&cache, 4, size, b"key_0001").is_some());

        // An iterator holds the table across an evict.
        let mut iter = cache.iter(ReadOptions::new(), 4, size).expect("iter failed");
        iter.seek_to_first();
        cache.evict(4);
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key_0000");
    }

    #[test]
    fn test_capacity_evicts_old_tables() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut sizes = Vec::new();
        for file_number in 0..32u64 {
            sizes.push(write_table(dir.path(), file_number, 5));
        }
        let cache = TableCache::new(dir.path(), options(), 4);

        // Cycle through far more tables than the cache holds; every lookup
        // still succeeds by reopening as needed.
        for round in 0..3 {
            for file_number in 0..32u64 {
                let value = lookup(&cache, file_number, sizes[file_number as usize], b"key_0002");
                assert_eq!(
                    value,
                    Some(format!("val_{file_number}_0002").into_bytes()),
                    "round {round}"
                );
            }
        }
    }
}
