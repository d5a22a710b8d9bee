//! Immutable sorted-table reader.
//!
//! Opening a table reads the footer, the index block, and the metaindex; a
//! configured filter policy additionally pulls in the filter block. Point
//! lookups then run Filter -> Index -> Block, touching at most one data
//! block, and full scans drive a two-level iterator over the index. Data
//! blocks are fetched through the shared block cache when one is
//! configured.
//!
//! Every method on an open table is safe to call from concurrent threads.

use std::sync::Arc;

use log::warn;

use crate::cache::CacheHandle;
use crate::coding::{get_length_prefixed_slice, put_fixed64};
use crate::error::{Error, Result};
use crate::fs::RandomAccessFile;
use crate::iterator::{EmptyIter, Iter};
use crate::options::{Options, ReadOptions};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::builder::{COMPARATOR_META_KEY, FILTER_META_PREFIX};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::format::{read_block, BlockHandle, Footer};
use crate::sstable::two_level::TwoLevelIterator;
use crate::comparator::BytewiseComparator;

pub struct Table {
    options: Options,
    file: Box<dyn RandomAccessFile>,
    /// Prefixes this table's block-cache keys; 0 when no cache is
    /// configured.
    cache_id: u64,
    filter: Option<FilterBlockReader>,
    metaindex_handle: BlockHandle,
    index_block: Arc<Block>,
}

impl Table {
    /// Opens a sorted table from `file`, whose length is `size` bytes.
    /// Fails on anything that makes reads impossible: a bad footer, an
    /// unreadable index block, or a comparator mismatch. A damaged filter
    /// block merely disables filtering.
    pub fn open(options: Options, file: Box<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if (size as usize) < Footer::ENCODED_LENGTH {
            return errcorrupt!("file is too short to be a sorted table");
        }
        let mut footer_bytes = vec![0u8; Footer::ENCODED_LENGTH];
        let read = file.read_at(size - Footer::ENCODED_LENGTH as u64, &mut footer_bytes)?;
        if read < footer_bytes.len() {
            return errcorrupt!("truncated footer read");
        }
        let footer = Footer::decode_from(&footer_bytes)?;

        let index_read_options = ReadOptions::new().verify_checksums(options.paranoid_checks);
        let index_contents = read_block(file.as_ref(), &index_read_options, &footer.index_handle)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = options
            .block_cache
            .as_ref()
            .map_or(0, |cache| cache.new_id());

        let mut table = Table {
            options,
            file,
            cache_id,
            filter: None,
            metaindex_handle: footer.metaindex_handle,
            index_block,
        };
        table.read_meta(&footer)?;
        Ok(table)
    }

    /// Reads the metaindex: enforces the comparator name when recorded and
    /// loads the filter block when one matches the configured policy.
    fn read_meta(&mut self, footer: &Footer) -> Result<()> {
        let read_options = ReadOptions::new().verify_checksums(self.options.paranoid_checks);
        let contents = match read_block(self.file.as_ref(), &read_options, &footer.metaindex_handle)
        {
            Ok(contents) => contents,
            Err(e) => {
                // Filtering is an optimization; reads still work without
                // the metaindex.
                warn!("skipping metaindex: {e}");
                return Ok(());
            }
        };
        let meta_block = match Block::new(contents) {
            Ok(block) => Arc::new(block),
            Err(e) => {
                warn!("skipping unparsable metaindex: {e}");
                return Ok(());
            }
        };
        let mut iter = Arc::clone(&meta_block).iter(Arc::new(BytewiseComparator));

        iter.seek(COMPARATOR_META_KEY);
        if iter.valid() && iter.key() == COMPARATOR_META_KEY {
            let mut value = iter.value();
            let recorded = get_length_prefixed_slice(&mut value).unwrap_or(b"");
            if recorded != self.options.comparator.name().as_bytes() {
                return Err(Error::NotSupported(format!(
                    "table was built with comparator {}, opened with {}",
                    String::from_utf8_lossy(recorded),
                    self.options.comparator.name()
                )));
            }
        }

        if let Some(policy) = self.options.filter_policy.clone() {
            let key = format!("{}{}", FILTER_META_PREFIX, policy.name());
            iter.seek(key.as_bytes());
            if iter.valid() && iter.key() == key.as_bytes() {
                let mut value = iter.value();
                match BlockHandle::decode_from(&mut value) {
                    Ok(handle) => match read_block(self.file.as_ref(), &read_options, &handle) {
                        Ok(filter_data) => {
                            self.filter = Some(FilterBlockReader::new(policy, filter_data));
                        }
                        Err(e) => warn!("skipping unreadable filter block: {e}"),
                    },
                    Err(e) => warn!("skipping filter with bad handle: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Opens the data block an index entry points at, going through the
    /// block cache when one is configured. Errors come back as an empty
    /// iterator carrying the status.
    fn block_iter(&self, read_options: &ReadOptions, index_value: &[u8]) -> Box<dyn Iter> {
        let mut input = index_value;
        let handle = match BlockHandle::decode_from(&mut input) {
            Ok(handle) => handle,
            Err(e) => return Box::new(EmptyIter::new(Err(e))),
        };

        let comparator = self.options.comparator.clone();
        match &self.options.block_cache {
            Some(cache) => {
                let mut cache_key = Vec::with_capacity(16);
                put_fixed64(&mut cache_key, self.cache_id);
                put_fixed64(&mut cache_key, handle.offset());

                if let Some(cache_handle) = cache.lookup(&cache_key) {
                    let block = cache_handle.clone_value();
                    return Box::new(PinnedBlockIter {
                        inner: block.iter(comparator),
                        _pin: cache_handle,
                    });
                }

                let block = match self.read_data_block(read_options, &handle) {
                    Ok(block) => block,
                    Err(e) => return Box::new(EmptyIter::new(Err(e))),
                };
                if read_options.fill_cache {
                    let charge = block.size();
                    let cache_handle = cache.insert(&cache_key, block, charge);
                    let block = cache_handle.clone_value();
                    Box::new(PinnedBlockIter {
                        inner: block.iter(comparator),
                        _pin: cache_handle,
                    })
                } else {
                    Box::new(Arc::new(block).iter(comparator))
                }
            }
            None => match self.read_data_block(read_options, &handle) {
                Ok(block) => Box::new(Arc::new(block).iter(comparator)),
                Err(e) => Box::new(EmptyIter::new(Err(e))),
            },
        }
    }

    fn read_data_block(&self, read_options: &ReadOptions, handle: &BlockHandle) -> Result<Block> {
        let contents = read_block(self.file.as_ref(), read_options, handle)?;
        Block::new(contents)
    }

    /// Point lookup. Seeks the index, consults the filter, and seeks inside
    /// at most one data block; `found` receives the entry the seek landed
    /// on. Callers interpret the key's trailer themselves and must compare
    /// user keys before trusting the entry.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        key: &[u8],
        found: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        let mut index_iter = Arc::clone(&self.index_block).iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            let handle_value = index_iter.value();

            let may_match = match &self.filter {
                Some(filter) => {
                    let mut input = handle_value;
                    match BlockHandle::decode_from(&mut input) {
                        Ok(handle) => filter.key_may_match(handle.offset(), key),
                        Err(_) => true,
                    }
                }
                None => true,
            };

            if may_match {
                let mut block_iter = self.block_iter(read_options, handle_value);
                block_iter.seek(key);
                if block_iter.valid() {
                    found(block_iter.key(), block_iter.value());
                }
                block_iter.status()?;
            }
        }
        index_iter.status()
    }

    /// Iterates every entry in key order.
    pub fn iter(self: Arc<Self>, read_options: ReadOptions) -> impl Iter {
        let index_iter = Arc::clone(&self.index_block).iter(self.options.comparator.clone());
        let table = self;
        TwoLevelIterator::new(index_iter, move |index_value: &[u8]| {
            table.block_iter(&read_options, index_value)
        })
    }

    /// File offset at which `key`'s data would live; an upper bound of the
    /// metaindex offset for keys past the end of the table.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = Arc::clone(&self.index_block).iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            let mut value = index_iter.value();
            if let Ok(handle) = BlockHandle::decode_from(&mut value) {
                return handle.offset();
            }
        }
        // Past the last key (or an unparsable entry): the metaindex begins
        // right after the data region.
        self.metaindex_handle.offset()
    }
}

/// A block iterator plus the cache handle pinning its block.
struct PinnedBlockIter {
    inner: BlockIter,
    _pin: CacheHandle<Block>,
}

impl Iter for PinnedBlockIter {
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
