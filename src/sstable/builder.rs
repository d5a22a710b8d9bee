//! Streams sorted entries into an immutable table file.
//!
//! The builder cuts data blocks at a size threshold, remembers each flushed
//! block's handle, and only emits that block's index entry on the first add
//! into the next block, when both bounding keys are known and the separator
//! between them can be shortened. `finish` seals the file with the filter
//! block, the metaindex, the index, and the footer.

use std::io::Write;

use crate::coding::put_length_prefixed_slice;
use crate::error::Result;
use crate::options::{CompressionKind, Options};
use crate::sstable::block::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::format::{mask_crc, BlockHandle, Footer, BLOCK_TRAILER_SIZE, CRC32C};

/// Metaindex key under which the comparator's name is persisted.
pub const COMPARATOR_META_KEY: &[u8] = b"emberdb.comparator";

/// Metaindex key prefix for the filter block; the policy name follows.
pub const FILTER_META_PREFIX: &str = "filter.";

/// Index blocks restart on every entry so each one is binary searchable.
const INDEX_RESTART_INTERVAL: usize = 1;

/// Compressed output must be at least one eighth smaller than the input to
/// be worth storing.
const COMPRESSION_SAVINGS_DENOM: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Building,
    Finished,
    Abandoned,
}

pub struct TableBuilder<W: Write> {
    options: Options,
    file: W,
    /// Bytes written so far; the offset the next block lands at.
    offset: u64,
    state: State,
    /// First error; every later call short-circuits to it.
    status: Result<()>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    filter_block: Option<FilterBlockBuilder>,
    /// Handle of the last flushed data block, waiting for its index entry.
    pending_handle: BlockHandle,
    pending_index_entry: bool,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(options: Options, file: W) -> TableBuilder<W> {
        let mut filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }
        let data_restart_interval = options.block_restart_interval;
        TableBuilder {
            options,
            file,
            offset: 0,
            state: State::Building,
            status: Ok(()),
            data_block: BlockBuilder::new(data_restart_interval),
            index_block: BlockBuilder::new(INDEX_RESTART_INTERVAL),
            last_key: Vec::new(),
            num_entries: 0,
            filter_block,
            pending_handle: BlockHandle::default(),
            pending_index_entry: false,
        }
    }

    /// Appends an entry. Keys must be strictly greater than every key added
    /// before.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.add_inner(key, value);
        self.latch(result)
    }

    /// Forces the current data block to disk.
    pub fn flush(&mut self) -> Result<()> {
        let result = self.flush_inner();
        self.latch(result)
    }

    /// Writes the filter, metaindex, and index blocks plus the footer,
    /// sealing the file.
    pub fn finish(&mut self) -> Result<()> {
        let result = self.finish_inner();
        if result.is_ok() {
            self.state = State::Finished;
        }
        self.latch(result)
    }

    /// Stops the build without writing further bytes. The partially written
    /// file is the caller's to clean up.
    pub fn abandon(&mut self) {
        if self.state == State::Building {
            self.state = State::Abandoned;
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; the final file size once `finish` returns.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// First error this builder hit, if any.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    fn latch(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if self.status.is_ok() {
                self.status = Err(e.clone());
            }
        }
        result
    }

    fn ensure_building(&self) -> Result<()> {
        match self.state {
            State::Building => Ok(()),
            State::Finished => errarg!("table builder is already finished"),
            State::Abandoned => errarg!("table builder was abandoned"),
        }
    }

    fn add_inner(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_building()?;
        self.status()?;
        if self.num_entries > 0
            && self.options.comparator.compare(key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return errarg!("keys must be added in strictly ascending order");
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            // With the closed block's last key and the new block's first key
            // both in hand, a short separator can stand in for either.
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_inner()?;
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.status()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let interval = self.options.block_restart_interval;
        let raw = std::mem::replace(&mut self.data_block, BlockBuilder::new(interval)).finish();
        self.pending_handle = self.write_block(raw)?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    fn finish_inner(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.flush_inner()?;

        // Filter block, stored uncompressed.
        let mut filter_handle = None;
        if let Some(fb) = self.filter_block.take() {
            let contents = fb.finish();
            filter_handle = Some(self.write_raw_block(&contents, CompressionKind::None)?);
        }

        // Metaindex: comparator name, then the filter handle. Keys are in
        // bytewise order, as the metaindex is read with that comparator.
        let mut meta_block = BlockBuilder::new(self.options.block_restart_interval);
        let mut name_value = Vec::new();
        put_length_prefixed_slice(&mut name_value, self.options.comparator.name().as_bytes());
        meta_block.add(COMPARATOR_META_KEY, &name_value);
        if let Some(handle) = filter_handle {
            let policy = self
                .options
                .filter_policy
                .as_ref()
                .expect("filter block implies a policy");
            let key = format!("{}{}", FILTER_META_PREFIX, policy.name());
            let mut handle_encoding = Vec::new();
            handle.encode_to(&mut handle_encoding);
            meta_block.add(key.as_bytes(), &handle_encoding);
        }
        let metaindex_handle = self.write_block(meta_block.finish())?;

        // Index block, closing out the pending entry with a successor of
        // the file's last key since nothing bounds it from above.
        if self.pending_index_entry {
            self.options.comparator.find_short_successor(&mut self.last_key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }
        let index_block =
            std::mem::replace(&mut self.index_block, BlockBuilder::new(INDEX_RESTART_INTERVAL));
        let index_handle = self.write_block(index_block.finish())?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_encoding = Vec::with_capacity(Footer::ENCODED_LENGTH);
        footer.encode_to(&mut footer_encoding);
        self.file.write_all(&footer_encoding)?;
        self.offset += footer_encoding.len() as u64;
        self.file.flush()?;
        Ok(())
    }

    /// Compresses `raw` if configured and worthwhile, then writes it with
    /// its trailer.
    fn write_block(&mut self, raw: Vec<u8>) -> Result<BlockHandle> {
        match self.options.compression {
            CompressionKind::None => self.write_raw_block(&raw, CompressionKind::None),
            CompressionKind::Snappy => {
                match snap::raw::Encoder::new().compress_vec(&raw) {
                    Ok(compressed)
                        if compressed.len() < raw.len() - raw.len() / COMPRESSION_SAVINGS_DENOM =>
                    {
                        self.write_raw_block(&compressed, CompressionKind::Snappy)
                    }
                    // Not worth it (or incompressible): store as-is.
                    _ => self.write_raw_block(&raw, CompressionKind::None),
                }
            }
        }
    }

    fn write_raw_block(&mut self, data: &[u8], kind: CompressionKind) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, data.len() as u64);
        self.file.write_all(data)?;

        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
        trailer.push(kind as u8);
        let mut digest = CRC32C.digest();
        digest.update(data);
        digest.update(&[kind as u8]);
        crate::coding::put_fixed32(&mut trailer, mask_crc(digest.finalize()));
        self.file.write_all(&trailer)?;

        self.offset += (data.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }
}
