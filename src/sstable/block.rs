//! Prefix-compressed block format: builder and binary-searching iterator.
//!
//! A block is a sorted run of entries followed by a restart array:
//!
//! ```text
//! +-----------------------------------------------------+
//! | entry 0 | entry 1 | ... | entry n-1                 |
//! +-----------------------------------------------------+
//! | restart[0]:u32 | ... | restart[k-1]:u32 | k:u32     |
//! +-----------------------------------------------------+
//! ```
//!
//! Each entry stores `shared_len`, `unshared_len`, and `value_len` as
//! varint32s, then the key suffix and the value. Keys share prefixes with
//! their predecessor except at restart points, which store the full key and
//! anchor the iterator's binary search.

use std::sync::Arc;

use crate::coding::{decode_varint32, get_fixed32, put_fixed32, put_varint32};
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::iterator::Iter;

/// Builds a block from entries added in ascending key order.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    /// Entries since the last restart point.
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        assert!(restart_interval >= 1);
        BlockBuilder {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly ascending order; the
    /// caller enforces this.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.counter <= self.restart_interval);

        let shared = if self.counter < self.restart_interval {
            let max = self.last_key.len().min(key.len());
            let mut shared = 0;
            while shared < max && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for i in 0..self.restarts.len() {
            let restart = self.restarts[i];
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.buffer
    }

    /// Bytes the finished block would currently occupy.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// A parsed, immutable block.
pub struct Block {
    data: Vec<u8>,
    /// Byte offset where the restart array begins; entries end here.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return errcorrupt!("block of {} bytes is too small", data.len());
        }
        let num_restarts = {
            let mut tail = &data[data.len() - 4..];
            get_fixed32(&mut tail).expect("length checked above")
        };
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts {
            return errcorrupt!(
                "block claims {num_restarts} restart points but has room for {max_restarts}"
            );
        }
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIter {
        let restart_offset = self.restart_offset;
        BlockIter {
            block: self,
            comparator,
            current: restart_offset,
            restart_index: 0,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        let offset = self.restart_offset + index as usize * 4;
        let mut slice = &self.data[offset..offset + 4];
        get_fixed32(&mut slice).expect("restart array is in bounds")
    }

    /// Entry bytes, without the restart array.
    fn entries(&self) -> &[u8] {
        &self.data[..self.restart_offset]
    }
}

/// Decodes one entry header. Returns `(shared, non_shared, value_len,
/// header_len)`.
fn decode_entry_header(data: &[u8]) -> Option<(u32, u32, u32, usize)> {
    if data.len() >= 3 && data[0] < 0x80 && data[1] < 0x80 && data[2] < 0x80 {
        // Fast path: all three lengths fit in one byte each.
        return Some((
            u32::from(data[0]),
            u32::from(data[1]),
            u32::from(data[2]),
            3,
        ));
    }
    let (shared, a) = decode_varint32(data)?;
    let (non_shared, b) = decode_varint32(&data[a..])?;
    let (value_len, c) = decode_varint32(&data[a + b..])?;
    Some((shared, non_shared, value_len, a + b + c))
}

/// Iterator over a parsed block. Holds the block alive via `Arc`.
pub struct BlockIter {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry in the block, `restart_offset` when
    /// exhausted.
    current: usize,
    /// Restart point at or before `current`; kept in step for `prev`.
    restart_index: u32,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Result<()>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // Position so the next parse starts at the restart point.
        self.value_offset = self.block.restart_point(index) as usize;
        self.value_len = 0;
    }

    fn corruption_error(&mut self) {
        if self.status.is_ok() {
            self.status = Err(Error::Corruption("bad entry in block".to_string()));
        }
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_len = 0;
    }

    /// Decodes the entry at `next_entry_offset`, splicing the shared key
    /// prefix with the stored suffix. Returns false at the end of the block
    /// or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }

        let header = match decode_entry_header(&self.block.entries()[self.current..]) {
            Some(h) => h,
            None => {
                self.corruption_error();
                return false;
            }
        };
        let (shared, non_shared, value_len, header_len) = header;
        let (shared, non_shared, value_len) =
            (shared as usize, non_shared as usize, value_len as usize);

        let suffix_offset = self.current + header_len;
        if shared > self.key.len()
            || suffix_offset + non_shared + value_len > self.block.restart_offset
        {
            self.corruption_error();
            return false;
        }

        self.key.truncate(shared);
        let suffix = &self.block.entries()[suffix_offset..suffix_offset + non_shared];
        self.key.extend_from_slice(suffix);
        self.value_offset = suffix_offset + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && (self.block.restart_point(self.restart_index + 1) as usize) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Reads the full key stored at a restart point, for binary search.
    fn restart_key(&self, index: u32) -> Result<&[u8]> {
        let offset = self.block.restart_point(index) as usize;
        let entries = self.block.entries();
        match decode_entry_header(&entries[offset..]) {
            Some((0, non_shared, _, header_len))
                if offset + header_len + non_shared as usize <= entries.len() =>
            {
                let start = offset + header_len;
                Ok(&entries[start..start + non_shared as usize])
            }
            // A restart entry sharing a prefix has nothing to share from.
            _ => Error::Corruption("bad restart entry in block".to_string()).into(),
        }
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.status.is_ok() && self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.current = self.block.restart_offset;
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            self.current = self.block.restart_offset;
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // advance to the final entry
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            self.current = self.block.restart_offset;
            return;
        }

        // Binary-search the restart array for the last restart point whose
        // key is below the target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let ordering = match self.restart_key(mid) {
                Ok(key) => self.comparator.compare(key, target),
                Err(e) => {
                    self.status = Err(e);
                    self.current = self.block.restart_offset;
                    self.restart_index = self.block.num_restarts;
                    self.key.clear();
                    self.value_len = 0;
                    return;
                }
            };
            if ordering == std::cmp::Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Scan forward to the first key at or after the target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != std::cmp::Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        // Back up to a restart point before the current entry, then rescan.
        let original = self.current;
        while self.block.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // Stepping back from the first entry leaves the block.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                self.key.clear();
                self.value_len = 0;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {
            // walk forward to the entry just before `original`
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish()).expect("failed to parse built block"))
    }

    fn iter_of(block: &Arc<Block>) -> BlockIter {
        Arc::clone(block).iter(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_empty_block() {
        let block = build_block(&[], 16);
        let mut iter = iter_of(&block);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    fn sample_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"apple".to_vec(), b"fruit".to_vec()),
            (b"application".to_vec(), b"software".to_vec()),
            (b"apply".to_vec(), b"verb".to_vec()),
            (b"banana".to_vec(), b"fruit".to_vec()),
            (b"band".to_vec(), b"music".to_vec()),
            (b"bandana".to_vec(), b"clothing".to_vec()),
            (b"candle".to_vec(), b"wax".to_vec()),
        ]
    }

    #[test]
    fn test_iterates_all_entries_in_order() {
        for restart_interval in [1, 2, 3, 16, 128] {
            let entries = sample_entries();
            let refs: Vec<(&[u8], &[u8])> = entries
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            let block = build_block(&refs, restart_interval);

            let mut iter = iter_of(&block);
            iter.seek_to_first();
            for (key, value) in &entries {
                assert!(iter.valid(), "interval {restart_interval}");
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
                iter.next();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_backward_iteration() {
        let entries = sample_entries();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        for restart_interval in [1, 2, 16] {
            let block = build_block(&refs, restart_interval);
            let mut iter = iter_of(&block);
            iter.seek_to_last();
            for (key, value) in entries.iter().rev() {
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
                iter.prev();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_seek() {
        let entries = sample_entries();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        for restart_interval in [1, 2, 16] {
            let block = build_block(&refs, restart_interval);
            let mut iter = iter_of(&block);

            // Exact hits.
            for (key, value) in &entries {
                iter.seek(key);
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
            }

            // Between keys: lands on the next one.
            iter.seek(b"applz");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"apply");

            iter.seek(b"bane");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"candle");

            // Before the first key.
            iter.seek(b"a");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"apple");

            // Past the last key.
            iter.seek(b"zzz");
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_mixed_walk() {
        let entries = sample_entries();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&refs, 2);
        let mut iter = iter_of(&block);

        iter.seek(b"band");
        assert_eq!(iter.key(), b"band");
        iter.prev();
        assert_eq!(iter.key(), b"banana");
        iter.next();
        assert_eq!(iter.key(), b"band");
        iter.next();
        assert_eq!(iter.key(), b"bandana");

        // prev from the very first entry invalidates.
        iter.seek_to_first();
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_shared_prefixes_shrink_encoding() {
        let long_keys: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
            .map(|i| {
                (
                    format!("a_very_long_common_prefix_{i:06}").into_bytes(),
                    b"v".to_vec(),
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = long_keys
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        let compressed = build_block(&refs, 16);
        let uncompressed = build_block(&refs, 1);
        assert!(compressed.size() < uncompressed.size());

        // Prefix sharing is transparent to reads.
        let mut iter = iter_of(&compressed);
        iter.seek_to_first();
        for (key, _) in &long_keys {
            assert_eq!(iter.key(), key.as_slice());
            iter.next();
        }
    }

    #[test]
    fn test_size_estimate_tracks_finish() {
        let mut builder = BlockBuilder::new(16);
        let mut last_estimate = builder.current_size_estimate();
        for i in 0..200u32 {
            builder.add(format!("key{i:05}").as_bytes(), b"value");
            let estimate = builder.current_size_estimate();
            assert!(estimate > last_estimate);
            last_estimate = estimate;
        }
        let finished = builder.finish();
        assert_eq!(finished.len(), last_estimate);
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![1, 2, 3]).is_err());
        // Claims more restarts than fit.
        let mut data = Vec::new();
        put_fixed32(&mut data, 1000);
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn test_corrupt_entry_sets_status() {
        let block = build_block(&[(b"aaa", b"111"), (b"bbb", b"222")], 16);
        let mut data = block.data.clone();
        // Rewrite the first entry's value_len into an absurd length.
        data[2] = 0x7f;
        let corrupt = Arc::new(Block::new(data).expect("restart tail untouched"));
        let mut iter = corrupt.iter(Arc::new(BytewiseComparator));
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_single_entry_block() {
        let block = build_block(&[(b"only", b"one")], 16);
        let mut iter = iter_of(&block);
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"only");
        iter.next();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert_eq!(iter.key(), b"only");
        iter.seek(b"only");
        assert_eq!(iter.value(), b"one");
        iter.seek(b"onlz");
        assert!(!iter.valid());
    }
}
