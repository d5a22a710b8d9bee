//! Per-table filter block: one filter per 2 KiB window of the data region.
//!
//! Layout:
//!
//! ```text
//! +----------+----------+-----+------------+------------------+---------+
//! | filter 0 | filter 1 | ... | offsets[]  | offsets_start:u32| base_lg |
//! +----------+----------+-----+------------+------------------+---------+
//! ```
//!
//! The filter at index `i` covers keys of every data block whose file offset
//! falls in `[i << base_lg, (i+1) << base_lg)`, so a reader can go from a
//! block handle straight to the filter that summarizes it.

use std::sync::Arc;

use crate::bloom::FilterPolicy;
use crate::coding::{get_fixed32, put_fixed32};

const FILTER_BASE_LG: u8 = 11;
/// One filter per this many bytes of data blocks.
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys of the pending filter, flattened back to back.
    keys: Vec<u8>,
    /// Start offset of each key inside `keys`.
    starts: Vec<usize>,
    /// The filters emitted so far.
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Tells the builder a data block begins at `block_offset`, emitting
    /// filters for every 2 KiB boundary passed since the last call.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.starts.is_empty() {
            self.generate_filter();
        }

        let offsets_start = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            let offset = self.filter_offsets[i];
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, offsets_start);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.starts.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // An empty window still gets an offsets slot, with no bytes.
            return;
        }

        self.starts.push(self.keys.len()); // bound for the last key
        let keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.starts[i]..self.starts[i + 1]])
            .collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.starts.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Offset of the offsets array within `data`.
    offsets_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Accepts any byte string; malformed contents produce a reader that
    /// lets every key through rather than an error.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
        let mut reader = FilterBlockReader {
            policy,
            data: Vec::new(),
            offsets_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = data.len();
        if n < 5 {
            // Need the offsets_start word and the base_lg byte.
            return reader;
        }
        let base_lg = data[n - 1];
        let offsets_start = {
            let mut tail = &data[n - 5..n - 1];
            get_fixed32(&mut tail).expect("length checked above") as usize
        };
        if offsets_start > n - 5 {
            return reader;
        }
        reader.num_filters = (n - 5 - offsets_start) / 4;
        reader.offsets_start = offsets_start;
        reader.base_lg = base_lg;
        reader.data = data;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range: err on the side of a match.
            return true;
        }

        let start = self.offset_at(index) as usize;
        let limit = self.offset_at(index + 1) as usize;
        if start == limit {
            // An empty filter covers no keys.
            return false;
        }
        if start < limit && limit <= self.offsets_start {
            return self.policy.key_may_match(key, &self.data[start..limit]);
        }
        // Inconsistent offsets: treat as a match.
        true
    }

    /// The `i`th entry of the offsets array; `i == num_filters` yields the
    /// end of the last filter.
    fn offset_at(&self, i: usize) -> u32 {
        debug_assert!(i <= self.num_filters);
        let pos = self.offsets_start + i * 4;
        let mut slice = &self.data[pos..pos + 4];
        get_fixed32(&mut slice).expect("offset array is in bounds")
    }
}
