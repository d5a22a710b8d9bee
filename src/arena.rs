//! Monotonic bump allocator backing the in-memory table.
//!
//! The arena hands out raw byte regions carved from 4 KiB chunks and frees
//! everything at once when dropped. Returned pointers stay valid, at a fixed
//! address, for the whole life of the arena; the skip list relies on this to
//! keep node memory stable while readers traverse it.
//!
//! # Concurrency
//!
//! Allocation is single-writer: callers must serialize `alloc`/`alloc_aligned`
//! externally (the memtable's write path already is). `memory_usage` may be
//! read from any thread and is monotonically non-decreasing.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_SIZE: usize = 4096;

pub struct Arena {
    inner: UnsafeCell<Inner>,
    memory_usage: AtomicUsize,
}

struct Inner {
    /// Bump pointer into the current chunk.
    alloc_ptr: *mut u8,
    /// Bytes left in the current chunk.
    alloc_remaining: usize,
    /// Every chunk ever allocated; freed together on drop.
    blocks: Vec<Box<[u8]>>,
}

// Allocation is externally serialized and handed-out memory is published to
// readers through the skip list's release stores, so sharing the arena across
// threads is sound under that contract.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns `bytes` bytes with no alignment guarantee. `bytes` must be
    /// nonzero.
    pub fn alloc(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let inner = unsafe { &mut *self.inner.get() };
        if bytes <= inner.alloc_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return result;
        }
        self.alloc_fallback(inner, bytes)
    }

    /// Returns `bytes` bytes aligned for pointer-sized loads and stores.
    pub fn alloc_aligned(&self, bytes: usize) -> *mut u8 {
        let align = mem::size_of::<usize>().max(8);
        debug_assert!(align.is_power_of_two());
        let inner = unsafe { &mut *self.inner.get() };

        let slop = {
            let current_mod = inner.alloc_ptr as usize & (align - 1);
            if current_mod == 0 {
                0
            } else {
                align - current_mod
            }
        };
        let needed = bytes + slop;
        if needed <= inner.alloc_remaining {
            let result = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_remaining -= needed;
            return result;
        }

        // Fresh chunks come from the global allocator with no alignment
        // promise for u8 buffers, so over-allocate and round up.
        let raw = self.alloc_fallback(inner, bytes + align - 1);
        let offset = {
            let current_mod = raw as usize & (align - 1);
            if current_mod == 0 {
                0
            } else {
                align - current_mod
            }
        };
        unsafe { raw.add(offset) }
    }

    /// Total bytes obtained from the underlying allocator.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Acquire)
    }

    fn alloc_fallback(&self, inner: &mut Inner, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // A dedicated chunk keeps large requests from wasting the
            // remainder of the current one.
            return self.alloc_new_block(inner, bytes);
        }

        // Abandon whatever is left in the current chunk.
        let block = self.alloc_new_block(inner, BLOCK_SIZE);
        inner.alloc_ptr = unsafe { block.add(bytes) };
        inner.alloc_remaining = BLOCK_SIZE - bytes;
        block
    }

    fn alloc_new_block(&self, inner: &mut Inner, block_bytes: usize) -> *mut u8 {
        let mut block = vec![0u8; block_bytes].into_boxed_slice();
        let ptr = block.as_mut_ptr();
        inner.blocks.push(block);
        self.memory_usage.fetch_add(
            block_bytes + mem::size_of::<Box<[u8]>>(),
            Ordering::Release,
        );
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
