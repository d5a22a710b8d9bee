//! Seekable, bidirectional iteration over key-value entries.
//!
//! Blocks, memtables, and whole tables all expose this shape. Unlike
//! `std::iter::Iterator`, positioning and access are separate so callers can
//! seek, walk both directions, and read the current entry repeatedly without
//! consuming it.

use crate::error::Result;

pub trait Iter {
    /// True when positioned at an entry. `key`/`value` may only be called
    /// while valid.
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Positions at the first entry whose key is `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances to the next entry; requires `valid()`.
    fn next(&mut self);

    /// Steps back to the previous entry; requires `valid()`. Becomes invalid
    /// when already at the first entry.
    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// First error this iterator encountered, if any. `valid()` implies the
    /// status is ok.
    fn status(&self) -> Result<()>;
}

/// An iterator over nothing, optionally carrying an error.
pub struct EmptyIter {
    status: Result<()>,
}

impl EmptyIter {
    pub fn new(status: Result<()>) -> EmptyIter {
        EmptyIter { status }
    }
}

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }

    fn seek_to_first(&mut self) {}

    fn seek_to_last(&mut self) {}

    fn seek(&mut self, _target: &[u8]) {}

    fn next(&mut self) {}

    fn prev(&mut self) {}

    fn key(&self) -> &[u8] {
        panic!("key() called on an empty iterator");
    }

    fn value(&self) -> &[u8] {
        panic!("value() called on an empty iterator");
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

impl<I: Iter + ?Sized> Iter for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }

    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }

    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }

    fn next(&mut self) {
        (**self).next()
    }

    fn prev(&mut self) {
        (**self).prev()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }

    fn status(&self) -> Result<()> {
        (**self).status()
    }
}
