//! Composes an index iterator with a block-opening function into one
//! iterator over every entry of a table.
//!
//! The outer iterator yields `(separator_key, block locator)` pairs; the
//! factory turns a locator into an iterator over that block. The composite
//! is valid exactly when the inner iterator is valid, skipping over empty
//! blocks in whichever direction it is moving, and only reopens a block when
//! the outer iterator's value actually changes.

use crate::error::Result;
use crate::iterator::Iter;

pub struct TwoLevelIterator<I, F>
where
    I: Iter,
    F: FnMut(&[u8]) -> Box<dyn Iter>,
{
    index_iter: I,
    block_fn: F,
    data_iter: Option<Box<dyn Iter>>,
    /// The index value `data_iter` was built from; avoids reopening the
    /// same block on sequential walks.
    data_block_locator: Vec<u8>,
    /// Holds an error from a data iterator that has since been replaced.
    status: Result<()>,
}

impl<I, F> TwoLevelIterator<I, F>
where
    I: Iter,
    F: FnMut(&[u8]) -> Box<dyn Iter>,
{
    pub fn new(index_iter: I, block_fn: F) -> TwoLevelIterator<I, F> {
        TwoLevelIterator {
            index_iter,
            block_fn,
            data_iter: None,
            data_block_locator: Vec::new(),
            status: Ok(()),
        }
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    fn set_data_iter(&mut self, iter: Option<Box<dyn Iter>>) {
        if let Some(old) = &self.data_iter {
            // Keep the first error from a block we are leaving behind.
            if self.status.is_ok() {
                if let Err(e) = old.status() {
                    self.status = Err(e);
                }
            }
        }
        self.data_iter = iter;
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }
        let locator = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && self.data_block_locator == locator {
            return; // already positioned in this block
        }
        let iter = (self.block_fn)(&locator);
        self.data_block_locator = locator;
        self.set_data_iter(Some(iter));
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_last();
            }
        }
    }
}

impl<I, F> Iter for TwoLevelIterator<I, F>
where
    I: Iter,
    F: FnMut(&[u8]) -> Box<dyn Iter>,
{
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(it) = &mut self.data_iter {
            it.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(it) = &mut self.data_iter {
            it.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("key() called on an invalid iterator")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("value() called on an invalid iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        // Outer errors first, then the live inner iterator, then anything
        // saved from a replaced inner iterator.
        self.index_iter.status()?;
        if let Some(it) = &self.data_iter {
            it.status()?;
        }
        self.status.clone()
    }
}
