//! Positioned file reads for the table layer.
//!
//! Sorted-table files are read at arbitrary offsets by concurrent readers,
//! so the reader works against this trait instead of a seeking `File`
//! handle. Tests substitute instrumented implementations.

use std::fs::File;

use crate::error::Result;

pub trait RandomAccessFile: Send + Sync {
    /// Fills `buf` starting at `offset`, returning how many bytes were read.
    /// Short counts only happen at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

impl RandomAccessFile for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut total = 0;
        while total < buf.len() {
            match FileExt::read_at(self, &mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}
