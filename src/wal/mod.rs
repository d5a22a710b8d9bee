//! Log-record framing for crash recovery.
//!
//! A log file is a sequence of 32 KiB physical blocks. Each block carries
//! zero or more records with a seven-byte header, and a logical record too
//! large for the space left in a block is split into fragments:
//!
//! ```text
//! +---------------+------------+---------+- - - - - - -+
//! | crc32c:u32 LE | length:u16 | kind:u8 | payload ... |
//! +---------------+------------+---------+- - - - - - -+
//! ```
//!
//! `kind` marks a fragment as Full, First, Middle, or Last; the checksum is
//! masked CRC32C over the kind byte and the payload. A block's final bytes
//! are zero-filled when fewer than a header's worth remain. Readers
//! reassemble fragments, verify checksums, and skip damaged regions rather
//! than failing the whole log, reporting how many bytes they dropped.

use std::io::{Read, Write};

use log::warn;

use crate::coding::{get_fixed32, put_fixed32};
use crate::error::Result;
use crate::sstable::format::{mask_crc, unmask_crc, CRC32C};

/// Size of one physical block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Checksum, length, and kind.
pub const HEADER_SIZE: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    /// A whole logical record in one fragment.
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordKind {
    fn from_u8(kind: u8) -> Option<RecordKind> {
        match kind {
            1 => Some(RecordKind::Full),
            2 => Some(RecordKind::First),
            3 => Some(RecordKind::Middle),
            4 => Some(RecordKind::Last),
            _ => None,
        }
    }
}

pub struct Writer<W: Write> {
    dest: W,
    /// Write position within the current block.
    block_offset: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(dest: W) -> Writer<W> {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// Appends one logical record, fragmenting it across blocks as needed.
    /// An empty record is legal and produces a single Full fragment.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too little room for even an empty fragment; pad out the
                // block.
                if leftover > 0 {
                    const ZEROES: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                    self.dest.write_all(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let end = fragment_len == left.len();
            let kind = match (begin, end) {
                (true, true) => RecordKind::Full,
                (true, false) => RecordKind::First,
                (false, true) => RecordKind::Last,
                (false, false) => RecordKind::Middle,
            };

            self.emit_physical_record(kind, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        let mut digest = CRC32C.digest();
        digest.update(&[kind as u8]);
        digest.update(payload);
        put_fixed32(&mut header, mask_crc(digest.finalize()));
        header.push((payload.len() & 0xff) as u8);
        header.push((payload.len() >> 8) as u8);
        header.push(kind as u8);

        self.dest.write_all(&header)?;
        self.dest.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}

/// Outcome of reading one physical record.
enum Physical {
    Record(RecordKind, Vec<u8>),
    /// Checksum failure or nonsense header; the rest of the block was
    /// skipped.
    Bad,
    Eof,
}

pub struct Reader<R: Read> {
    src: R,
    /// The current block's bytes.
    buffer: Vec<u8>,
    /// Read position within `buffer`.
    pos: usize,
    eof: bool,
    /// Bytes discarded because of corruption.
    dropped_bytes: u64,
    verify_checksums: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(src: R) -> Reader<R> {
        Reader {
            src,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
            dropped_bytes: 0,
            verify_checksums: true,
        }
    }

    /// Total bytes skipped over so far due to corruption.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Reads the next logical record, reassembling fragments. Returns
    /// `None` at the end of the log. Damaged regions are skipped, counted
    /// in [`Reader::dropped_bytes`], and never returned.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Physical::Record(RecordKind::Full, payload) => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len(), "partial record without end");
                    }
                    return Ok(Some(payload));
                }
                Physical::Record(RecordKind::First, payload) => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len(), "partial record without end");
                    }
                    scratch = payload;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordKind::Middle, payload) => {
                    if !in_fragmented_record {
                        self.report_drop(payload.len(), "middle fragment without start");
                    } else {
                        scratch.extend_from_slice(&payload);
                    }
                }
                Physical::Record(RecordKind::Last, payload) => {
                    if !in_fragmented_record {
                        self.report_drop(payload.len(), "last fragment without start");
                    } else {
                        scratch.extend_from_slice(&payload);
                        return Ok(Some(scratch));
                    }
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len(), "record fragments lost to corruption");
                        scratch.clear();
                        in_fragmented_record = false;
                    }
                }
                Physical::Eof => {
                    // A fragmented record cut off by EOF is an unfinished
                    // write from a crash; swallow it silently.
                    return Ok(None);
                }
            }
        }
    }

    fn report_drop(&mut self, bytes: usize, reason: &str) {
        self.dropped_bytes += bytes as u64;
        warn!("log reader dropped {bytes} bytes: {reason}");
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.pos < HEADER_SIZE {
                // The remainder is block padding (or nothing); move on to
                // the next block.
                if self.eof {
                    return Ok(Physical::Eof);
                }
                self.refill_buffer()?;
                if self.buffer.is_empty() {
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let stored_crc = {
                let mut crc_bytes = &header[..4];
                get_fixed32(&mut crc_bytes).expect("header is in bounds")
            };
            let length = usize::from(header[4]) | (usize::from(header[5]) << 8);
            let kind_byte = header[6];

            if self.pos + HEADER_SIZE + length > self.buffer.len() {
                // The header promises more payload than the block holds.
                // At the true end of the log this is a torn write; earlier
                // it is corruption.
                let remaining = self.buffer.len() - self.pos;
                self.pos = self.buffer.len();
                if !self.eof {
                    self.report_drop(remaining, "bad record length");
                    return Ok(Physical::Bad);
                }
                return Ok(Physical::Eof);
            }

            // A zero-filled header means block padding from pre-allocation.
            let kind = match RecordKind::from_u8(kind_byte) {
                Some(kind) => kind,
                None => {
                    let remaining = self.buffer.len() - self.pos;
                    self.pos = self.buffer.len();
                    if kind_byte != 0 {
                        self.report_drop(remaining, "unknown record kind");
                    }
                    return Ok(Physical::Bad);
                }
            };

            let payload_start = self.pos + HEADER_SIZE;
            let payload = &self.buffer[payload_start..payload_start + length];

            if self.verify_checksums {
                let mut digest = CRC32C.digest();
                digest.update(&[kind_byte]);
                digest.update(payload);
                if unmask_crc(stored_crc) != digest.finalize() {
                    // Skip the whole rest of the block: the length field
                    // itself cannot be trusted.
                    let remaining = self.buffer.len() - self.pos;
                    self.pos = self.buffer.len();
                    self.report_drop(remaining, "checksum mismatch");
                    return Ok(Physical::Bad);
                }
            }

            let payload = payload.to_vec();
            self.pos = payload_start + length;
            return Ok(Physical::Record(kind, payload));
        }
    }

    /// Reads the next 32 KiB block (short only at end of file).
    fn refill_buffer(&mut self) -> Result<()> {
        self.buffer.clear();
        self.buffer.resize(BLOCK_SIZE, 0);
        self.pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.src.read(&mut self.buffer[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.buffer.truncate(filled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut log = Vec::new();
        let mut writer = Writer::new(&mut log);
        for record in records {
            writer.add_record(record).expect("add_record failed");
        }
        writer.flush().expect("flush failed");
        drop(writer);

        let mut reader = Reader::new(Cursor::new(log));
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().expect("read_record failed") {
            out.push(record);
        }
        assert_eq!(reader.dropped_bytes(), 0);
        out
    }

    #[test]
    fn test_small_records_roundtrip() {
        let records = vec![
            b"foo".to_vec(),
            b"bar".to_vec(),
            Vec::new(), // empty records are legal
            b"xxxx".to_vec(),
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_record_spanning_blocks() {
        // Payloads bigger than a block must fragment and reassemble.
        let records = vec![
            vec![b'a'; BLOCK_SIZE / 2],
            vec![b'b'; BLOCK_SIZE * 3],
            vec![b'c'; 17],
            vec![b'd'; BLOCK_SIZE - HEADER_SIZE], // exactly one block's payload
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_block_trailer_padding() {
        // Leave fewer than HEADER_SIZE bytes at the end of the first block
        // so the writer must pad and start a fresh block.
        let first_len = BLOCK_SIZE - HEADER_SIZE - 3;
        let records = vec![vec![b'p'; first_len], b"next".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_torn_tail_is_silent_eof() {
        let mut log = Vec::new();
        let mut writer = Writer::new(&mut log);
        writer.add_record(b"complete").expect("add failed");
        writer.add_record(&vec![b'x'; BLOCK_SIZE * 2]).expect("add failed");
        drop(writer);

        // Chop the log mid-way through the big record, simulating a crash.
        log.truncate(BLOCK_SIZE + 100);

        let mut reader = Reader::new(Cursor::new(log));
        assert_eq!(
            reader.read_record().expect("read failed"),
            Some(b"complete".to_vec())
        );
        assert_eq!(reader.read_record().expect("read failed"), None);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let mut log = Vec::new();
        let mut writer = Writer::new(&mut log);
        writer.add_record(b"first record").expect("add failed");
        writer.add_record(b"second record").expect("add failed");
        drop(writer);

        // Flip a payload byte of the first record.
        log[HEADER_SIZE + 2] ^= 0xff;

        let mut reader = Reader::new(Cursor::new(log));
        // The length field of a failed record cannot be trusted, so the
        // whole rest of the block is skipped. Both records shared it.
        assert_eq!(reader.read_record().expect("read failed"), None);
        assert!(reader.dropped_bytes() > 0);
    }

    #[test]
    fn test_corruption_in_second_block_preserves_first() {
        let mut log = Vec::new();
        let mut writer = Writer::new(&mut log);
        let first = vec![b'a'; BLOCK_SIZE - 2 * HEADER_SIZE];
        writer.add_record(&first).expect("add failed");
        writer.add_record(b"in second block").expect("add failed");
        drop(writer);

        // Damage the second block.
        log[BLOCK_SIZE + HEADER_SIZE] ^= 0xff;

        let mut reader = Reader::new(Cursor::new(log));
        assert_eq!(reader.read_record().expect("read failed"), Some(first));
        assert_eq!(reader.read_record().expect("read failed"), None);
        assert!(reader.dropped_bytes() > 0);
    }

    #[test]
    fn test_many_records_roundtrip() {
        let records: Vec<Vec<u8>> = (0..1000u32)
            .map(|i| {
                format!("record_{i:05}_{}", "payload ".repeat((i % 13) as usize)).into_bytes()
            })
            .collect();
        assert_eq!(roundtrip(&records), records);
    }
}
