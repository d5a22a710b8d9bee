//! On-disk framing for sorted tables: block handles, the footer, and the
//! checksummed block trailer.
//!
//! Every persisted block is followed by a five-byte trailer holding a
//! compression-kind byte and a masked CRC32C of the block bytes plus that
//! byte. The file ends with a fixed-length footer locating the metaindex and
//! index blocks and carrying the magic number that identifies the file as a
//! sorted table.

use crc::{Crc, CRC_32_ISCSI};

use crate::coding::{get_fixed32, get_varint64, put_fixed32, put_varint64};
use crate::error::{Error, Result};
use crate::fs::RandomAccessFile;
use crate::options::{CompressionKind, ReadOptions};

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Identifies a file as a sorted table. Chosen once, never changed.
pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;

/// Compression kind byte plus a masked fixed32 checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

const MASK_DELTA: u32 = 0xa282ead8;

/// Masks a CRC for storage. Stored checksums are masked so that computing
/// the CRC of a string that itself contains embedded CRCs stays
/// well-conditioned.
pub fn mask_crc(crc: u32) -> u32 {
    (crc.rotate_right(15)).wrapping_add(MASK_DELTA)
}

pub fn unmask_crc(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

/// File offset and length of a stored block, excluding its trailer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Two varint64s.
    pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

    pub fn new(offset: u64, size: u64) -> BlockHandle {
        BlockHandle { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<BlockHandle> {
        let offset = get_varint64(input);
        let size = get_varint64(input);
        match (offset, size) {
            (Some(offset), Some(size)) => Ok(BlockHandle { offset, size }),
            _ => errcorrupt!("bad block handle"),
        }
    }
}

/// Fixed-length record at the tail of every sorted table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Two padded handles plus the magic number.
    pub const ENCODED_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
        // The magic is stored as two fixed32 halves, low half first. The
        // byte sequence is part of the format; keep the split encoding.
        put_fixed32(dst, (TABLE_MAGIC & 0xffff_ffff) as u32);
        put_fixed32(dst, (TABLE_MAGIC >> 32) as u32);
        debug_assert_eq!(dst.len() - start, Self::ENCODED_LENGTH);
    }

    pub fn decode_from(input: &[u8]) -> Result<Footer> {
        if input.len() < Self::ENCODED_LENGTH {
            return errcorrupt!("footer is truncated");
        }
        let magic = {
            let mut tail = &input[Self::ENCODED_LENGTH - 8..];
            let low = get_fixed32(&mut tail).expect("length checked above");
            let high = get_fixed32(&mut tail).expect("length checked above");
            (u64::from(high) << 32) | u64::from(low)
        };
        if magic != TABLE_MAGIC {
            return errcorrupt!("not a sorted table (bad magic number)");
        }

        let mut handles = &input[..Self::ENCODED_LENGTH - 8];
        let metaindex_handle = BlockHandle::decode_from(&mut handles)?;
        let index_handle = BlockHandle::decode_from(&mut handles)?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Reads one block's payload, verifying the trailer checksum when asked and
/// undoing compression. Returns the uncompressed block bytes.
pub fn read_block(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let payload_len = handle.size() as usize;
    let mut buf = vec![0u8; payload_len + BLOCK_TRAILER_SIZE];
    let read = file.read_at(handle.offset(), &mut buf)?;
    if read < buf.len() {
        return errcorrupt!("truncated block read");
    }

    let kind_byte = buf[payload_len];
    if options.verify_checksums {
        let stored = {
            let mut tail = &buf[payload_len + 1..];
            unmask_crc(get_fixed32(&mut tail).expect("trailer is in bounds"))
        };
        let actual = CRC32C.checksum(&buf[..payload_len + 1]);
        if stored != actual {
            return errcorrupt!("block checksum mismatch");
        }
    }

    buf.truncate(payload_len);
    match CompressionKind::from_u8(kind_byte) {
        Some(CompressionKind::None) => Ok(buf),
        Some(CompressionKind::Snappy) => {
            let mut decoder = snap::raw::Decoder::new();
            decoder
                .decompress_vec(&buf)
                .map_err(|_| Error::Corruption("corrupted compressed block".to_string()))
        }
        None => Err(Error::NotSupported(format!(
            "unknown block compression kind {kind_byte}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_mask_roundtrip() {
        for crc in [0u32, 1, 0xdeadbeef, u32::MAX, 0x12345678] {
            let masked = mask_crc(crc);
            assert_ne!(masked, crc);
            assert_eq!(unmask_crc(masked), crc);
        }
    }

    #[test]
    fn test_block_handle_roundtrip() {
        for handle in [
            BlockHandle::new(0, 0),
            BlockHandle::new(1, 127),
            BlockHandle::new(1 << 30, 1 << 20),
            BlockHandle::new(u64::MAX, u64::MAX),
        ] {
            let mut buf = Vec::new();
            handle.encode_to(&mut buf);
            assert!(buf.len() <= BlockHandle::MAX_ENCODED_LENGTH);
            let mut input = buf.as_slice();
            assert_eq!(BlockHandle::decode_from(&mut input).unwrap(), handle);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn test_block_handle_rejects_truncation() {
        let mut buf = Vec::new();
        BlockHandle::new(1 << 40, 1 << 40).encode_to(&mut buf);
        let mut input = &buf[..buf.len() - 1];
        assert!(BlockHandle::decode_from(&mut input).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(1000, 200),
            index_handle: BlockHandle::new(1205, 4096),
        };
        let mut buf = Vec::new();
        footer.encode_to(&mut buf);
        assert_eq!(buf.len(), Footer::ENCODED_LENGTH);
        assert_eq!(Footer::decode_from(&buf).unwrap(), footer);
    }

    #[test]
    fn test_footer_magic_byte_order() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(0, 0),
            index_handle: BlockHandle::new(0, 0),
        };
        let mut buf = Vec::new();
        footer.encode_to(&mut buf);
        // Low 32 bits little-endian, then high 32 bits little-endian.
        let tail = &buf[buf.len() - 8..];
        assert_eq!(tail, &[0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb]);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(1, 2),
            index_handle: BlockHandle::new(3, 4),
        };
        let mut buf = Vec::new();
        footer.encode_to(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            Footer::decode_from(&buf),
            Err(Error::Corruption(_))
        ));
    }

    struct MemFile(Vec<u8>);

    impl RandomAccessFile for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let offset = offset as usize;
            if offset >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - offset);
            buf[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }
    }

    fn stored_block(payload: &[u8], kind: u8) -> Vec<u8> {
        let mut file = payload.to_vec();
        file.push(kind);
        let crc = CRC32C.checksum(&file);
        put_fixed32(&mut file, mask_crc(crc));
        file
    }

    #[test]
    fn test_read_block_plain() {
        let payload = b"some block payload".to_vec();
        let file = MemFile(stored_block(&payload, CompressionKind::None as u8));
        let options = ReadOptions::new().verify_checksums(true);
        let handle = BlockHandle::new(0, payload.len() as u64);
        assert_eq!(read_block(&file, &options, &handle).unwrap(), payload);
    }

    #[test]
    fn test_read_block_snappy() {
        let payload = vec![7u8; 4096];
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&payload)
            .expect("compression failed");
        let handle = BlockHandle::new(0, compressed.len() as u64);
        let file = MemFile(stored_block(&compressed, CompressionKind::Snappy as u8));
        let options = ReadOptions::new().verify_checksums(true);
        assert_eq!(read_block(&file, &options, &handle).unwrap(), payload);
    }

    #[test]
    fn test_read_block_detects_corruption() {
        let payload = b"payload bytes here".to_vec();
        let mut stored = stored_block(&payload, CompressionKind::None as u8);
        stored[3] ^= 0x01;
        let file = MemFile(stored);
        let handle = BlockHandle::new(0, payload.len() as u64);

        let checked = ReadOptions::new().verify_checksums(true);
        assert!(matches!(
            read_block(&file, &checked, &handle),
            Err(Error::Corruption(_))
        ));

        // Without verification the flipped byte goes unnoticed.
        let unchecked = ReadOptions::new();
        assert!(read_block(&file, &unchecked, &handle).is_ok());
    }

    #[test]
    fn test_read_block_unknown_kind() {
        let payload = b"x".to_vec();
        let file = MemFile(stored_block(&payload, 9));
        let handle = BlockHandle::new(0, 1);
        assert!(matches!(
            read_block(&file, &ReadOptions::new(), &handle),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_read_block_truncated_file() {
        let payload = b"not all bytes present".to_vec();
        let mut stored = stored_block(&payload, CompressionKind::None as u8);
        stored.truncate(stored.len() - 2);
        let file = MemFile(stored);
        let handle = BlockHandle::new(0, payload.len() as u64);
        assert!(matches!(
            read_block(&file, &ReadOptions::new(), &handle),
            Err(Error::Corruption(_))
        ));
    }
}
