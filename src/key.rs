//! Internal key model: sequence numbers, value kinds, and lookup keys.
//!
//! Every entry the engine stores carries an internal key: the caller's key
//! followed by an eight-byte trailer packing a 56-bit sequence number and an
//! eight-bit value kind. Entries for the same user key are distinguished by
//! sequence number, newest first; deletions are ordinary entries whose kind
//! marks them as tombstones.

use crate::coding::{get_fixed64, put_fixed64, put_varint32, varint_length};

pub type SequenceNumber = u64;

/// Sequence numbers occupy 56 bits, leaving the low byte of the trailer for
/// the value kind.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    /// Tombstone recording the deletion of a user key.
    Deletion = 0,
    /// Live value.
    Value = 1,
}

/// Kind used when building seek targets. `Value` sorts before `Deletion` for
/// equal `(user_key, sequence)`, so seeking with it finds every entry whose
/// sequence number is at most the snapshot.
pub const VALUE_KIND_FOR_SEEK: ValueKind = ValueKind::Value;

impl ValueKind {
    pub fn from_u8(kind: u8) -> Option<ValueKind> {
        match kind {
            0 => Some(ValueKind::Deletion),
            1 => Some(ValueKind::Value),
            _ => None,
        }
    }
}

pub fn pack_sequence_and_kind(sequence: SequenceNumber, kind: ValueKind) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | kind as u64
}

/// Appends `user_key` plus its trailer to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    kind: ValueKind,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_kind(sequence, kind));
}

/// The user-key portion of an internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
}

/// Splits an internal key into its parts. Returns `None` for keys shorter
/// than a trailer or with an unknown kind byte.
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if internal_key.len() < 8 {
        return None;
    }
    let (user_key, mut trailer) = internal_key.split_at(internal_key.len() - 8);
    let tag = get_fixed64(&mut trailer)?;
    let kind = ValueKind::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key,
        sequence: tag >> 8,
        kind,
    })
}

/// A point-lookup key, prebuilt in the layouts the memtable and the sorted
/// tables each expect.
///
/// The buffer holds `varint32 internal_key_len | user_key | trailer`; the
/// memtable key is the whole buffer and the internal key starts after the
/// length prefix.
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> LookupKey {
        let internal_key_len = user_key.len() + 8;
        let key_start = varint_length(internal_key_len as u64);
        let mut data = Vec::with_capacity(key_start + internal_key_len);
        put_varint32(&mut data, internal_key_len as u32);
        append_internal_key(&mut data, user_key, snapshot, VALUE_KIND_FOR_SEEK);
        LookupKey { data, key_start }
    }

    /// Key in the memtable's entry layout.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// Key in the sorted tables' internal-key layout.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - 8]
    }
}
