//! Ordered in-memory table staging writes before they reach a sorted table.
//!
//! Entries are packed into a single arena region:
//!
//! ```text
//! +----------------------+----------+--------------+-----------+-------+
//! | internal_key_len:v32 | user_key | tag:u64_le   | v_len:v32 | value |
//! +----------------------+----------+--------------+-----------+-------+
//! ```
//!
//! where `tag` packs `(sequence << 8) | kind`. The skip list orders entries
//! by internal key: user key ascending, then sequence descending, so the
//! newest version of a user key is the first one a seek finds. Deletes are
//! tombstone entries, not removals; nothing is ever unlinked.
//!
//! One writer at a time may call [`Memtable::add`] (callers serialize the
//! write path); readers need no coordination at all.

pub mod skiplist;

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::Arc;

use crate::arena::Arena;
use crate::coding::{get_fixed64, put_fixed64, put_varint32, varint_length};
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::error::{Error, Result};
use crate::iterator::Iter;
use crate::key::{extract_user_key, pack_sequence_and_kind, LookupKey, SequenceNumber, ValueKind};

use skiplist::{KeyComparator, SkipList, SkipListIter};

/// Reads a varint32 byte by byte, stopping at the terminator, so no byte
/// past the encoding itself is ever touched.
///
/// # Safety
///
/// `ptr` must address a well-formed varint32.
unsafe fn decode_varint32_raw(mut ptr: *const u8) -> (u32, *const u8) {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        let byte = *ptr;
        ptr = ptr.add(1);
        result |= u32::from(byte & 0x7f) << shift;
        if byte < 0x80 {
            return (result, ptr);
        }
        shift += 7;
    }
}

/// Reads the length-prefixed key at the start of an encoded entry.
///
/// # Safety
///
/// `ptr` must address an entry written by [`Memtable::add`] or a
/// [`LookupKey`]'s memtable key that outlives `'a`.
unsafe fn decode_key<'a>(ptr: *const u8) -> &'a [u8] {
    let (len, data) = decode_varint32_raw(ptr);
    std::slice::from_raw_parts(data, len as usize)
}

/// Reads both the internal key and the value of an encoded entry.
///
/// # Safety
///
/// `ptr` must address an entry written by [`Memtable::add`] that outlives
/// `'a`.
unsafe fn decode_entry<'a>(ptr: *const u8) -> (&'a [u8], &'a [u8]) {
    let key = decode_key(ptr);
    let (len, data) = decode_varint32_raw(key.as_ptr().add(key.len()));
    let value = std::slice::from_raw_parts(data, len as usize);
    (key, value)
}

/// Orders encoded entries by their embedded internal keys.
#[derive(Clone)]
struct EntryComparator {
    comparator: InternalKeyComparator,
}

impl KeyComparator for EntryComparator {
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> CmpOrdering {
        self.comparator.compare(decode_key(a), decode_key(b))
    }
}

pub struct Memtable {
    comparator: InternalKeyComparator,
    arena: Arc<Arena>,
    list: SkipList<EntryComparator>,
}

impl Memtable {
    pub fn new(comparator: InternalKeyComparator) -> Memtable {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(
            EntryComparator {
                comparator: comparator.clone(),
            },
            Arc::clone(&arena),
        );
        Memtable {
            comparator,
            arena,
            list,
        }
    }

    /// Stages a write. Sequence numbers must be unique per user key; callers
    /// hand them out monotonically.
    pub fn add(&self, sequence: SequenceNumber, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = Vec::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_kind(sequence, kind));
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);
        debug_assert_eq!(buf.len(), encoded_len);

        let mem = self.arena.alloc(encoded_len);
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), mem, encoded_len);
        }
        self.list.insert(mem);
    }

    /// Looks up the newest entry visible at the lookup key's snapshot.
    /// Returns the value for a live entry, `Error::NotFound` for a
    /// tombstone, and `None` when this table holds nothing for the user key.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Vec<u8>>> {
        let mut iter = SkipListIter::new(&self.list);
        iter.seek(key.memtable_key().as_ptr());
        if !iter.valid() {
            return None;
        }

        let (internal_key, value) = unsafe { decode_entry(iter.key()) };
        let user = self.comparator.user_comparator();
        if user.compare(extract_user_key(internal_key), key.user_key()) != CmpOrdering::Equal {
            return None;
        }

        let mut trailer = &internal_key[internal_key.len() - 8..];
        let tag = get_fixed64(&mut trailer).expect("entry has a trailer");
        match ValueKind::from_u8((tag & 0xff) as u8) {
            Some(ValueKind::Value) => Some(Ok(value.to_vec())),
            Some(ValueKind::Deletion) => Some(Err(Error::NotFound)),
            None => None,
        }
    }

    /// Iterates entries in internal-key order. Keys yielded are internal
    /// keys.
    pub fn iter(&self) -> MemtableIter<'_> {
        MemtableIter {
            iter: self.list.iter(),
            scratch: Vec::new(),
        }
    }

    /// Bytes of arena-backed memory this table has consumed.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }
}

pub struct MemtableIter<'a> {
    iter: SkipListIter<'a, EntryComparator>,
    scratch: Vec<u8>,
}

impl Iter for MemtableIter<'_> {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // The skip list compares length-prefixed entries, so wrap the
        // internal-key target in the entry layout.
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.iter.seek(self.scratch.as_ptr());
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        unsafe { decode_key(self.iter.key()) }
    }

    fn value(&self) -> &[u8] {
        unsafe { decode_entry(self.iter.key()).1 }
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::parse_internal_key;

    fn new_memtable() -> Memtable {
        Memtable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn get_at(table: &Memtable, user_key: &[u8], snapshot: SequenceNumber) -> Option<Result<Vec<u8>>> {
        table.get(&LookupKey::new(user_key, snapshot))
    }

    #[test]
    fn test_add_and_get() {
        let table = new_memtable();
        table.add(1, ValueKind::Value, b"key1", b"value1");
        table.add(2, ValueKind::Value, b"key2", b"value2");

        assert_eq!(get_at(&table, b"key1", 10), Some(Ok(b"value1".to_vec())));
        assert_eq!(get_at(&table, b"key2", 10), Some(Ok(b"value2".to_vec())));
        assert_eq!(get_at(&table, b"key3", 10), None);
    }

    #[test]
    fn test_newest_version_wins() {
        let table = new_memtable();
        table.add(1, ValueKind::Value, b"key", b"old");
        table.add(5, ValueKind::Value, b"key", b"new");

        assert_eq!(get_at(&table, b"key", 100), Some(Ok(b"new".to_vec())));
    }

    #[test]
    fn test_snapshot_hides_later_writes() {
        let table = new_memtable();
        table.add(1, ValueKind::Value, b"key", b"v1");
        table.add(5, ValueKind::Value, b"key", b"v5");
        table.add(9, ValueKind::Value, b"key", b"v9");

        assert_eq!(get_at(&table, b"key", 1), Some(Ok(b"v1".to_vec())));
        assert_eq!(get_at(&table, b"key", 4), Some(Ok(b"v1".to_vec())));
        assert_eq!(get_at(&table, b"key", 5), Some(Ok(b"v5".to_vec())));
        assert_eq!(get_at(&table, b"key", 100), Some(Ok(b"v9".to_vec())));
    }

    #[test]
    fn test_tombstone_reports_not_found() {
        let table = new_memtable();
        table.add(1, ValueKind::Value, b"key", b"value");
        table.add(2, ValueKind::Deletion, b"key", b"");

        assert_eq!(get_at(&table, b"key", 100), Some(Err(Error::NotFound)));
        // The older snapshot still sees the live value.
        assert_eq!(get_at(&table, b"key", 1), Some(Ok(b"value".to_vec())));
    }

    #[test]
    fn test_empty_value_and_empty_key() {
        let table = new_memtable();
        table.add(1, ValueKind::Value, b"", b"empty key");
        table.add(2, ValueKind::Value, b"k", b"");

        assert_eq!(get_at(&table, b"", 10), Some(Ok(b"empty key".to_vec())));
        assert_eq!(get_at(&table, b"k", 10), Some(Ok(Vec::new())));
    }

    #[test]
    fn test_iterates_in_internal_key_order() {
        let table = new_memtable();
        table.add(3, ValueKind::Value, b"b", b"b3");
        table.add(1, ValueKind::Value, b"a", b"a1");
        table.add(2, ValueKind::Value, b"c", b"c2");
        table.add(7, ValueKind::Value, b"b", b"b7");

        let mut iter = table.iter();
        iter.seek_to_first();

        // User keys ascending; for "b", sequence 7 before sequence 3.
        let expected = [
            (b"a".to_vec(), 1u64, b"a1".to_vec()),
            (b"b".to_vec(), 7, b"b7".to_vec()),
            (b"b".to_vec(), 3, b"b3".to_vec()),
            (b"c".to_vec(), 2, b"c2".to_vec()),
        ];
        for (user_key, sequence, value) in &expected {
            assert!(iter.valid());
            let parsed = parse_internal_key(iter.key()).expect("bad internal key");
            assert_eq!(parsed.user_key, user_key.as_slice());
            assert_eq!(parsed.sequence, *sequence);
            assert_eq!(iter.value(), value.as_slice());
            iter.next();
        }
        assert!(!iter.valid());

        // And backwards.
        iter.seek_to_last();
        for (user_key, sequence, _) in expected.iter().rev() {
            assert!(iter.valid());
            let parsed = parse_internal_key(iter.key()).expect("bad internal key");
            assert_eq!(parsed.user_key, user_key.as_slice());
            assert_eq!(parsed.sequence, *sequence);
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_memory_usage_grows() {
        let table = new_memtable();
        let before = table.approximate_memory_usage();
        for i in 0..100u32 {
            table.add(
                u64::from(i) + 1,
                ValueKind::Value,
                format!("key_{i:04}").as_bytes(),
                &[0u8; 100],
            );
        }
        assert!(table.approximate_memory_usage() > before);
        assert!(table.approximate_memory_usage() >= 100 * 100);
    }

    #[test]
    fn test_concurrent_reader_with_single_writer() {
        const N: u32 = 10_000;
        let table = new_memtable();

        std::thread::scope(|scope| {
            let table = &table;

            let reader = scope.spawn(move || {
                let mut observed = false;
                loop {
                    let result = get_at(table, b"key_5000", u64::from(N) + 1);
                    match result {
                        None => {
                            assert!(!observed, "key disappeared after being visible");
                        }
                        Some(Ok(value)) => {
                            assert_eq!(value, b"value_5000");
                            if observed {
                                return; // seen twice: visibility is stable
                            }
                            observed = true;
                        }
                        Some(Err(e)) => panic!("unexpected error: {e}"),
                    }
                    std::hint::spin_loop();
                }
            });

            scope.spawn(move || {
                for i in 0..N {
                    table.add(
                        u64::from(i) + 1,
                        ValueKind::Value,
                        format!("key_{i}").as_bytes(),
                        format!("value_{i}").as_bytes(),
                    );
                }
            });

            reader.join().expect("reader panicked");
        });
    }
}
