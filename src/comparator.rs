//! Key ordering, and the hint operations that shorten index keys.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::get_fixed64;
use crate::key::{
    extract_user_key, pack_sequence_and_kind, MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK,
};

/// Total order over byte-string keys, plus two operations used to pick short
/// separator keys for the sorted tables' index blocks.
pub trait Comparator: Send + Sync {
    /// Three-way comparison.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Stable identifier persisted alongside data. A reader refuses a file
    /// whose recorded comparator name differs from its own.
    fn name(&self) -> &'static str;

    /// Shortens `start` to some string `s` with `start <= s < limit` when a
    /// shorter one exists; otherwise leaves `start` unchanged.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Shortens `key` to some string `s >= key` when a shorter one exists;
    /// otherwise leaves `key` unchanged.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Plain byte-wise lexicographic ordering.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "emberdb.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let mut diff_index = 0;
        while diff_index < min_len && start[diff_index] == limit[diff_index] {
            diff_index += 1;
        }

        if diff_index >= min_len {
            // One string is a prefix of the other; no shortening possible.
            return;
        }

        let diff_byte = start[diff_index];
        if diff_byte < 0xff && diff_byte + 1 < limit[diff_index] {
            start[diff_index] += 1;
            start.truncate(diff_index + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // Every byte is 0xff; key is its own shortest successor.
    }
}

/// Orders internal keys: user key ascending, then trailer descending so that
/// newer sequence numbers come first for the same user key.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> InternalKeyComparator {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }
}

fn trailer_of(internal_key: &[u8]) -> u64 {
    let mut tail = &internal_key[internal_key.len() - 8..];
    get_fixed64(&mut tail).unwrap()
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => trailer_of(b).cmp(&trailer_of(a)),
            ord => ord,
        }
    }

    fn name(&self) -> &'static str {
        "emberdb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            // The user key grew shorter; tag it so it sorts before every
            // entry that shares it.
            crate::coding::put_fixed64(
                &mut tmp,
                pack_sequence_and_kind(MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            crate::coding::put_fixed64(
                &mut tmp,
                pack_sequence_and_kind(MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}
