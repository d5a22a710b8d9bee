//! Bloom filter policy for sorted-table point lookups.

use crate::hash::hash;

/// Builds and probes the per-table filters that let point lookups skip data
/// blocks that cannot contain a key.
pub trait FilterPolicy: Send + Sync {
    /// Stable identifier recorded in the table's metaindex. Changing the
    /// filter encoding requires changing the name.
    fn name(&self) -> &'static str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Must return true if `key` was in the set the filter was built from;
    /// may return true for keys that were not (false positive).
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, 0xbc9f1d34)
}

/// Standard Bloom filter with double hashing: one base hash per key, probe
/// positions derived by repeatedly adding a rotation of it.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> BloomFilterPolicy {
        // Roughly bits_per_key * ln(2), the probe count that minimizes the
        // false-positive rate.
        let k = (bits_per_key as f64 * std::f64::consts::LN_2).round() as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // A minimum length keeps the false-positive rate of tiny key sets in
        // check.
        let mut bits = keys.len() * self.bits_per_key;
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        dst.push(self.k as u8); // probe count, needed to read the filter back

        let array = &mut dst[init_size..init_size + bytes];
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = (h % bits as u32) as usize;
                array[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }
        let bits = (len - 1) * 8;
        let k = filter[len - 1];
        if k > 30 {
            // Reserved for future encodings: treat as a match.
            return true;
        }

        let array = &filter[..len - 1];
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = (h % bits as u32) as usize;
            if array[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(i: u32) -> Vec<u8> {
        i.to_le_bytes().to_vec()
    }

    fn build(policy: &BloomFilterPolicy, n: u32) -> Vec<u8> {
        let keys: Vec<Vec<u8>> = (0..n).map(key_of).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let mut filter = Vec::new();
        policy.create_filter(&key_refs, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        assert!(!policy.key_may_match(b"hello", b""));
        assert!(!policy.key_may_match(b"world", b"\x01"));
    }

    #[test]
    fn test_small() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<&[u8]> = vec![b"hello", b"world"];
        let mut filter = Vec::new();
        policy.create_filter(&keys, &mut filter);

        assert!(policy.key_may_match(b"hello", &filter));
        assert!(policy.key_may_match(b"world", &filter));
        assert!(!policy.key_may_match(b"x", &filter));
        assert!(!policy.key_may_match(b"foo", &filter));
    }

    #[test]
    fn test_no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        for n in [1u32, 10, 100, 1000] {
            let filter = build(&policy, n);
            for i in 0..n {
                assert!(
                    policy.key_may_match(&key_of(i), &filter),
                    "missing key {i} with n={n}"
                );
            }
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, 1000);
        let mut hits = 0;
        for i in 0..10000u32 {
            if policy.key_may_match(&key_of(i + 1_000_000_000), &filter) {
                hits += 1;
            }
        }
        // Ten bits per key gives a rate around one percent; leave slack.
        assert!(hits < 300, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn test_filter_length_has_floor() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, 1);
        // At least 64 bits of array plus the probe-count byte.
        assert_eq!(filter.len(), 8 + 1);
    }

    #[test]
    fn test_reserved_probe_counts_match_everything() {
        let policy = BloomFilterPolicy::new(10);
        let mut filter = vec![0u8; 9];
        filter[8] = 31; // k beyond the supported range
        assert!(policy.key_may_match(b"anything", &filter));
    }
}
