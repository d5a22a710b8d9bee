//! Sharded LRU cache with pinned handles.
//!
//! The cache is split into sixteen independently locked shards selected by
//! the top four bits of the key's hash. Each shard keeps its entries in a
//! slab, indexes them with a chained hash table, and threads them onto one of
//! two circular lists: a cold list of entries only the cache references
//! (eviction candidates, oldest first) and a hot list of entries some caller
//! still holds. Entries move between the lists as handles are created and
//! dropped.
//!
//! Looking an entry up returns a [`CacheHandle`] that pins it: a pinned entry
//! is never evicted, and even after `erase` or capacity eviction detaches it
//! from the cache, the handle keeps the value alive until dropped. Values are
//! destroyed outside the shard lock.
//!
//! The cache itself is cheap to clone; clones share the same shards.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::hash::hash;

const SHARD_BITS: usize = 4;
pub const NUM_SHARDS: usize = 1 << SHARD_BITS;

/// Slab index niche used as "no entry" in list and chain links.
const NIL: u32 = u32::MAX;

/// Slab slot of the cold ("lru") list sentinel.
const LRU: u32 = 0;
/// Slab slot of the hot ("in use") list sentinel.
const IN_USE: u32 = 1;

struct Entry<V> {
    key: Vec<u8>,
    hash: u32,
    /// Taken (`None`) once the last reference drops; also `None` in
    /// sentinels and free slots.
    value: Option<Arc<V>>,
    charge: usize,
    /// References: one for the cache itself while `in_cache`, plus one per
    /// outstanding handle.
    refs: u32,
    in_cache: bool,
    /// Next entry in this slot's hash-table bucket chain.
    next_hash: u32,
    /// Circular list links. Newest entries sit just before the sentinel.
    next: u32,
    prev: u32,
}

impl<V> Entry<V> {
    fn sentinel(slot: u32) -> Entry<V> {
        Entry {
            key: Vec::new(),
            hash: 0,
            value: None,
            charge: 0,
            refs: 0,
            in_cache: false,
            next_hash: NIL,
            next: slot,
            prev: slot,
        }
    }
}

struct Shard<V> {
    capacity: usize,
    usage: usize,
    entries: Vec<Entry<V>>,
    free: Vec<u32>,
    /// Hash-table bucket heads; always a power of two in length.
    buckets: Vec<u32>,
    /// Number of entries in the hash table.
    len: usize,
}

impl<V> Shard<V> {
    fn new(capacity: usize) -> Shard<V> {
        Shard {
            capacity,
            usage: 0,
            entries: vec![Entry::sentinel(LRU), Entry::sentinel(IN_USE)],
            free: Vec::new(),
            buckets: vec![NIL; 4],
            len: 0,
        }
    }

    // -- circular list plumbing ------------------------------------------

    fn list_remove(&mut self, e: u32) {
        let prev = self.entries[e as usize].prev;
        let next = self.entries[e as usize].next;
        self.entries[prev as usize].next = next;
        self.entries[next as usize].prev = prev;
    }

    /// Inserts `e` just before `head`, making it the newest entry of that
    /// list.
    fn list_append(&mut self, head: u32, e: u32) {
        let tail = self.entries[head as usize].prev;
        self.entries[e as usize].next = head;
        self.entries[e as usize].prev = tail;
        self.entries[tail as usize].next = e;
        self.entries[head as usize].prev = e;
    }

    // -- hash table ------------------------------------------------------

    fn bucket_of(&self, h: u32) -> usize {
        (h as usize) & (self.buckets.len() - 1)
    }

    /// Locates `key` in its bucket chain. Returns the slot and its chain
    /// predecessor (`NIL` when it heads the bucket).
    fn table_find(&self, key: &[u8], h: u32) -> (u32, u32) {
        let mut prev = NIL;
        let mut cur = self.buckets[self.bucket_of(h)];
        while cur != NIL {
            let e = &self.entries[cur as usize];
            if e.hash == h && e.key == key {
                break;
            }
            prev = cur;
            cur = e.next_hash;
        }
        (cur, prev)
    }

    /// Adds `slot` to the table, replacing and returning any previous entry
    /// with the same key.
    fn table_insert(&mut self, slot: u32) -> u32 {
        let h = self.entries[slot as usize].hash;
        let key = std::mem::take(&mut self.entries[slot as usize].key);
        let (old, prev) = self.table_find(&key, h);
        self.entries[slot as usize].key = key;

        self.entries[slot as usize].next_hash = if old != NIL {
            self.entries[old as usize].next_hash
        } else {
            NIL
        };
        if prev != NIL {
            self.entries[prev as usize].next_hash = slot;
        } else {
            let b = self.bucket_of(h);
            self.buckets[b] = slot;
        }

        if old == NIL {
            self.len += 1;
            if self.len > self.buckets.len() {
                self.grow_table();
            }
        }
        old
    }

    /// Unlinks `slot` from its bucket chain.
    fn table_remove_slot(&mut self, slot: u32) {
        let h = self.entries[slot as usize].hash;
        let b = self.bucket_of(h);
        let mut prev = NIL;
        let mut cur = self.buckets[b];
        while cur != slot {
            debug_assert_ne!(cur, NIL);
            prev = cur;
            cur = self.entries[cur as usize].next_hash;
        }
        let next = self.entries[slot as usize].next_hash;
        if prev != NIL {
            self.entries[prev as usize].next_hash = next;
        } else {
            self.buckets[b] = next;
        }
        self.entries[slot as usize].next_hash = NIL;
        self.len -= 1;
    }

    /// Doubles the bucket array and redistributes every chain. Keeps the
    /// average chain length at one or below.
    fn grow_table(&mut self) {
        let mut slots = Vec::with_capacity(self.len);
        for &head in &self.buckets {
            let mut cur = head;
            while cur != NIL {
                slots.push(cur);
                cur = self.entries[cur as usize].next_hash;
            }
        }

        self.buckets = vec![NIL; self.buckets.len() * 2];
        for slot in slots {
            let b = self.bucket_of(self.entries[slot as usize].hash);
            self.entries[slot as usize].next_hash = self.buckets[b];
            self.buckets[b] = slot;
        }
    }

    // -- slab ------------------------------------------------------------

    fn alloc_slot(&mut self, entry: Entry<V>) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.entries[slot as usize] = entry;
            slot
        } else {
            self.entries.push(entry);
            (self.entries.len() - 1) as u32
        }
    }

    // -- reference counting ----------------------------------------------

    fn ref_entry(&mut self, slot: u32) {
        let e = &self.entries[slot as usize];
        if e.refs == 1 && e.in_cache {
            // First external holder: promote from the cold list.
            self.list_remove(slot);
            self.list_append(IN_USE, slot);
        }
        self.entries[slot as usize].refs += 1;
    }

    /// Drops one reference. A detached entry with no holders left is freed;
    /// its value is pushed onto `dropped` so the caller can destroy it after
    /// releasing the shard lock.
    fn unref(&mut self, slot: u32, dropped: &mut Vec<Arc<V>>) {
        let e = &mut self.entries[slot as usize];
        debug_assert!(e.refs > 0);
        e.refs -= 1;
        if e.refs == 0 {
            debug_assert!(!e.in_cache);
            if let Some(value) = e.value.take() {
                dropped.push(value);
            }
            e.key = Vec::new();
            self.free.push(slot);
        } else if e.in_cache && e.refs == 1 {
            // No external holders left: demote to the cold list.
            self.list_remove(slot);
            self.list_append(LRU, slot);
        }
    }

    /// Detaches an entry the hash table no longer references and drops the
    /// cache's reference.
    fn finish_erase(&mut self, slot: u32, dropped: &mut Vec<Arc<V>>) {
        debug_assert!(self.entries[slot as usize].in_cache);
        self.list_remove(slot);
        self.entries[slot as usize].in_cache = false;
        self.usage -= self.entries[slot as usize].charge;
        self.unref(slot, dropped);
    }

    // -- shard operations ------------------------------------------------

    fn insert(
        &mut self,
        key: Vec<u8>,
        h: u32,
        value: Arc<V>,
        charge: usize,
        dropped: &mut Vec<Arc<V>>,
    ) -> u32 {
        let slot = self.alloc_slot(Entry {
            key,
            hash: h,
            value: Some(value),
            charge,
            refs: 2, // the cache's reference plus the returned handle
            in_cache: true,
            next_hash: NIL,
            next: NIL,
            prev: NIL,
        });
        self.usage += charge;
        self.list_append(IN_USE, slot);

        let old = self.table_insert(slot);
        if old != NIL {
            self.finish_erase(old, dropped);
        }

        while self.usage > self.capacity {
            let oldest = self.entries[LRU as usize].next;
            if oldest == LRU {
                // Everything left is pinned; nothing can be evicted.
                break;
            }
            self.table_remove_slot(oldest);
            self.finish_erase(oldest, dropped);
        }
        slot
    }

    fn lookup(&mut self, key: &[u8], h: u32) -> Option<(u32, Arc<V>)> {
        let (slot, _) = self.table_find(key, h);
        if slot == NIL {
            return None;
        }
        self.ref_entry(slot);
        let value = self.entries[slot as usize]
            .value
            .clone()
            .expect("in-cache entry has a value");
        Some((slot, value))
    }

    fn erase(&mut self, key: &[u8], h: u32, dropped: &mut Vec<Arc<V>>) {
        let (slot, _) = self.table_find(key, h);
        if slot != NIL {
            self.table_remove_slot(slot);
            self.finish_erase(slot, dropped);
        }
    }

    fn prune(&mut self, dropped: &mut Vec<Arc<V>>) {
        loop {
            let oldest = self.entries[LRU as usize].next;
            if oldest == LRU {
                return;
            }
            self.table_remove_slot(oldest);
            self.finish_erase(oldest, dropped);
        }
    }
}

struct CacheInner<V> {
    shards: Vec<Mutex<Shard<V>>>,
    last_id: AtomicU64,
}

impl<V> CacheInner<V> {
    fn release(&self, shard: usize, slot: u32) {
        let mut dropped = Vec::new();
        self.shards[shard].lock().unwrap().unref(slot, &mut dropped);
        drop(dropped);
    }
}

/// The sharded cache. Clones share the same storage, so one cache is
/// typically created and handed around by value.
pub struct ShardedCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for ShardedCache<V> {
    fn clone(&self) -> Self {
        ShardedCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync> ShardedCache<V> {
    /// `capacity` is the total charge the cache will try to stay under,
    /// split evenly across the shards.
    pub fn new(capacity: usize) -> ShardedCache<V> {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        ShardedCache {
            inner: Arc::new(CacheInner {
                shards,
                last_id: AtomicU64::new(0),
            }),
        }
    }

    fn shard_of(h: u32) -> usize {
        (h >> (32 - SHARD_BITS)) as usize
    }

    /// Inserts `value` under `key`, replacing any previous entry with the
    /// same key, and returns a handle pinning it. When the shard overflows
    /// its capacity, the coldest unpinned entries are evicted.
    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> CacheHandle<V> {
        let h = hash(key, 0);
        let shard = Self::shard_of(h);
        let value = Arc::new(value);
        let mut dropped = Vec::new();
        let slot = {
            let mut guard = self.inner.shards[shard].lock().unwrap();
            guard.insert(key.to_vec(), h, Arc::clone(&value), charge, &mut dropped)
        };
        drop(dropped); // destroy displaced values outside the lock
        CacheHandle {
            cache: Arc::clone(&self.inner),
            shard,
            slot,
            value,
        }
    }

    /// Returns a pinning handle for `key`'s entry, if cached.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let h = hash(key, 0);
        let shard = Self::shard_of(h);
        let (slot, value) = self.inner.shards[shard].lock().unwrap().lookup(key, h)?;
        Some(CacheHandle {
            cache: Arc::clone(&self.inner),
            shard,
            slot,
            value,
        })
    }

    /// Removes `key`'s entry. Outstanding handles keep the value alive.
    pub fn erase(&self, key: &[u8]) {
        let h = hash(key, 0);
        let mut dropped = Vec::new();
        self.inner.shards[Self::shard_of(h)]
            .lock()
            .unwrap()
            .erase(key, h, &mut dropped);
        drop(dropped);
    }

    /// Drops every entry that no handle is pinning.
    pub fn prune(&self) {
        for shard in &self.inner.shards {
            let mut dropped = Vec::new();
            shard.lock().unwrap().prune(&mut dropped);
            drop(dropped);
        }
    }

    /// Sum of the charges of all cached entries.
    pub fn total_charge(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.lock().unwrap().usage)
            .sum()
    }

    /// A process-unique id, used to prefix cache keys so several files can
    /// share one cache.
    pub fn new_id(&self) -> u64 {
        self.inner.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A reference to a cache entry. Dropping the handle releases the reference;
/// the underlying value lives until both the cache and every handle are done
/// with it.
pub struct CacheHandle<V: Send + Sync> {
    cache: Arc<CacheInner<V>>,
    shard: usize,
    slot: u32,
    value: Arc<V>,
}

impl<V: Send + Sync> CacheHandle<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Shares ownership of the value itself, independent of the handle's
    /// pin on the cache entry.
    pub fn clone_value(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }
}

impl<V: Send + Sync> Deref for CacheHandle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V: Send + Sync> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        self.cache.release(self.shard, self.slot);
    }
}
