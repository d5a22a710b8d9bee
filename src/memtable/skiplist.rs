//! Concurrent skip list over arena-allocated nodes.
//!
//! Writes are externally serialized; any number of readers may run
//! concurrently with the single writer. The protocol that makes this safe is
//! small: a node is fully initialized before it is published, publication
//! happens through a release store into its predecessor's next pointer, and
//! readers follow next pointers with acquire loads. The list height is read
//! with relaxed ordering; a reader that sees a stale, smaller height simply
//! starts its descent one level down, which is always correct.
//!
//! Nodes live in the arena and are never freed or modified (below the
//! published next pointers) until the arena itself is dropped.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::arena::Arena;

pub const MAX_HEIGHT: usize = 12;

/// Expected fraction of nodes reaching each successive level is one in
/// `BRANCHING`.
const BRANCHING: u32 = 4;

/// Compares the keys two encoded entries embed.
pub trait KeyComparator: Send + Sync {
    /// # Safety
    ///
    /// Both pointers must address entries placed in the arena feeding this
    /// list (or seek targets encoded the same way) that outlive the call.
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> CmpOrdering;
}

#[repr(C)]
struct Node {
    key: *const u8,
    /// Trailing array: a node of height `h` is allocated with `h` link
    /// slots, of which this is the first.
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    /// # Safety
    ///
    /// `level` must be below the height this node was allocated with.
    unsafe fn next(&self, level: usize) -> *mut Node {
        (*self.next.as_ptr().add(level)).load(Ordering::Acquire)
    }

    unsafe fn set_next(&self, level: usize, node: *mut Node) {
        (*self.next.as_ptr().add(level)).store(node, Ordering::Release);
    }

    /// Variants safe only where publication order is already guaranteed by
    /// a later release store.
    unsafe fn next_relaxed(&self, level: usize) -> *mut Node {
        (*self.next.as_ptr().add(level)).load(Ordering::Relaxed)
    }

    unsafe fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        (*self.next.as_ptr().add(level)).store(node, Ordering::Relaxed);
    }
}

pub struct SkipList<C: KeyComparator> {
    comparator: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the tallest node ever inserted.
    max_height: AtomicUsize,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(comparator: C, arena: Arc<Arena>) -> SkipList<C> {
        let head = Self::new_node(&arena, ptr::null(), MAX_HEIGHT);
        SkipList {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
        }
    }

    /// Inserts an entry. The caller serializes writers and guarantees no
    /// entry comparing equal is already present.
    pub fn insert(&self, key: *const u8) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let node = unsafe { self.find_greater_or_equal(key, Some(&mut prev)) };
        debug_assert!(
            node.is_null() || unsafe { self.comparator.compare((*node).key, key) } != CmpOrdering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = self.random_height();
        let list_height = self.height();
        if height > list_height {
            for slot in prev.iter_mut().take(height).skip(list_height) {
                *slot = self.head;
            }
            // Relaxed is enough: a reader seeing the new height before the
            // new node finds null from head and just descends.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node(&self.arena, key, height);
        unsafe {
            for (level, &pred) in prev.iter().enumerate().take(height) {
                // The node is invisible until the release store below, so
                // its own link can be set without a barrier.
                (*node).set_next_relaxed(level, (*pred).next_relaxed(level));
                (*pred).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: *const u8) -> bool {
        let node = unsafe { self.find_greater_or_equal(key, None) };
        !node.is_null() && unsafe { self.comparator.compare((*node).key, key) } == CmpOrdering::Equal
    }

    pub fn iter(&self) -> SkipListIter<'_, C> {
        SkipListIter {
            list: self,
            node: ptr::null(),
        }
    }

    fn height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    fn new_node(arena: &Arena, key: *const u8, height: usize) -> *mut Node {
        let size = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.alloc_aligned(size) as *mut Node;
        unsafe {
            ptr::addr_of_mut!((*node).key).write(key);
            let links = (*node).next.as_mut_ptr();
            for level in 0..height {
                ptr::write(links.add(level), AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    /// True when `key` sorts after the entry in `node`.
    unsafe fn key_is_after_node(&self, key: *const u8, node: *mut Node) -> bool {
        !node.is_null() && self.comparator.compare((*node).key, key) == CmpOrdering::Less
    }

    /// Returns the first node at or after `key`, recording the predecessor
    /// at every level in `prev` when asked to.
    unsafe fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = (*node).next(level);
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(p) = prev.as_mut() {
                    p[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Returns the last node before `key`, or the head when none is.
    unsafe fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut node = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = (*node).next(level);
            if !next.is_null() && self.comparator.compare((*next).key, key) == CmpOrdering::Less {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Returns the last node in the list, or the head when empty.
    unsafe fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = (*node).next(level);
            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }
}

pub struct SkipListIter<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *const Node,
}

impl<'a, C: KeyComparator> SkipListIter<'a, C> {
    pub fn new(list: &'a SkipList<C>) -> SkipListIter<'a, C> {
        list.iter()
    }

    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The current entry; requires `valid()`.
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        // Searching backwards from the list is simpler than keeping a prev
        // link per node.
        debug_assert!(self.valid());
        let node = unsafe { self.list.find_less_than((*self.node).key) };
        self.node = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }

    pub fn seek(&mut self, target: *const u8) {
        self.node = unsafe { self.list.find_greater_or_equal(target, None) };
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = unsafe { self.list.find_last() };
        self.node = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }
}
