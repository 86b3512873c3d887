//! A bounded cache of recently-freed blocks that defers `MADV_DONTNEED`
//! until eviction.
//!
//! A fixed ring of slots (`LRU_MAX_ENTRY`-style; configurable here through
//! [`crate::config::Options::block_cache_page_cap`]) threaded as an
//! intrusive doubly-linked list for O(1) most-recently-used insertion
//! and oldest-eviction, plus an auxiliary ordered index so a block can
//! be pulled out of the middle of the ring by its leader page in
//! O(log n) instead of a linear scan.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")
))]
use disabled_contracts::*;

use smallvec::SmallVec;

use crate::ids::PageIdx;
use crate::ordered_map::OrderedMap;

/// Inline up to this many slots before the ring spills to the heap.
/// Matches [`MAX_RING_ENTRIES`], so a ring at its structural cap never
/// spills.
const INLINE_SLOTS: usize = 64;

/// The ring never holds more than this many entries, independent of
/// `capacity_pages`: a block at the structural cap evicts its oldest
/// entry before the new one is ever inserted.
const MAX_RING_ENTRIES: u32 = 64;

#[derive(Debug, Clone, Copy)]
struct Slot {
    leader: PageIdx,
    order: u8,
    prev: Option<u32>,
    next: Option<u32>,
}

/// A bounded LRU ring of free blocks: at most [`MAX_RING_ENTRIES`]
/// entries, and further capped by total page count, since blocks vary
/// in order.
#[derive(Debug)]
pub(crate) struct BlockCache {
    enabled: bool,
    capacity_pages: u32,
    total_pages: u32,
    entry_count: u32,
    slots: SmallVec<[Slot; INLINE_SLOTS]>,
    free_slots: Vec<u32>,
    head: Option<u32>, // most recently added
    tail: Option<u32>, // oldest, next to evict
    index: OrderedMap<u32>, // leader -> slot id
}

/// What the cache wants the caller to do with a block it evicted.
pub(crate) struct Evicted {
    pub leader: PageIdx,
    pub order: u8,
}

impl BlockCache {
    pub fn new(enabled: bool, capacity_pages: u32) -> Self {
        BlockCache {
            enabled,
            capacity_pages,
            total_pages: 0,
            entry_count: 0,
            slots: SmallVec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            index: OrderedMap::new(),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn alloc_slot(&mut self, slot: Slot) -> u32 {
        if let Some(id) = self.free_slots.pop() {
            self.slots[id as usize] = slot;
            id
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(slot);
            id
        }
    }

    fn unlink(&mut self, id: u32) {
        let (prev, next) = {
            let s = &self.slots[id as usize];
            (s.prev, s.next)
        };

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, id: u32) {
        self.slots[id as usize].prev = None;
        self.slots[id as usize].next = self.head;
        if let Some(h) = self.head {
            self.slots[h as usize].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    /// Adds a freed block to the cache. If the ring is already at its
    /// structural cap of [`MAX_RING_ENTRIES`], the oldest entry is
    /// evicted first, before the new block is ever inserted. Once
    /// inserted, if the ring now holds more pages than its budget (and
    /// more than a single entry), the oldest entry is evicted again.
    /// The caller must `MADV_DONTNEED` every block this returns.
    #[requires(self.enabled, "add only makes sense when the cache is enabled")]
    pub fn add(&mut self, leader: PageIdx, order: u8) -> SmallVec<[Evicted; 2]> {
        let mut evicted = SmallVec::new();
        let block_pages = 1u32 << order;

        if self.entry_count >= MAX_RING_ENTRIES {
            evicted.extend(self.evict_oldest());
        }

        let id = self.alloc_slot(Slot {
            leader,
            order,
            prev: None,
            next: None,
        });
        self.push_front(id);
        self.index.insert(leader, id);
        self.total_pages += block_pages;
        self.entry_count += 1;

        if self.total_pages > self.capacity_pages && self.head != self.tail {
            evicted.extend(self.evict_oldest());
        }

        evicted
    }

    /// Removes a block from the cache by its leader page, without
    /// advising it away -- used when the block is about to be
    /// reallocated or coalesced with a buddy and is no longer "just
    /// sitting idle."
    pub fn remove(&mut self, leader: PageIdx, order: u8) -> bool {
        let id = match self.index.delete(leader) {
            Some(id) => id,
            None => return false,
        };

        self.unlink(id);
        self.free_slots.push(id);
        self.total_pages -= 1u32 << order;
        self.entry_count -= 1;
        true
    }

    /// Evicts and returns the single oldest entry, if any.
    pub fn evict_oldest(&mut self) -> Option<Evicted> {
        let id = self.tail?;
        let slot = self.slots[id as usize];

        self.unlink(id);
        self.free_slots.push(id);
        self.index.delete(slot.leader);
        self.total_pages -= 1u32 << slot.order;
        self.entry_count -= 1;

        Some(Evicted {
            leader: slot.leader,
            order: slot.order,
        })
    }

    #[cfg(test)]
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_and_remove_roundtrip() {
        let mut cache = BlockCache::new(true, 64);
        let evicted = cache.add(PageIdx(0), 2);
        assert!(evicted.is_empty());
        assert_eq!(cache.total_pages(), 4);

        assert!(cache.remove(PageIdx(0), 2));
        assert_eq!(cache.total_pages(), 0);
        assert!(!cache.remove(PageIdx(0), 2));
    }

    #[test]
    fn eviction_respects_capacity() {
        let mut cache = BlockCache::new(true, 4);
        let ev1 = cache.add(PageIdx(0), 2); // 4 pages, fits exactly
        assert!(ev1.is_empty());

        let ev2 = cache.add(PageIdx(4), 2); // another 4 pages: must evict first
        assert_eq!(ev2.len(), 1);
        assert_eq!(ev2[0].leader, PageIdx(0));
        assert_eq!(cache.total_pages(), 4);
    }

    #[test]
    fn lru_order_is_oldest_first() {
        let mut cache = BlockCache::new(true, 100);
        cache.add(PageIdx(0), 0);
        cache.add(PageIdx(1), 0);
        cache.add(PageIdx(2), 0);

        let e1 = cache.evict_oldest().unwrap();
        assert_eq!(e1.leader, PageIdx(0));
        let e2 = cache.evict_oldest().unwrap();
        assert_eq!(e2.leader, PageIdx(1));
    }

    #[test]
    fn structural_cap_holds_even_with_huge_page_budget() {
        // Page budget alone would never evict here, but the ring's
        // fixed entry count should still cap out at MAX_RING_ENTRIES.
        let mut cache = BlockCache::new(true, 1 << 20);
        let mut total_evicted = 0usize;

        for i in 0..(MAX_RING_ENTRIES + 5) {
            total_evicted += cache.add(PageIdx(i), 0).len();
        }

        assert_eq!(total_evicted, 5);
        assert_eq!(cache.entry_count, MAX_RING_ENTRIES);
        assert_eq!(cache.total_pages(), MAX_RING_ENTRIES);
    }
}
