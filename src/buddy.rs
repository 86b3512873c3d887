//! The buddy-system core: splitting, coalescing, partial unmap, and
//! in-place buddy-promotion growth, operating purely in page-index /
//! order space.
//!
//! Initial partitioning and the `idx2id_adj` shift follow the classic
//! buddy-system recurrence; per-order free indices, the address-ordered
//! first-fit scan, the coalesce loop, and the dry-run-then-commit
//! buddy promotion are each documented at their own definitions below.
//! Partial unmap (tail/head trim) always operates on the caller's
//! actual requested range rather than the covering block's full extent
//! -- the allocated index is keyed by requested byte length, not block
//! order, precisely so those trims can land on a byte, not just a page
//! count (see `DESIGN.md`).
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

use crate::cache::BlockCache;
use crate::chunk::Chunk;
use crate::error::Error;
use crate::ids::{PageId, PageIdx};
use crate::mapper::Mapper;
use crate::ordered_map::OrderedMap;
use crate::page_table::PageTable;

/// The largest block order this core will ever manage.
pub const MAX_ORDER: u8 = 20;

#[derive(Debug)]
pub(crate) struct BuddyCore {
    free: Vec<OrderedMap<()>>,
    /// Leader page -> the caller's originally requested byte length.
    /// The block's *order* lives in `pages`, the single source of
    /// truth for both free and allocated leaders; this map exists so
    /// unmap/remap can work out byte-granular boundaries instead of
    /// only ever seeing a block rounded up to its power-of-two size.
    alloc: OrderedMap<u64>,
    pages: PageTable,
    cache: BlockCache,
    max_order: u8,
    idx2id_adj: u32,
    page_num: u32,
}

fn floor_log2(mut n: u32) -> u8 {
    debug_assert!(n > 0);
    let mut order = 0u8;
    n >>= 1;
    while n > 0 {
        order += 1;
        n >>= 1;
    }
    order
}

impl BuddyCore {
    /// Partitions `page_num` pages into maximal naturally-aligned free
    /// blocks, smallest-order first, matching the bit pattern of
    /// `page_num` itself.
    pub fn new(page_num: u32, cache: BlockCache) -> Self {
        assert!(page_num > 0);

        let max_order = floor_log2(page_num).min(MAX_ORDER);
        let idx2id_adj = (1u32 << max_order) - (page_num & ((1u32 << max_order) - 1));

        let mut core = BuddyCore {
            free: (0..=max_order).map(|_| OrderedMap::new()).collect(),
            alloc: OrderedMap::new(),
            pages: PageTable::new(page_num),
            cache,
            max_order,
            idx2id_adj,
            page_num,
        };

        let mut offset = 0u32;
        for order in 0..=max_order {
            if (page_num >> order) & 1 == 1 {
                let idx = PageIdx(offset);
                core.pages.set_leader(idx, order);
                core.free[order as usize].insert(idx, ());
                offset += 1u32 << order;
            }
        }
        debug_assert_eq!(offset, page_num);

        core
    }

    #[inline]
    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    #[inline]
    pub fn page_num(&self) -> u32 {
        self.page_num
    }

    #[inline]
    fn idx_to_id(&self, idx: PageIdx) -> PageId {
        PageId(idx.0 + self.idx2id_adj)
    }

    #[inline]
    fn id_to_idx(&self, id: PageId) -> Option<PageIdx> {
        id.0.checked_sub(self.idx2id_adj).map(PageIdx)
    }

    fn buddy_of(&self, idx: PageIdx, order: u8) -> Option<PageIdx> {
        let buddy_idx = self.id_to_idx(self.idx_to_id(idx).buddy(order))?;
        if buddy_idx.0 < self.page_num {
            Some(buddy_idx)
        } else {
            None
        }
    }

    fn bytes_for_order(order: u8, page_size: u32) -> u64 {
        (1u64 << order) * (page_size as u64)
    }

    /// The last page (inclusive) actually covered by `size` bytes of
    /// data starting at `leader`.
    fn last_data_page(leader: PageIdx, size: u64, page_size: u32) -> u32 {
        let page_size = page_size as u64;
        let data_pages = (size + page_size - 1) / page_size;
        leader.get() + (data_pages as u32) - 1
    }

    /// Publishes a leader as free at `order`: records it in the page
    /// table, inserts it into the free index, and either defers or
    /// immediately issues `MADV_DONTNEED`, depending on whether the
    /// block cache is enabled.
    fn add_free_block(
        &mut self,
        leader: PageIdx,
        order: u8,
        chunk: &Chunk,
        mapper: &dyn Mapper,
    ) {
        self.pages.set_leader(leader, order);
        self.free[order as usize].insert(leader, ());

        if self.cache.enabled() {
            for evicted in self.cache.add(leader, order) {
                let addr = chunk.page_addr(evicted.leader.0);
                mapper.advise_dont_need(
                    addr,
                    Self::bytes_for_order(evicted.order, chunk.page_size()),
                );
            }
        } else {
            let addr = chunk.page_addr(leader.0);
            mapper.advise_dont_need(addr, Self::bytes_for_order(order, chunk.page_size()));
        }
    }

    /// Removes a free leader from the free index (and the cache's
    /// bookkeeping, if enabled) without touching its memory -- either
    /// it is about to be handed out by `alloc`, or absorbed into a
    /// larger coalesced block.
    fn remove_free_block(&mut self, leader: PageIdx, order: u8) {
        self.free[order as usize].delete(leader);
        if self.cache.enabled() {
            self.cache.remove(leader, order);
        }
    }

    /// Finds and removes the lowest-address free block whose order is
    /// at least `min_order`, splitting it down to exactly `min_order`.
    fn take_and_split(&mut self, min_order: u8) -> Option<PageIdx> {
        let mut found = None;
        for order in min_order..=self.max_order {
            if let Some((leader, ())) = self.free[order as usize].min() {
                found = Some((leader, order));
                break;
            }
        }

        let (mut leader, mut order) = found?;
        self.remove_free_block(leader, order);

        while order > min_order {
            order -= 1;
            let upper = PageIdx(leader.0 + (1u32 << order));
            self.pages.set_leader(upper, order);
            self.free[order as usize].insert(upper, ());
            self.pages.set_leader(leader, order);
        }

        Some(leader)
    }

    /// Allocates a block of exactly `order`, tagged with the caller's
    /// actual requested byte length (which may be less than the
    /// block's full page capacity).
    #[requires(order <= self.max_order)]
    pub fn alloc(&mut self, order: u8, size: u64) -> Result<PageIdx, Error> {
        let leader = self.take_and_split(order).ok_or(Error::OutOfMemory)?;
        self.pages.set_allocated_block(leader);
        self.alloc.insert(leader, size);
        Ok(leader)
    }

    /// The order an allocated leader currently occupies.
    pub fn alloc_order(&self, leader: PageIdx) -> Option<u8> {
        if self.alloc.contains(leader) {
            self.pages.order(leader)
        } else {
            None
        }
    }

    /// The requested byte length an allocated leader was last tagged
    /// with.
    pub fn alloc_size(&self, leader: PageIdx) -> Option<u64> {
        self.alloc.get(leader)
    }

    /// Finds the allocated block covering `idx`, if any -- the
    /// highest-keyed allocated leader at or before `idx` whose extent
    /// actually reaches `idx`. Returns `(leader, order, requested byte
    /// length)`.
    pub fn covering_alloc(&self, idx: PageIdx) -> Option<(PageIdx, u8, u64)> {
        let (leader, size) = self.alloc.search_le(idx)?;
        let order = self.pages.order(leader)?;
        if idx.get() < leader.get() + (1u32 << order) {
            Some((leader, order, size))
        } else {
            None
        }
    }

    /// Frees a previously-allocated leader, coalescing with free
    /// buddies as far as possible.
    pub fn free(&mut self, leader: PageIdx, chunk: &Chunk, mapper: &dyn Mapper) -> Result<(), Error> {
        if !self.pages.is_allocated_block(leader) {
            return Err(Error::InvalidArgument);
        }
        let order = self.pages.order(leader).expect("allocated leader has an order");
        self.alloc.delete(leader);

        self.pages.reset_allocated_block(leader);

        let mut cur_leader = leader;
        let mut cur_order = order;

        while cur_order < self.max_order {
            let buddy = match self.buddy_of(cur_leader, cur_order) {
                Some(b) => b,
                None => break,
            };

            let is_free_match = self.pages.order(buddy) == Some(cur_order)
                && !self.pages.is_allocated_block(buddy);
            if !is_free_match {
                break;
            }

            self.remove_free_block(buddy, cur_order);
            self.pages.reset_leader(buddy);

            cur_leader = PageIdx(cur_leader.0.min(buddy.0));
            cur_order += 1;
        }

        self.add_free_block(cur_leader, cur_order, chunk, mapper);
        Ok(())
    }

    /// Updates an allocated leader's requested byte length in place,
    /// without touching its order -- used when a resize still fits
    /// inside the block's current power-of-two page capacity.
    pub fn set_alloc_size(&mut self, leader: PageIdx, size: u64) -> Result<(), Error> {
        if !self.alloc.contains(leader) {
            return Err(Error::InvalidArgument);
        }
        self.alloc.set_value(leader, size);
        Ok(())
    }

    /// Attempts to grow an allocated block from its current order up
    /// to `target_order` in place, by repeatedly absorbing its free
    /// buddy, then tags it with `new_size`. Dry-run first: either
    /// every step succeeds, or none of the state changes.
    pub fn extend_alloc(&mut self, leader: PageIdx, target_order: u8, new_size: u64) -> Result<(), Error> {
        let cur_order = self.alloc_order(leader).ok_or(Error::InvalidArgument)?;
        if target_order <= cur_order || target_order > self.max_order {
            return Err(Error::InvalidArgument);
        }

        // Dry run: every intermediate buddy must be a free leader of
        // exactly the matching order, and `leader` must stay aligned
        // for each larger order along the way.
        for order in cur_order..target_order {
            if !self.idx_to_id(leader).is_aligned(order + 1) {
                return Err(Error::OutOfMemory);
            }
            let buddy = match self.buddy_of(leader, order) {
                Some(b) => b,
                None => return Err(Error::OutOfMemory),
            };
            let is_free_match =
                self.pages.order(buddy) == Some(order) && !self.pages.is_allocated_block(buddy);
            if !is_free_match {
                return Err(Error::OutOfMemory);
            }
        }

        // Commit.
        for order in cur_order..target_order {
            let buddy = self.buddy_of(leader, order).expect("checked above");
            self.remove_free_block(buddy, order);
            self.pages.reset_leader(buddy);
        }

        self.pages.set_order(leader, target_order);
        self.alloc.set_value(leader, new_size);
        Ok(())
    }

    /// Shrinks an allocated block by releasing its tail, keeping
    /// `leader` as the (smaller) allocated block. `um_page_idx` is the
    /// first page index being released (already page-aligned, since a
    /// tail release always starts at the caller's -- necessarily
    /// page-aligned -- `addr`). Coarse buddy-aligned halves are peeled
    /// off one at a time; there is no further fine-grained shrink pass
    /// here (unlike `head_trim`), so the surviving block can be up to
    /// one size class larger than the data it holds. Returns the new
    /// requested byte length.
    pub fn tail_trim(
        &mut self,
        leader: PageIdx,
        um_page_idx: u32,
        chunk: &Chunk,
        mapper: &dyn Mapper,
    ) -> Result<u64, Error> {
        let order = self.alloc_order(leader).ok_or(Error::InvalidArgument)?;

        let mut new_ord = order;
        let mut split = false;
        while new_ord > 0 && leader.get() + (1u32 << (new_ord - 1)) >= um_page_idx {
            new_ord -= 1;
            let free_addr = PageIdx(leader.get() + (1u32 << new_ord));
            self.add_free_block(free_addr, new_ord, chunk, mapper);
            split = true;
        }

        if !split {
            return Err(Error::InvalidArgument);
        }

        let new_size = (um_page_idx - leader.get()) as u64 * chunk.page_size() as u64;
        self.pages.set_order(leader, new_ord);
        self.alloc.set_value(leader, new_size);
        Ok(new_size)
    }

    /// Shrinks an allocated block by releasing its head, up through
    /// page index `um_end_idx` (inclusive). The surviving allocation
    /// moves to a new, higher leader: first a coarse buddy-aligned
    /// peel as far as the surviving data allows, then a second,
    /// fine-grained pass that keeps peeling trailing halves off while
    /// the block holds at least twice as many pages as its data needs.
    /// Returns `(new leader, new requested byte length)`.
    pub fn head_trim(
        &mut self,
        leader: PageIdx,
        um_end_idx: u32,
        chunk: &Chunk,
        mapper: &dyn Mapper,
    ) -> Result<(PageIdx, u64), Error> {
        let order = self.alloc_order(leader).ok_or(Error::InvalidArgument)?;
        let m_size = self.alloc_size(leader).expect("allocated leader has a size");
        let m_end_idx = Self::last_data_page(leader, m_size, chunk.page_size());

        let mut new_ord = order;
        let mut new_leader = leader;
        let mut split = false;

        loop {
            if new_ord == 0 {
                break;
            }
            let half_ord = new_ord - 1;
            let first_valid_page = um_end_idx + 1;
            if new_leader.get() + (1u32 << half_ord) > first_valid_page {
                break;
            }

            self.add_free_block(new_leader, half_ord, chunk, mapper);
            new_leader = PageIdx(new_leader.get() + (1u32 << half_ord));
            new_ord -= 1;
            split = true;
        }

        if !split {
            return Err(Error::InvalidArgument);
        }

        self.alloc.delete(leader);

        let mut alloc_page_num = (1u32 << order) - (new_leader.get() - leader.get());
        let data_page_num = m_end_idx - new_leader.get() + 1;

        while alloc_page_num >= 2 * data_page_num {
            new_ord -= 1;
            let free_addr = PageIdx(new_leader.get() + (1u32 << new_ord));
            self.add_free_block(free_addr, new_ord, chunk, mapper);
            alloc_page_num >>= 1;
        }

        let new_size = m_size - (new_leader.get() - leader.get()) as u64 * chunk.page_size() as u64;

        self.pages.set_leader(new_leader, new_ord);
        self.pages.set_allocated_block(new_leader);
        self.alloc.insert(new_leader, new_size);

        Ok((new_leader, new_size))
    }

    /// The number of free blocks currently sitting at `order`, for
    /// status reporting.
    pub fn free_block_count(&self, order: u8) -> u32 {
        self.free[order as usize].len() as u32
    }

    /// `(block count, total pages)` across every currently allocated
    /// block, for status reporting.
    pub fn alloc_block_stats(&self) -> (u32, u64) {
        let mut pages = 0u64;
        let mut count = 0u32;
        for (leader, _size) in self.alloc.iter() {
            let order = self.pages.order(leader).expect("allocated leader has an order");
            pages += 1u64 << order;
            count += 1;
        }
        (count, pages)
    }

    /// Every currently allocated block, as `(leader, order, requested
    /// byte length)` triples, for status reporting.
    pub fn alloc_entries(&self) -> SmallVec<[(PageIdx, u8, u64); 8]> {
        let mut out = SmallVec::new();
        for (leader, size) in self.alloc.iter() {
            let order = self.pages.order(leader).expect("allocated leader has an order");
            out.push((leader, order, size));
        }
        out
    }

    /// Every currently free block, as `(leader, order)` pairs, for
    /// status reporting.
    pub fn free_block_orders(&self) -> SmallVec<[(PageIdx, u8); 8]> {
        let mut out = SmallVec::new();
        for (order, map) in self.free.iter().enumerate() {
            for (idx, ()) in map.iter() {
                out.push((idx, order as u8));
            }
        }
        out
    }
}
