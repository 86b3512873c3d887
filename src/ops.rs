//! The allocator's public operations: mode-aware `map`/`unmap`/`remap`,
//! and the chunk-only `alloc`/`free` pair.
use std::collections::HashMap;
use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::buddy::BuddyCore;
use crate::cache::BlockCache;
use crate::chunk::Chunk;
use crate::config::{Mode, Options, MAP_32BIT, MAP_FIXED};
use crate::error::{fail, Error};
use crate::ids::PageIdx;
use crate::mapper::Mapper;
use crate::status::Status;

/// The largest order [`BuddyCore`] is willing to manage, mirrored here
/// so `order_for_bytes` can reject oversized requests before ever
/// touching the core.
fn ceil_log2(n: u32) -> u8 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros() as u8
    }
}

fn ceil_div(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Records `err` as the process's last error and hands it back,
/// for use inside `ok_or_else`/`map_err` at a call site that doesn't
/// otherwise return through [`crate::error::fail`].
fn fail_err(err: Error) -> Error {
    crate::error::set_last_error(err);
    err
}

/// The allocator's full state: one chunk of address space, the buddy
/// core managing it, and (in `Sys`/`PreferUser`/`PreferSys` mode) the
/// set of regions serviced directly by the host instead.
#[derive(Debug)]
pub(crate) struct Allocator {
    mapper: &'static dyn Mapper,
    mode: Mode,
    chunk: Chunk,
    core: BuddyCore,
    host_regions: HashMap<usize, u64>,
}

impl Allocator {
    pub fn init_with(mapper: &'static dyn Mapper, options: Options) -> Result<Allocator, Error> {
        const DEFAULT_CHUNK_PAGE_NUM: u32 = 1 << 16;

        let page_num = options.debug_page_num.unwrap_or(DEFAULT_CHUNK_PAGE_NUM);
        let chunk = Chunk::acquire(mapper, page_num)?;
        let cache = BlockCache::new(options.enable_block_cache, options.block_cache_page_cap);
        let core = BuddyCore::new(chunk.page_num(), cache);

        Ok(Allocator {
            mapper,
            mode: options.mode,
            chunk,
            core,
            host_regions: HashMap::new(),
        })
    }

    fn order_for_bytes(&self, len: u64) -> Result<u8, Error> {
        if len == 0 {
            return fail(Error::InvalidArgument);
        }

        let page_size = self.chunk.page_size() as u64;
        let pages = ceil_div(len, page_size);
        let order = ceil_log2(pages as u32);
        if order > self.core.max_order() {
            return fail(Error::OutOfMemory);
        }
        Ok(order)
    }

    fn addr_for_idx(&self, idx: u32) -> NonNull<c_void> {
        self.chunk.page_addr(idx)
    }

    /// Allocates `len` bytes directly from the chunk, bypassing
    /// `mode`. Tags the block with the exact `len` requested, rounding
    /// only its page/order footprint up.
    pub fn alloc(&mut self, len: u64) -> Result<NonNull<c_void>, Error> {
        let order = self.order_for_bytes(len)?;
        let leader = self.core.alloc(order, len).map_err(fail_err)?;
        Ok(self.addr_for_idx(leader.get()))
    }

    /// Releases a block previously returned by [`Allocator::alloc`].
    pub fn free(&mut self, addr: NonNull<c_void>) -> Result<(), Error> {
        let idx = self
            .chunk
            .addr_to_page_idx(addr)
            .ok_or(Error::InvalidArgument)
            .map_err(fail_err)?;
        self.core
            .free(PageIdx(idx), &self.chunk, self.mapper)
            .map_err(fail_err)
    }

    /// Services a `map` request per `self.mode`. `addr` must be null,
    /// `fd` must be `-1`, `flags` must contain [`MAP_32BIT`] and must
    /// not contain [`MAP_FIXED`] -- this crate never supports
    /// fixed-address or file-backed mappings. `prot` and `offset` are
    /// accepted for contract compatibility but not otherwise
    /// interpreted: every mapping this crate hands out is anonymous,
    /// `PROT_READ | PROT_WRITE`.
    pub fn map(
        &mut self,
        addr: *mut c_void,
        len: u64,
        _prot: i32,
        flags: i32,
        fd: i32,
        _offset: i64,
    ) -> Result<NonNull<c_void>, Error> {
        if !addr.is_null() {
            return fail(Error::InvalidArgument);
        }
        if fd != -1 {
            return fail(Error::InvalidArgument);
        }
        if flags & MAP_32BIT == 0 {
            return fail(Error::InvalidArgument);
        }
        if flags & MAP_FIXED != 0 {
            return fail(Error::InvalidArgument);
        }

        match self.mode {
            Mode::User => self.map_user(len),
            Mode::Sys => self.map_sys(len),
            Mode::PreferUser => self.map_user(len).or_else(|_| self.map_sys(len)),
            Mode::PreferSys => self.map_sys(len).or_else(|_| self.map_user(len)),
        }
    }

    fn map_user(&mut self, len: u64) -> Result<NonNull<c_void>, Error> {
        self.alloc(len)
    }

    fn map_sys(&mut self, len: u64) -> Result<NonNull<c_void>, Error> {
        if len == 0 {
            return fail(Error::InvalidArgument);
        }
        let page_size = self.chunk.page_size() as u64;
        let rounded = ceil_div(len, page_size) * page_size;

        let base = self
            .mapper
            .host_mmap(rounded)
            .map_err(|_| fail_err(Error::EnvironmentFailure))?;
        self.host_regions.insert(base.as_ptr() as usize, rounded);
        Ok(base)
    }

    /// Releases `[addr, addr+len)`. For chunk-backed regions, this may
    /// be a partial (tail- or head-only) release; straddling a free
    /// boundary in the middle of a block is rejected. `len` need not
    /// be a multiple of the page size -- if its end and the original
    /// mapping's end land on the same final page, they are treated as
    /// identical; otherwise any release reaching past the mapping's
    /// end is rejected.
    pub fn unmap(&mut self, addr: NonNull<c_void>, len: u64) -> Result<(), Error> {
        if len == 0 {
            return fail(Error::InvalidArgument);
        }

        if let Some(&region_len) = self.host_regions.get(&(addr.as_ptr() as usize)) {
            if region_len != len {
                return fail(Error::InvalidArgument);
            }
            self.host_regions.remove(&(addr.as_ptr() as usize));
            return self
                .mapper
                .host_munmap(addr, len)
                .map_err(|_| fail_err(Error::EnvironmentFailure));
        }

        let page_size = self.chunk.page_size() as u64;
        let um_page_idx = self
            .chunk
            .addr_to_page_idx(addr)
            .ok_or(Error::InvalidArgument)
            .map_err(fail_err)?;

        let (leader, _order, m_size) = self
            .core
            .covering_alloc(PageIdx(um_page_idx))
            .ok_or(Error::InvalidArgument)
            .map_err(fail_err)?;

        let m_end = (leader.get() as u64) * page_size + m_size;
        let mut um_end = (um_page_idx as u64) * page_size + len;

        if um_end / page_size == m_end / page_size {
            // The ends of the mapped and unmapped ranges fall within
            // the same final page: treat them as identical.
            um_end = m_end;
        } else if um_end > m_end {
            return fail(Error::InvalidArgument);
        }

        let m_end_idx = (ceil_div(m_end, page_size) as u32) - 1;
        let um_end_idx = (ceil_div(um_end, page_size) as u32) - 1;
        let block_start = leader.get();

        if block_start == um_page_idx && m_end_idx == um_end_idx {
            return self
                .core
                .free(leader, &self.chunk, self.mapper)
                .map_err(fail_err);
        }

        if block_start == um_page_idx {
            self.core
                .head_trim(leader, um_end_idx, &self.chunk, self.mapper)
                .map(|_| ())
                .map_err(fail_err)
        } else if m_end_idx == um_end_idx {
            self.core
                .tail_trim(leader, um_page_idx, &self.chunk, self.mapper)
                .map(|_| ())
                .map_err(fail_err)
        } else {
            // Unmapping a middle slice of a block, touching neither end,
            // isn't supported.
            fail(Error::InvalidArgument)
        }
    }

    /// Resizes an existing chunk-backed allocation from `old_len` to
    /// `new_len`, growing in place when possible and relocating
    /// (copying the first `old_len` bytes) only when `may_move` is set
    /// and in-place growth is impossible. `(addr, old_len)` must match
    /// an existing allocated entry exactly.
    pub fn remap(
        &mut self,
        addr: NonNull<c_void>,
        old_len: u64,
        new_len: u64,
        may_move: bool,
    ) -> Result<NonNull<c_void>, Error> {
        let idx = self
            .chunk
            .addr_to_page_idx(addr)
            .ok_or(Error::InvalidArgument)
            .map_err(fail_err)?;
        let leader = PageIdx(idx);

        let stored_size = self
            .core
            .alloc_size(leader)
            .ok_or(Error::InvalidArgument)
            .map_err(fail_err)?;
        if stored_size != old_len {
            return fail(Error::InvalidArgument);
        }

        if new_len == 0 {
            return fail(Error::InvalidArgument);
        }

        let page_size = self.chunk.page_size() as u64;
        let old_page_num = ceil_div(old_len, page_size) as u32;
        let new_page_num = ceil_div(new_len, page_size) as u32;

        if old_page_num > new_page_num {
            let um_page_idx = leader.get() + new_page_num;
            self.core
                .tail_trim(leader, um_page_idx, &self.chunk, self.mapper)
                .map_err(fail_err)?;
            self.core
                .set_alloc_size(leader, new_len)
                .map_err(fail_err)?;
            return Ok(addr);
        }

        if old_page_num < new_page_num {
            let order = self
                .core
                .alloc_order(leader)
                .ok_or(Error::InvalidArgument)
                .map_err(fail_err)?;

            // Already fits inside the block's current power-of-two
            // page capacity: just relabel the requested length.
            if new_page_num <= (1u32 << order) {
                self.core
                    .set_alloc_size(leader, new_len)
                    .map_err(fail_err)?;
                return Ok(addr);
            }

            let target_order = self.order_for_bytes(new_len)?;
            return match self.core.extend_alloc(leader, target_order, new_len) {
                Ok(()) => Ok(addr),
                Err(Error::OutOfMemory) if may_move => {
                    let new_addr = self.alloc(new_len)?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            addr.as_ptr() as *const u8,
                            new_addr.as_ptr() as *mut u8,
                            old_len as usize,
                        );
                    }
                    self.core
                        .free(leader, &self.chunk, self.mapper)
                        .map_err(fail_err)?;
                    Ok(new_addr)
                }
                Err(e) => fail(e),
            };
        }

        // Same page count either way: only the requested length
        // changes, not the block's footprint.
        self.core
            .set_alloc_size(leader, new_len)
            .map_err(fail_err)?;
        Ok(addr)
    }

    pub fn status(&self) -> Status {
        Status::capture(&self.core, self.chunk.page_size())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::test_support::FakeMapper;

    fn fixture(page_num: u32) -> Allocator {
        let mapper: &'static FakeMapper = Box::leak(Box::new(FakeMapper::new(4096, page_num)));
        Allocator {
            mapper,
            mode: Mode::User,
            chunk: Chunk::acquire(mapper, page_num).unwrap(),
            core: BuddyCore::new(page_num, BlockCache::new(false, 0)),
            host_regions: HashMap::new(),
        }
    }

    fn do_map(alloc: &mut Allocator, len: u64) -> Result<NonNull<c_void>, Error> {
        alloc.map(std::ptr::null_mut(), len, 0, MAP_32BIT, -1, 0)
    }

    // Scenario 1: a handful of small sequential allocations each get
    // their own non-overlapping block, and freeing them all returns
    // the chunk to a single top-level free block.
    #[test]
    fn sequential_small_allocations() {
        let mut alloc = fixture(64);
        let a = alloc.alloc(4096).unwrap();
        let b = alloc.alloc(4096).unwrap();
        let c = alloc.alloc(4096).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);

        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        alloc.free(c).unwrap();

        let status = alloc.status();
        assert_eq!(status.allocated_blocks, 0);
        assert_eq!(status.free_pages, 64);
        assert!(status.alloc_entries.is_empty());
        assert_eq!(status.free_entries.len(), 1);
        assert_eq!(status.free_entries[0], crate::status::FreeEntry { leader_page: 0, order: 6 });
    }

    // Scenario 2: unmapping a non-page-aligned tail shrinks the block
    // in place and frees the remainder -- the tie-break rule snaps the
    // unmap's end to the mapping's true end since both land on page 5.
    #[test]
    fn tail_trim_via_unmap() {
        let mut alloc = fixture(8);
        let addr = alloc.alloc(5 * 4096 + 123).unwrap(); // leader 0, order 3

        alloc.unmap(alloc.chunk.page_addr(3), 2 * 4096 + 120).unwrap();

        let status = alloc.status();
        assert_eq!(status.alloc_entries.len(), 1);
        assert_eq!(
            status.alloc_entries[0],
            crate::status::AllocEntry { leader_page: 0, order: 2, size: 3 * 4096 }
        );
        assert_eq!(status.free_entries.len(), 1);
        assert_eq!(status.free_entries[0], crate::status::FreeEntry { leader_page: 4, order: 2 });
    }

    // Scenario 3: unmapping a non-page-aligned head moves the
    // surviving allocation to a new, higher address -- the coarse peel
    // plus the aggressive-shrink pass leave a minimally-sized block.
    #[test]
    fn head_trim_via_unmap() {
        let mut alloc = fixture(8);
        let addr = alloc.alloc(5 * 4096 + 123).unwrap(); // leader 0, order 3

        alloc.unmap(addr, 3 * 4096 + 450).unwrap();

        let status = alloc.status();
        assert_eq!(status.alloc_entries.len(), 1);
        assert_eq!(
            status.alloc_entries[0],
            crate::status::AllocEntry { leader_page: 4, order: 1, size: 4096 + 123 }
        );
        let mut free = status.free_entries.clone();
        free.sort_by_key(|e| e.leader_page);
        assert_eq!(
            free,
            vec![
                crate::status::FreeEntry { leader_page: 0, order: 2 },
                crate::status::FreeEntry { leader_page: 6, order: 1 },
            ]
        );
    }

    // Scenario 4: growing an allocation via `remap` when its buddy is
    // free expands it in place -- the address never changes.
    #[test]
    fn in_place_expand_via_remap() {
        let mut alloc = fixture(16);
        let addr = alloc.alloc(4096 + 123).unwrap(); // order 1, at idx 0

        let grown = alloc
            .remap(addr, 4096 + 123, 6 * 4096 + 234, false)
            .unwrap();
        assert_eq!(grown, addr);

        let status = alloc.status();
        assert_eq!(
            status.alloc_entries[0],
            crate::status::AllocEntry { leader_page: 0, order: 3, size: 6 * 4096 + 234 }
        );
    }

    // Scenario 5: growing an allocation via `remap` when no in-place
    // expansion is possible, but the caller allows relocation, copies
    // the live bytes to a fresh block.
    #[test]
    fn expand_and_move_via_remap() {
        // 32 pages: enough room, after two order-2 allocations pin each
        // other as mutual buddies, to relocate one of them into the
        // remaining free space instead of growing it in place.
        let mut alloc = fixture(32);
        let a = alloc.alloc(4096 * 4).unwrap(); // idx 0..4, order 2
        let _b = alloc.alloc(4096 * 4).unwrap(); // idx 4..8: blocks a's buddy

        unsafe {
            *(a.as_ptr() as *mut u8) = 0x42;
        }

        let moved = alloc.remap(a, 4096 * 4, 4096 * 8, true).unwrap();
        assert_ne!(moved, a);
        unsafe {
            assert_eq!(*(moved.as_ptr() as *const u8), 0x42);
        }

        // Without permission to move, the same request must fail.
        let mut alloc2 = fixture(32);
        let a2 = alloc2.alloc(4096 * 4).unwrap();
        let _b2 = alloc2.alloc(4096 * 4).unwrap();
        assert_eq!(
            alloc2.remap(a2, 4096 * 4, 4096 * 8, false),
            Err(Error::OutOfMemory)
        );
    }

    // Scenario 6: shrinking an allocation via `remap` releases its
    // tail and keeps the same address.
    #[test]
    fn shrink_via_remap() {
        let mut alloc = fixture(16);
        let addr = alloc.alloc(4096 * 16).unwrap();

        let shrunk = alloc.remap(addr, 4096 * 16, 4096 * 4, false).unwrap();
        assert_eq!(shrunk, addr);
        assert_eq!(alloc.status().allocated_pages, 4);
        assert_eq!(alloc.status().free_pages, 12);
    }

    // Growing into a length that exactly fills the block's current
    // power-of-two page capacity is a relabel, not a relocation: this
    // is a deliberate off-by-one fix versus the algorithm this was
    // ported from, which required strictly fewer pages than capacity
    // and so would have needlessly attempted to grow an exact-fit
    // request.
    #[test]
    fn remap_to_exact_existing_capacity_is_a_relabel() {
        let mut alloc = fixture(16);
        let addr = alloc.alloc(4096 * 2 + 1).unwrap(); // order 2 (4 pages), 3 pages of data

        let same = alloc.remap(addr, 4096 * 2 + 1, 4 * 4096, false).unwrap();
        assert_eq!(same, addr);
        assert_eq!(alloc.status().alloc_entries[0].order, 2);
        assert_eq!(alloc.status().alloc_entries[0].size, 4 * 4096);
    }

    #[test]
    fn zero_length_map_fails() {
        let mut alloc = fixture(16);
        assert_eq!(do_map(&mut alloc, 0), Err(Error::InvalidArgument));
    }

    #[test]
    fn oversized_map_fails_out_of_memory() {
        let mut alloc = fixture(16);
        assert_eq!(do_map(&mut alloc, 4096 * 1024), Err(Error::OutOfMemory));
    }

    #[test]
    fn map_rejects_non_null_addr() {
        let mut alloc = fixture(16);
        let bogus = 1usize as *mut c_void;
        assert_eq!(
            alloc.map(bogus, 4096, 0, MAP_32BIT, -1, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn map_rejects_fixed_address_flag() {
        let mut alloc = fixture(16);
        assert_eq!(
            alloc.map(std::ptr::null_mut(), 4096, 0, MAP_32BIT | MAP_FIXED, -1, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn map_rejects_missing_32bit_flag() {
        let mut alloc = fixture(16);
        assert_eq!(
            alloc.map(std::ptr::null_mut(), 4096, 0, 0, -1, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn map_rejects_file_descriptor() {
        let mut alloc = fixture(16);
        assert_eq!(
            alloc.map(std::ptr::null_mut(), 4096, 0, MAP_32BIT, 3, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn straddling_unmap_is_rejected() {
        let mut alloc = fixture(16);
        let addr = alloc.alloc(4096 * 16).unwrap();

        // Releasing pages [2, 10) straddles the middle of the block:
        // neither a head- nor a tail-aligned release.
        let mid_addr = alloc.chunk.page_addr(2);
        assert_eq!(
            alloc.unmap(mid_addr, 4096 * 8),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn unmap_past_the_mapping_end_is_rejected() {
        let mut alloc = fixture(16);
        let _addr = alloc.alloc(4096 * 3).unwrap(); // order 2 (4 pages), 3 pages of data

        // Releasing the whole 4-page block's worth, when only 3 pages
        // were ever requested, reaches past the mapping's real end.
        assert_eq!(
            alloc.unmap(alloc.chunk.page_addr(0), 4096 * 4),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn remap_without_may_move_requiring_move_fails() {
        let mut alloc = fixture(16);
        let a = alloc.alloc(4096 * 4).unwrap();
        let _b = alloc.alloc(4096 * 4).unwrap();
        assert_eq!(
            alloc.remap(a, 4096 * 4, 4096 * 16, false),
            Err(Error::OutOfMemory)
        );
    }

    #[test]
    fn remap_rejects_size_mismatched_old_len() {
        let mut alloc = fixture(16);
        let addr = alloc.alloc(4096 * 2).unwrap();
        assert_eq!(
            alloc.remap(addr, 4096 * 3, 4096 * 4, false),
            Err(Error::InvalidArgument)
        );
    }
}
