//! The single pre-reserved address range all pages live in.
//!
//! One non-`MAP_FIXED` `mmap` call covers the whole reservation -- no
//! separate guard pages or metadata region, since nothing here needs to
//! recover bookkeeping from the mapping's own bytes. This crate's
//! metadata (the page table, the free/alloc maps) lives in ordinary
//! heap allocations owned by `BuddyCore`, not inside the chunk itself.
use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::error::{fail, Error};
use crate::mapper::Mapper;

/// A single flat `PROT_READ | PROT_WRITE` reservation, anonymous and
/// backed by no file, sized to a whole number of pages.
#[derive(Debug)]
pub(crate) struct Chunk {
    base: NonNull<c_void>,
    page_size: u32,
    page_size_log2: u32,
    page_num: u32,
}

// The chunk is a fixed address range; nothing about holding a `Chunk`
// is thread-specific. Safety for concurrent access is enforced by the
// single `Mutex<Allocator>` wrapper in `lib.rs`, not by this type.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Reserves a chunk of at least `min_page_num` pages (more, if the
    /// host hands back a larger naturally-aligned region) through
    /// `mapper`.
    pub fn acquire(
        mapper: &dyn Mapper,
        min_page_num: u32,
    ) -> Result<Chunk, Error> {
        if min_page_num == 0 {
            return fail(Error::InvalidArgument);
        }

        let page_size = mapper.page_size();
        let page_size_log2 = page_size.trailing_zeros();
        let len = (min_page_num as u64) * (page_size as u64);

        let base = mapper
            .reserve_region(len)
            .map_err(|_| Error::EnvironmentFailure)?;

        Ok(Chunk {
            base,
            page_size,
            page_size_log2,
            page_num: min_page_num,
        })
    }

    /// Releases the whole chunk back to the host. Callers must ensure
    /// no live references into the chunk remain.
    pub fn release(self, mapper: &dyn Mapper) {
        let len = (self.page_num as u64) * (self.page_size as u64);
        mapper.release_region(self.base, len);
    }

    #[inline]
    pub fn page_num(&self) -> u32 {
        self.page_num
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[inline]
    pub fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    /// The byte address a page index begins at.
    pub fn page_addr(&self, idx: u32) -> NonNull<c_void> {
        assert!(idx < self.page_num);
        let offset = (idx as usize) << self.page_size_log2;
        // SAFETY: offset stays within the single reservation acquired above.
        unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(offset))
        }
    }

    /// True iff `addr` falls inside this chunk's reservation.
    pub fn contains(&self, addr: NonNull<c_void>) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + (self.page_num as usize) * (self.page_size as usize);
        let a = addr.as_ptr() as usize;
        a >= start && a < end
    }

    /// The page index `addr` falls within, if it is inside this chunk
    /// and page-aligned.
    pub fn addr_to_page_idx(&self, addr: NonNull<c_void>) -> Option<u32> {
        if !self.contains(addr) {
            return None;
        }
        let start = self.base.as_ptr() as usize;
        let a = addr.as_ptr() as usize;
        let delta = a - start;
        if delta & ((self.page_size as usize) - 1) != 0 {
            return None;
        }
        Some((delta >> self.page_size_log2) as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::test_support::FakeMapper;

    #[test]
    fn acquire_rejects_zero_pages() {
        let mapper = FakeMapper::new(4096, 64);
        assert!(Chunk::acquire(&mapper, 0).is_err());
    }

    #[test]
    fn page_addr_roundtrips() {
        let mapper = FakeMapper::new(4096, 64);
        let chunk = Chunk::acquire(&mapper, 16).unwrap();
        let addr = chunk.page_addr(3);
        assert_eq!(chunk.addr_to_page_idx(addr), Some(3));
    }
}
