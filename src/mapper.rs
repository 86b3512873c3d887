//! A `Mapper` is responsible for acquiring address space from the
//! operating system and for the handful of other host calls the core
//! needs (`madvise`, and the raw host `mmap`/`munmap`/`mremap` used in
//! [`crate::config::Mode::Sys`]/`PreferSys` mode).
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

use std::os::raw::c_void;
use std::ptr::NonNull;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// The mapping granularity. Constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> u32;

    /// Reserves `size` bytes of address space, `PROT_READ | PROT_WRITE`,
    /// anonymous, with no file backing. `size` is a multiple of
    /// `page_size()`.
    #[requires(size > 0 && size % (self.page_size() as u64) == 0)]
    fn reserve_region(&self, size: u64) -> Result<NonNull<c_void>, i32>;

    /// Releases a region previously returned by `reserve_region`.
    fn release_region(&self, base: NonNull<c_void>, size: u64);

    /// Advises the host that the pages in `[base, base+size)` are no
    /// longer needed (`MADV_DONTNEED`); a later access re-faults them
    /// in, zero-filled. Used by the block cache on eviction and,
    /// when the cache is disabled, on every `free`.
    #[requires(size > 0 && size % (self.page_size() as u64) == 0)]
    fn advise_dont_need(&self, base: NonNull<c_void>, size: u64);

    /// Forwards a `mmap`-style request straight to the host, for
    /// `Sys`/`PreferSys` mode. Returns the mapped base address.
    fn host_mmap(&self, size: u64) -> Result<NonNull<c_void>, i32>;

    /// Forwards a `munmap`-style request straight to the host.
    fn host_munmap(&self, base: NonNull<c_void>, size: u64) -> Result<(), i32>;

    /// Forwards a `mremap`-style request straight to the host,
    /// returning the (possibly relocated) base address.
    fn host_mremap(
        &self,
        base: NonNull<c_void>,
        old_size: u64,
        new_size: u64,
        may_move: bool,
    ) -> Result<NonNull<c_void>, i32>;
}

#[derive(Debug)]
pub(crate) struct HostMapper {}

#[contract_trait]
impl Mapper for HostMapper {
    fn page_size(&self) -> u32 {
        crate::map::page_size()
    }

    fn reserve_region(&self, size: u64) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn release_region(&self, base: NonNull<c_void>, size: u64) {
        crate::map::release_region(base, size);
    }

    fn advise_dont_need(&self, base: NonNull<c_void>, size: u64) {
        crate::map::advise_dont_need(base, size);
    }

    fn host_mmap(&self, size: u64) -> Result<NonNull<c_void>, i32> {
        crate::map::host_mmap(size)
    }

    fn host_munmap(&self, base: NonNull<c_void>, size: u64) -> Result<(), i32> {
        crate::map::host_munmap(base, size)
    }

    fn host_mremap(
        &self,
        base: NonNull<c_void>,
        old_size: u64,
        new_size: u64,
        may_move: bool,
    ) -> Result<NonNull<c_void>, i32> {
        crate::map::host_mremap(base, old_size, new_size, may_move)
    }
}

lazy_static::lazy_static! {
    static ref HOST_MAPPER: HostMapper = HostMapper {};
}

/// The mapper used by `init`/`init_with` unless a caller substitutes
/// one of their own (tests do, through [`test_support::FakeMapper`]).
pub fn default_mapper() -> &'static dyn Mapper {
    &*HOST_MAPPER
}
