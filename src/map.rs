//! Rust bindings for `c/map.c`, the small C shim around `mmap` et al.
use std::os::raw::c_void;
use std::ptr::NonNull;

extern "C" {
    fn pagecarve__page_size() -> i64;
    fn pagecarve__reserve_region(size: usize, out_errno: *mut i32) -> *mut c_void;
    fn pagecarve__release_region(base: *mut c_void, size: usize) -> i32;
    fn pagecarve__advise_dont_need(base: *mut c_void, size: usize) -> i32;
    fn pagecarve__host_mmap(size: usize, out_errno: *mut i32) -> *mut c_void;
    fn pagecarve__host_munmap(base: *mut c_void, size: usize) -> i32;
    fn pagecarve__host_mremap(
        base: *mut c_void,
        old_size: usize,
        new_size: usize,
        may_move: i32,
        out_errno: *mut i32,
    ) -> *mut c_void;
}

fn page_size_or_die() -> u32 {
    let ret = unsafe { pagecarve__page_size() };

    if ret <= 0 {
        panic!("unable to determine page size: errno={}", -ret);
    }

    ret as u32
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: u32 = page_size_or_die();
}

/// The host's page size, queried once and cached for the life of the
/// process.
#[inline]
pub fn page_size() -> u32 {
    *PAGE_SIZE
}

/// Reserves `size` bytes of address space. `size` must be a multiple
/// of [`page_size`].
pub fn reserve_region(size: u64) -> Result<NonNull<c_void>, i32> {
    assert!(size > 0 && size % (page_size() as u64) == 0);

    let mut errno: i32 = 0;
    let ret = unsafe { pagecarve__reserve_region(size as usize, &mut errno) };

    NonNull::new(ret).ok_or(errno)
}

/// Releases a region previously returned by [`reserve_region`].
pub fn release_region(base: NonNull<c_void>, size: u64) {
    let ret = unsafe { pagecarve__release_region(base.as_ptr(), size as usize) };
    debug_assert_eq!(ret, 0, "release_region failed: errno={}", -ret);
}

/// `MADV_DONTNEED` on `[base, base+size)`.
pub fn advise_dont_need(base: NonNull<c_void>, size: u64) {
    let ret = unsafe { pagecarve__advise_dont_need(base.as_ptr(), size as usize) };
    debug_assert_eq!(ret, 0, "advise_dont_need failed: errno={}", -ret);
}

/// A raw host `mmap`, used when the allocator is configured to
/// forward calls to the system instead of servicing them from the
/// chunk (`Mode::Sys`/`PreferSys`).
pub fn host_mmap(size: u64) -> Result<NonNull<c_void>, i32> {
    let mut errno: i32 = 0;
    let ret = unsafe { pagecarve__host_mmap(size as usize, &mut errno) };
    NonNull::new(ret).ok_or(errno)
}

/// A raw host `munmap`.
pub fn host_munmap(base: NonNull<c_void>, size: u64) -> Result<(), i32> {
    let ret = unsafe { pagecarve__host_munmap(base.as_ptr(), size as usize) };
    if ret == 0 {
        Ok(())
    } else {
        Err(-ret)
    }
}

/// A raw host `mremap`.
pub fn host_mremap(
    base: NonNull<c_void>,
    old_size: u64,
    new_size: u64,
    may_move: bool,
) -> Result<NonNull<c_void>, i32> {
    let mut errno: i32 = 0;
    let ret = unsafe {
        pagecarve__host_mremap(
            base.as_ptr(),
            old_size as usize,
            new_size as usize,
            may_move as i32,
            &mut errno,
        )
    };
    NonNull::new(ret).ok_or(errno)
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size() & (page_size() - 1), 0, "page size is a power of 2");
}

#[test]
fn smoke_test() {
    let size = (page_size() as u64) * 4;
    let base = reserve_region(size).expect("reserve should succeed");
    advise_dont_need(base, size);
    release_region(base, size);
}
