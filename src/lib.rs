//! A buddy-system page allocator over a single pre-reserved,
//! 32-bit-addressable chunk of virtual address space, with a C- and
//! Rust-callable surface.
//!
//! The crate keeps a single process-wide [`Allocator`], guarded by one
//! `Mutex`, rather than the finer-grained locking a general-purpose
//! slab allocator would want: every public entry point here already
//! does O(log n) bookkeeping work per call, so a single writer lock is
//! the simpler and, for this workload, no less scalable choice.
mod buddy;
mod cache;
mod chunk;
mod config;
mod error;
mod ids;
mod map;
mod mapper;
mod ops;
mod ordered_map;
mod page_table;
mod status;

use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

pub use config::{Mode, Options, DEFAULT_BLOCK_CACHE_PAGE_CAP, MAP_32BIT, MAP_FIXED};
pub use error::{last_error, Error};
pub use mapper::{default_mapper, Mapper};
pub use status::{AllocEntry, FreeBlockInfo, FreeEntry, Status};

use ops::Allocator;

lazy_static::lazy_static! {
    static ref ALLOCATOR: Mutex<Option<Allocator>> = Mutex::new(None);
}

/// Initializes the global allocator with default options and the host
/// mapper, per [`Options::default`].
pub fn init() -> Result<(), Error> {
    init_with(default_mapper(), Options::default())
}

/// Initializes the global allocator with explicit options and mapper.
/// Returns `Error::InvalidArgument` if it is already initialized --
/// call [`fini`] first to reconfigure.
pub fn init_with(mapper: &'static dyn Mapper, options: Options) -> Result<(), Error> {
    let mut guard = ALLOCATOR.lock().unwrap();
    if guard.is_some() {
        return error::fail(Error::InvalidArgument);
    }

    *guard = Some(Allocator::init_with(mapper, options)?);
    Ok(())
}

/// Tears down the global allocator, releasing its chunk back to the
/// host. A no-op if the allocator was never initialized.
pub fn fini() {
    *ALLOCATOR.lock().unwrap() = None;
}

fn with_allocator<T>(f: impl FnOnce(&mut Allocator) -> Result<T, Error>) -> Result<T, Error> {
    let mut guard = ALLOCATOR.lock().unwrap();
    match guard.as_mut() {
        Some(alloc) => f(alloc),
        None => error::fail(Error::EnvironmentFailure),
    }
}

/// Maps `len` bytes, serviced per the configured [`Mode`]. `addr` must
/// be null, `fd` must be `-1`, `flags` must contain [`MAP_32BIT`] and
/// must not contain [`MAP_FIXED`]; `prot` and `offset` are accepted
/// but not otherwise interpreted (every mapping is anonymous,
/// `PROT_READ | PROT_WRITE`).
pub fn map(
    addr: *mut c_void,
    len: u64,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<NonNull<c_void>, Error> {
    with_allocator(|alloc| alloc.map(addr, len, prot, flags, fd, offset))
}

/// Releases `[addr, addr+len)`. May be a partial (tail- or head-only)
/// release of a larger allocation; straddling the middle of a block is
/// rejected.
pub fn unmap(addr: NonNull<c_void>, len: u64) -> Result<(), Error> {
    with_allocator(|alloc| alloc.unmap(addr, len))
}

/// Resizes `addr` (previously `map`ped with `old_len` bytes) to
/// `new_len` bytes, growing in place when possible and relocating
/// (copying `old_len` bytes) only when `may_move` is set and in-place
/// growth is impossible.
pub fn remap(
    addr: NonNull<c_void>,
    old_len: u64,
    new_len: u64,
    may_move: bool,
) -> Result<NonNull<c_void>, Error> {
    with_allocator(|alloc| alloc.remap(addr, old_len, new_len, may_move))
}

/// Allocates `len` bytes directly from the chunk, bypassing `Mode`.
pub fn alloc(len: u64) -> Result<NonNull<c_void>, Error> {
    with_allocator(|alloc| alloc.alloc(len))
}

/// Releases a block previously returned by [`alloc`].
pub fn free(addr: NonNull<c_void>) -> Result<(), Error> {
    with_allocator(|alloc| alloc.free(addr))
}

/// A snapshot of the allocator's current bookkeeping.
pub fn get_status() -> Result<Status, Error> {
    with_allocator(|alloc| Ok(alloc.status()))
}

// --- C ABI -------------------------------------------------------------

/// Initializes the global allocator with default options.
///
/// Returns 0 on success, or a negative errno-like code from
/// [`Error::as_raw`] on failure.
#[no_mangle]
pub extern "C" fn pagecarve_init() -> i32 {
    match init() {
        Ok(()) => 0,
        Err(e) => -e.as_raw(),
    }
}

/// Tears down the global allocator.
#[no_mangle]
pub extern "C" fn pagecarve_fini() {
    fini();
}

/// Maps `len` bytes. Returns NULL on failure; see [`pagecarve_last_error`].
///
/// # Safety
///
/// `addr` must be null; this crate never supports fixed-address
/// placement.
#[no_mangle]
pub unsafe extern "C" fn pagecarve_map(
    addr: *mut c_void,
    len: u64,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> *mut c_void {
    map(addr, len, prot, flags, fd, offset)
        .map(NonNull::as_ptr)
        .unwrap_or(std::ptr::null_mut())
}

/// Releases `[addr, addr+len)`. Returns 0 on success, or a negative
/// errno-like code on failure.
///
/// # Safety
///
/// `addr` must be a pointer previously returned by `pagecarve_map` or
/// `pagecarve_alloc`, still live.
#[no_mangle]
pub unsafe extern "C" fn pagecarve_unmap(addr: *mut c_void, len: u64) -> i32 {
    let addr = match NonNull::new(addr) {
        Some(a) => a,
        None => return -Error::InvalidArgument.as_raw(),
    };
    match unmap(addr, len) {
        Ok(()) => 0,
        Err(e) => -e.as_raw(),
    }
}

/// Resizes `addr` from `old_len` to `new_len` bytes. Returns NULL on
/// failure.
///
/// # Safety
///
/// `addr` must be a pointer previously returned by `pagecarve_map` or
/// `pagecarve_alloc`, mapped with exactly `old_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn pagecarve_remap(
    addr: *mut c_void,
    old_len: u64,
    new_len: u64,
    may_move: i32,
) -> *mut c_void {
    let addr = match NonNull::new(addr) {
        Some(a) => a,
        None => return std::ptr::null_mut(),
    };
    remap(addr, old_len, new_len, may_move != 0)
        .map(NonNull::as_ptr)
        .unwrap_or(std::ptr::null_mut())
}

/// Allocates `len` bytes directly from the chunk. Returns NULL on
/// failure.
#[no_mangle]
pub extern "C" fn pagecarve_alloc(len: u64) -> *mut c_void {
    alloc(len).map(NonNull::as_ptr).unwrap_or(std::ptr::null_mut())
}

/// Releases a block previously returned by `pagecarve_alloc`. Returns
/// 0 on success, or a negative errno-like code on failure.
///
/// # Safety
///
/// `addr` must be a pointer previously returned by `pagecarve_alloc`,
/// still live.
#[no_mangle]
pub unsafe extern "C" fn pagecarve_free(addr: *mut c_void) -> i32 {
    let addr = match NonNull::new(addr) {
        Some(a) => a,
        None => return -Error::InvalidArgument.as_raw(),
    };
    match free(addr) {
        Ok(()) => 0,
        Err(e) => -e.as_raw(),
    }
}

/// Returns the process's most recently recorded error, or 0 if none
/// is on record.
#[no_mangle]
pub extern "C" fn pagecarve_last_error() -> i32 {
    last_error().map(|e| e.as_raw()).unwrap_or(0)
}
