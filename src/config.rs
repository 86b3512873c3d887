//! Operating modes and init-time configuration.
//!
//! There is no environment-variable parsing here: callers build an
//! `Options` value directly and pass it to [`crate::init_with`].

/// Selects how `map`/`unmap` are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every `map`/`unmap` is serviced from the chunk; an out-of-chunk
    /// `unmap` fails instead of falling back to the host.
    User,
    /// Every call is forwarded to the host.
    Sys,
    /// Try the user-mode path first; fall through to the host on
    /// failure.
    PreferUser,
    /// Try the host first; fall through to the user-mode path on
    /// failure.
    PreferSys,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::User
    }
}

/// `map`'s `flags` must contain this bit: every mapping this crate
/// hands out is expected to fit in 32 bits, so callers opt in
/// explicitly rather than by omission.
pub const MAP_32BIT: i32 = 1 << 0;

/// `map`'s `flags` must NOT contain this bit. Fixed-address placement
/// would let a caller dictate where inside the chunk a block lands,
/// which the buddy core's address-ordered first-fit doesn't support.
pub const MAP_FIXED: i32 = 1 << 1;

/// Default block-cache capacity, in pages, when the cache is enabled.
///
pub const DEFAULT_BLOCK_CACHE_PAGE_CAP: u32 = 512;

/// Options accepted by `init_with`, set once for the lifetime of an
/// `Allocator`.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,

    /// For debugging/testing: force the chunk to be exactly this many
    /// pages. `None` means "take whatever the host reservation
    /// yields."
    pub debug_page_num: Option<u32>,

    /// Whether the block cache defers `MADV_DONTNEED` on recently
    /// freed blocks. Disabled by default.
    pub enable_block_cache: bool,

    /// Threshold, in pages, above which the block cache starts
    /// evicting its oldest entries.
    pub block_cache_page_cap: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mode: Mode::default(),
            debug_page_num: None,
            enable_block_cache: false,
            block_cache_page_cap: DEFAULT_BLOCK_CACHE_PAGE_CAP,
        }
    }
}
