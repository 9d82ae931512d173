/// Affine group-allocator runtime
///
/// Drop-in replacements for the standard allocation routines that route
/// selected request sizes into contiguous bump-allocated groups. Groups draw
/// chunks from a single reserved slab, chunks are reference counted and
/// recycled, and everything else is forwarded to the real libc allocator
/// resolved lazily through the dynamic linker.
///
/// Module layout:
///   - align  — integer address arithmetic (round up/down, alignment)
///   - slab   — the slab reservation, chunk carving, and the spare list
///   - heap   — per-group bump allocation, free, and chunk recycling
///   - boot   — scratch allocator for callocs made during symbol resolution
///   - oracle — the embedder-supplied size → group mapping
///   - api    — C ABI interposition entry points
///
/// The supported target programs are single-threaded; no locks are taken
/// anywhere on the allocation path.

#[macro_use]
mod helpers;

pub mod align;
pub mod boot;
pub mod heap;
pub mod oracle;
pub mod slab;

#[cfg(not(test))]
pub mod api;

pub use heap::GroupHeap;
pub use oracle::{get_group_id, set_group_oracle, GroupOracle};

// ── Tuning constants ─────────────────────────────────────────────────────────
// The test build shrinks everything so a whole slab fits in a few hundred
// kilobytes and objects pack without alignment padding.

#[cfg(not(test))]
mod tuning {
    pub const NUM_GROUPS: usize = 8;
    pub const MAX_SIZE: usize = 4096;
    pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;
    pub const SLAB_SIZE: usize = 16 * 1024 * 1024 * 1024;
    pub const DEFAULT_ALIGNMENT: usize = 8;
}


pub use tuning::{CHUNK_SIZE, DEFAULT_ALIGNMENT, MAX_SIZE, NUM_GROUPS, SLAB_SIZE};

/// Empty chunks held back for reuse before the OS is asked to reclaim pages.
/// 0 means never release.
pub const MAX_SPARE_CHUNKS: usize = 16;

#[cfg(feature = "stats")]
pub const PAGE_SIZE: usize = 4096;
