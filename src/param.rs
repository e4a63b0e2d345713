//! Tuning knobs shared across the kernel core.
//!
//! Mirrors the teacher's `param.rs`: a flat module of `pub const`s rather
//! than a runtime-parsed configuration, since every one of these bounds a
//! fixed-size on-disk or in-memory structure and must be known at compile
//! time.

/// Bytes per disk block / block-cache entry.
pub const BLOCK_SIZE: usize = 512;

/// Maximum number of blocks touched by a single grouped atomic operation.
pub const OP_MAX_NUM_BLOCKS: usize = 10;

/// Max data blocks in the on-disk log (write-ahead log capacity).
pub const LOG_MAX_SIZE: usize = OP_MAX_NUM_BLOCKS * 3;

/// Block cache entries kept cached before eviction is attempted.
pub const EVICTION_THRESHOLD: usize = OP_MAX_NUM_BLOCKS * 3;

/// Hard cap on live block-cache slots. Must exceed `EVICTION_THRESHOLD`:
/// `acquire` is allowed to grow the cache past the threshold when every
/// cached block is pinned or acquired (spec.md §4.2).
pub const BLOCK_CACHE_CAPACITY: usize = EVICTION_THRESHOLD * 2;

/// Maximum number of processes system-wide.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Maximum number of nested containers (including the root container and
/// the idle container).
pub const NCONTAINER: usize = 16;

/// Maximum number of active i-nodes cached in memory.
pub const NINODE: usize = 50;

/// Maximum on-disk inodes.
pub const NINODE_DISK: usize = 200;

/// Number of direct block pointers per inode.
pub const INODE_NUM_DIRECT: usize = 12;

/// Number of 32-bit block numbers that fit in one indirect block.
pub const INODE_NUM_INDIRECT: usize = BLOCK_SIZE / core::mem::size_of::<u32>();

/// Largest file size representable with direct + single-indirect blocks.
pub const INODE_MAX_BYTES: usize = (INODE_NUM_DIRECT + INODE_NUM_INDIRECT) * BLOCK_SIZE;

/// Size in bytes of one packed on-disk `InodeEntry`.
pub const INODE_ENTRY_SIZE: usize = 64;

/// On-disk inode entries packed per block.
pub const INODE_PER_BLOCK: usize = BLOCK_SIZE / INODE_ENTRY_SIZE;

/// Maximum file name length in a directory entry.
pub const FILE_NAME_MAX_LENGTH: usize = 28;

/// Maximum file path length accepted by path resolution.
pub const MAX_PATH: usize = 128;

/// Per-call cap on `read`/`write`, in bytes. spec.md §9 flags that
/// `fileread`/`filewrite` lack a bound on `n` in the original and
/// recommends a per-call cap "to prevent single ops from exceeding the
/// log budget"; this is sized so one call's worth of dirtied blocks
/// cannot exceed `OP_MAX_NUM_BLOCKS`.
pub const MAX_IO_BYTES: usize = OP_MAX_NUM_BLOCKS * BLOCK_SIZE / 2;

/// Device major number that the console is attached to (spec.md §4.3).
pub const CONSOLE_MAJOR: u16 = 1;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Physical page size, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Consecutive blocks that make up one swapped-out page.
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

/// First block of the reserved swap region (inclusive).
pub const SWAP_START: u32 = 20_000;

/// Last block of the reserved swap region (exclusive).
pub const SWAP_END: u32 = 28_000;

/// Number of page-sized swap slots available between `SWAP_START` and
/// `SWAP_END`.
pub const SWAP_SLOTS: usize = (SWAP_END - SWAP_START) as usize / BLOCKS_PER_PAGE;

/// Per-CPU preemption tick period target, for documentation purposes only
/// (the timer itself lives in the boot/HAL layer that is out of scope).
pub const TICK_MS: u64 = 1;

/// Maximum number of virtual-address-range sections per address space
/// (spec.md §4.4: HEAP, SWAP, RO, TEXT, DATA). Sized generously beyond
/// the handful a typical user program needs (text, data, heap, stack).
pub const MAX_SECTIONS: usize = 8;

/// Maximum number of distinct virtual pages one address space can have
/// mapped at once (spec.md §9's "arena indices" note applied to the page
/// table: a fixed-capacity association list rather than a multi-level
/// page-table walk).
pub const PAGE_TABLE_CAPACITY: usize = 512;

/// Virtual address a fresh process's HEAP section starts growing from.
/// Picked low enough to leave room below it for TEXT/RO/DATA sections
/// loaded by the (out-of-scope) program loader.
pub const USER_HEAP_BASE: usize = 0x1000_0000;

/// System-wide open-file objects (spec.md §6: `open`/`pipe` hand back an
/// fd that indexes into the calling process's table, but `dup`/`fork`
/// need two fds to share one underlying object and its offset, so the
/// object itself lives in a global table, same shape as `NOFILE` is to
/// `Process`).
pub const NFILE: usize = 128;

/// System-wide pipes. Unlike files, pipes are never returned to a free
/// list (see `fs::pipe` module docs), so this bounds how many a system
/// can ever create across its lifetime between reboots.
pub const NPIPE: usize = 16;

/// Bytes buffered in one pipe before a writer blocks.
pub const PIPE_SIZE: usize = 512;
