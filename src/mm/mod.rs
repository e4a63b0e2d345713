//! Physical memory management (spec.md §2, C2): a page freelist plus
//! fixed-capacity, size-classed object pools ("slab caches") used to back
//! the process table, inode cache, and block cache. Grounded on the
//! teacher's `kalloc.rs` and `pool.rs`/`arena/array_arena.rs`, simplified
//! per spec.md §9's "arena indices" guidance: callers get back a `usize`
//! slot index into a fixed array rather than a pinned/branded smart
//! pointer.

pub mod page;
pub mod slab;

pub use page::{PageAllocator, PageStore};
pub use slab::Pool;
