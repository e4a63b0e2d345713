//! Address spaces & paging (spec.md §4.4, C5): per-process sections and
//! page tables, the page-fault handler, `sbrk`, `copyout`, swap, and
//! fork's copy-on-write clone.
//!
//! Grounded primarily on `original_source/src/kernel/paging.c` (the
//! teacher's own `vm.rs` models a pointer-based xv6 page table with no
//! COW or swap, so the section/fault/swap semantics here follow the
//! original instead, re-expressed in this crate's arena-indices idiom —
//! see [`addrspace`]'s module docs).
pub mod addrspace;
pub mod pageref;
pub mod swap;

pub use addrspace::{AddressSpace, SectionKind};
pub use pageref::PageRefTable;
pub use swap::SwapArea;
