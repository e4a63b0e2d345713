//! Interfaces the core consumes from components explicitly out of scope
//! (spec.md §1, §6): the SD-card block driver, UART console I/O, the
//! page-table/MMU primitives, ELF loading, syscall entry demux, and the
//! TTY line editor. Only the signatures the core calls are named here;
//! no driver lives in this crate.

use crate::param::{BLOCK_SIZE, PAGE_SIZE};
use crate::vm::AddressSpace;

/// One `BLOCK_SIZE`-byte sector transfer, as consumed by [`crate::fs`].
///
/// "Must be atomic per sector and durable on return" (spec.md §6):
/// implementations are synchronous and may not reorder writes to
/// different block numbers relative to the order they were issued.
pub trait BlockDevice: Sync {
    fn read(&self, block_no: u32, buf: &mut [u8; BLOCK_SIZE]);
    fn write(&self, block_no: u32, buf: &[u8; BLOCK_SIZE]);
}

/// The UART console, reduced to the one primitive the kernel core needs:
/// emitting bytes for `print!`/`println!`. Line editing and input are the
/// TTY layer's job and stay out of scope.
pub trait Console: Sync {
    fn put_byte(&self, b: u8);
}

/// Opaque handle to a page-table entry, manipulated only through the
/// (out-of-scope) MMU primitives layer. `vm` treats this as a capability
/// it can query and install but never decodes directly.
pub trait PageTableHal {
    /// Physical address type used by the MMU primitives.
    type PhysAddr: Copy + Eq;

    /// Looks up the mapping for a virtual page, if any.
    fn walk(&self, va: usize) -> Option<PteView<Self::PhysAddr>>;

    /// Installs or overwrites a mapping for a virtual page.
    fn map(&mut self, va: usize, pa: Self::PhysAddr, writable: bool, user: bool);

    /// Removes a mapping, if present.
    fn unmap(&mut self, va: usize);
}

/// The ELF program loader (spec.md §6's `execve` surface). `syscall`
/// calls this to populate a scratch [`AddressSpace`] before installing
/// it; nothing about ELF section parsing or relocation is implemented
/// in this crate (spec.md §1 — `original_source/src/kernel/exec.c`'s
/// `sys_exec` is itself an unimplemented stub, so there is no reference
/// behavior to port beyond the contract this trait names).
pub trait ElfLoader: Sync {
    /// Loads the program named by `path` into `target`, registering its
    /// TEXT/DATA/RO sections. Returns `(entry_pc, initial_sp)` on
    /// success. On error, `target` may be partially populated; the
    /// caller must discard it rather than install it (spec.md §7, "Bad
    /// ELF": the process being exec'd into keeps its old image).
    fn load(&self, path: &[u8], target: &AddressSpace) -> Result<(u64, u64), ()>;
}

/// A read-only snapshot of a page-table entry, as returned by
/// [`PageTableHal::walk`].
#[derive(Debug, Clone, Copy)]
pub struct PteView<P> {
    pub pa: P,
    pub valid: bool,
    pub writable: bool,
    pub cow: bool,
    /// Set when the PTE has been repurposed to hold a swap-slot index
    /// instead of a physical address (spec.md §4.4, "Swap").
    pub swapped: Option<u32>,
}
