//! Per-process address space: sections, the page-table association
//! list, page faults, `sbrk`, `copyout`, and fork's copy-on-write clone
//! (spec.md §4.4).
//!
//! Grounded on `original_source/src/kernel/paging.c` (`sbrk`,
//! `init_sections`, `pgfault`, `swapout`, `swapin`) and `kernel/pt.h`'s
//! `struct pgdir` (root table + lock + section list). The original's
//! page table is a three-level radix tree of physical pointers
//! (`pt.c`'s `get_pte`); per spec.md §9's "arena indices" note and the
//! out-of-scope MMU layer (spec.md §1, §6), this crate replaces the
//! radix walk with a flat, fixed-capacity `(virtual page, entry)`
//! association list — the "page directory lock" becomes one
//! [`crate::lock::Sleeplock`] guarding the whole address space, matching
//! spec.md §4.4's "under that section's sleeping lock" for `sbrk`.
use arrayvec::ArrayVec;

use crate::error::{KernelError, Result};
use crate::kernel::{KCtx, Kernel};
use crate::lock::Sleeplock;
use crate::mm::page::PageId;
use crate::param::{MAX_SECTIONS, PAGE_SIZE, PAGE_TABLE_CAPACITY};

/// spec.md §4.4: "sections (contiguous virtual-address ranges with
/// flags: HEAP, SWAP ..., RO, TEXT, DATA ...)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Heap,
    Ro,
    Text,
    Data,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    kind: SectionKind,
    /// Page-aligned base virtual address.
    base: usize,
    /// Length in pages.
    pages: usize,
    /// spec.md §4.4's SWAP flag: this section's pages currently live in
    /// the swap area rather than in any [`crate::mm::PageStore`] slot.
    swapped_out: bool,
}

impl Section {
    fn contains(&self, va: usize) -> bool {
        va >= self.base && va < self.base + self.pages * PAGE_SIZE
    }
}

/// One mapped virtual page (spec.md §4.4's PTE: "RO (copy-on-write)").
#[derive(Debug, Clone, Copy)]
struct Pte {
    page: PageId,
    writable: bool,
    cow: bool,
}

struct State {
    sections: ArrayVec<Section, MAX_SECTIONS>,
    /// Virtual page → mapping, present only while the owning section is
    /// not swapped out.
    ptes: ArrayVec<(usize, Pte), PAGE_TABLE_CAPACITY>,
    /// Virtual page → swap slot, present only while the owning section
    /// is swapped out (spec.md §4.4, "stores the slot index").
    swapped: ArrayVec<(usize, u32), PAGE_TABLE_CAPACITY>,
}

/// A process's page directory: "a root page table, a lock, and an
/// ordered list of sections" (spec.md §4.4).
pub struct AddressSpace {
    state: Sleeplock<State>,
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self {
            state: Sleeplock::new(
                "pgdir",
                State {
                    sections: ArrayVec::new_const(),
                    ptes: ArrayVec::new_const(),
                    swapped: ArrayVec::new_const(),
                },
            ),
        }
    }

    /// spec.md §4.4's `init_sections`: a fresh address space starts with
    /// one empty HEAP section at `base`.
    pub fn init_heap(&self, ctx: &KCtx<'_>, base: usize) {
        let mut g = self.state.lock(ctx);
        g.sections.push(Section {
            kind: SectionKind::Heap,
            base,
            pages: 0,
            swapped_out: false,
        });
    }

    /// Registers a non-heap section (TEXT/DATA/RO), e.g. while loading a
    /// program image. Page content is installed lazily through the
    /// fault handler the same way HEAP pages are.
    pub fn add_section(&self, ctx: &KCtx<'_>, kind: SectionKind, base: usize, pages: usize) {
        assert_ne!(kind, SectionKind::Heap, "add_section: use init_heap for the HEAP section");
        let mut g = self.state.lock(ctx);
        g.sections.push(Section {
            kind,
            base,
            pages,
            swapped_out: false,
        });
    }

    /// spec.md §4.4, `sbrk`: grows (`incr > 0`) or shrinks (`incr < 0`)
    /// the unique HEAP section. Returns the address of the break prior
    /// to the change, matching the original's return convention.
    pub fn sbrk(&self, ctx: &KCtx<'_>, kernel: &Kernel, incr: i64) -> Result<usize> {
        let mut g = self.state.lock(ctx);
        let idx = g
            .sections
            .iter()
            .position(|s| s.kind == SectionKind::Heap)
            .expect("address space has no HEAP section");
        let old_break = g.sections[idx].base + g.sections[idx].pages * PAGE_SIZE;

        if incr >= 0 {
            let grow_pages = incr as usize / PAGE_SIZE;
            g.sections[idx].pages += grow_pages;
        } else {
            let shrink_pages = ((-incr) as usize / PAGE_SIZE).min(g.sections[idx].pages);
            let base = g.sections[idx].base;
            let keep_pages = g.sections[idx].pages - shrink_pages;
            let cutoff = base + keep_pages * PAGE_SIZE;
            Self::unmap_range(&mut g, kernel, cutoff, old_break);
            g.sections[idx].pages = keep_pages;
        }
        Ok(old_break)
    }

    /// Drops every mapping (and swap slot) for virtual pages in
    /// `[from, to)`, returning freed pages to the allocator.
    fn unmap_range(g: &mut State, kernel: &Kernel, from: usize, to: usize) {
        let mut i = 0;
        while i < g.ptes.len() {
            let (va, pte) = g.ptes[i];
            if va >= from && va < to {
                if kernel.pageref.kderef(pte.page) {
                    kernel.page_alloc.free(pte.page);
                }
                g.ptes.remove(i);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < g.swapped.len() {
            let (va, slot) = g.swapped[i];
            if va >= from && va < to {
                kernel.swap.free_slot(slot);
                g.swapped.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Allocates a fresh, zeroed page and takes the initial reference on
    /// it (spec.md §4.4's page-fault handler: "allocate a fresh page,
    /// reference it").
    fn alloc_fresh_page(kernel: &Kernel) -> Option<PageId> {
        let page = kernel.page_alloc.alloc()?;
        kernel.pageref.kref(page);
        kernel.page_store.zero(page);
        Some(page)
    }

    fn swap_in_section(g: &mut State, kernel: &Kernel, idx: usize) {
        let sec = g.sections[idx];
        let mut i = 0;
        while i < g.swapped.len() {
            let (va, slot) = g.swapped[i];
            if sec.contains(va) {
                let page = kernel.page_alloc.alloc().expect("swap-in: physical memory exhausted");
                kernel.pageref.kref(page);
                let mut buf = [0u8; PAGE_SIZE];
                kernel.swap.read_page(kernel.disk, slot, &mut buf);
                kernel.page_store.write(page, &buf);
                kernel.swap.free_slot(slot);
                g.ptes.push((va, Pte { page, writable: true, cow: false }));
                g.swapped.remove(i);
            } else {
                i += 1;
            }
        }
        g.sections[idx].swapped_out = false;
    }

    /// spec.md §4.4, `swapout(section)`: writes every page of the named
    /// section to disk, releases its physical pages, and marks it SWAP.
    pub fn swap_out(&self, ctx: &KCtx<'_>, kernel: &Kernel, kind: SectionKind) -> Result<()> {
        let mut g = self.state.lock(ctx);
        let idx = g.sections.iter().position(|s| s.kind == kind).ok_or(KernelError::InvalidArgument)?;
        let sec = g.sections[idx];
        let mut i = 0;
        while i < g.ptes.len() {
            let (va, pte) = g.ptes[i];
            if sec.contains(va) {
                let slot = kernel.swap.alloc_slot().expect("swap area exhausted");
                let mut buf = [0u8; PAGE_SIZE];
                kernel.page_store.read(pte.page, &mut buf);
                kernel.swap.write_page(kernel.disk, slot, &buf);
                if kernel.pageref.kderef(pte.page) {
                    kernel.page_alloc.free(pte.page);
                }
                g.swapped.push((va, slot));
                g.ptes.remove(i);
            } else {
                i += 1;
            }
        }
        g.sections[idx].swapped_out = true;
        Ok(())
    }

    /// spec.md §4.4's page-fault handler. `fault_va` need not be
    /// page-aligned.
    pub fn page_fault(&self, ctx: &KCtx<'_>, kernel: &Kernel, fault_va: usize) -> Result<()> {
        let va = fault_va & !(PAGE_SIZE - 1);
        let mut g = self.state.lock(ctx);
        let idx = g.sections.iter().position(|s| s.contains(va)).ok_or(KernelError::InvalidArgument)?;

        if g.sections[idx].swapped_out {
            Self::swap_in_section(&mut g, kernel, idx);
        }

        match g.ptes.iter().position(|&(pva, _)| pva == va) {
            None => {
                let page = Self::alloc_fresh_page(kernel).ok_or(KernelError::InvalidArgument)?;
                g.ptes.push((va, Pte { page, writable: true, cow: false }));
            }
            Some(pos) => {
                let pte = g.ptes[pos].1;
                if pte.cow {
                    let new_page = Self::alloc_fresh_page(kernel).ok_or(KernelError::InvalidArgument)?;
                    kernel.page_store.copy(pte.page, new_page);
                    if kernel.pageref.kderef(pte.page) {
                        kernel.page_alloc.free(pte.page);
                    }
                    g.ptes[pos].1 = Pte { page: new_page, writable: true, cow: false };
                }
            }
        }
        Ok(())
    }

    /// Looks up the physical page backing `va`'s page, if mapped.
    fn lookup(&self, ctx: &KCtx<'_>, va: usize) -> Option<PageId> {
        let page_va = va & !(PAGE_SIZE - 1);
        self.state.lock(ctx).ptes.iter().find(|&&(pva, _)| pva == page_va).map(|&(_, pte)| pte.page)
    }

    /// spec.md §4.4, `copyout`: copies `src` into this address space
    /// starting at `dst_va`, allocating (or breaking COW on) destination
    /// pages lazily via the fault handler.
    pub fn copyout(&self, ctx: &KCtx<'_>, kernel: &Kernel, dst_va: usize, src: &[u8]) -> Result<()> {
        let mut va = dst_va;
        let mut remaining = src;
        while !remaining.is_empty() {
            let page_va = va & !(PAGE_SIZE - 1);
            let offset = va - page_va;
            let n = remaining.len().min(PAGE_SIZE - offset);

            self.page_fault(ctx, kernel, page_va)?;
            let page = self.lookup(ctx, page_va).expect("copyout: page_fault just installed this mapping");
            let mut buf = [0u8; PAGE_SIZE];
            kernel.page_store.read(page, &mut buf);
            buf[offset..offset + n].copy_from_slice(&remaining[..n]);
            kernel.page_store.write(page, &buf);

            remaining = &remaining[n..];
            va += n;
        }
        Ok(())
    }

    /// The inverse of [`Self::copyout`]: copies `dst.len()` bytes out of
    /// this address space starting at `src_va` into kernel memory, for
    /// syscall arguments a user program passes by pointer (spec.md §6's
    /// `read`/`write`/`execve`/`mknod` all take a path or buffer this
    /// way). Unlike `copyout`, an unmapped source page is never faulted
    /// in on the caller's behalf — it is simply not there to read —  so
    /// a miss reports [`KernelError::InvalidArgument`] (the EFAULT-
    /// equivalent row in spec.md §7's error table) instead of allocating.
    pub fn copy_in(&self, ctx: &KCtx<'_>, kernel: &Kernel, src_va: usize, dst: &mut [u8]) -> Result<()> {
        let mut va = src_va;
        let mut remaining = &mut dst[..];
        while !remaining.is_empty() {
            let page_va = va & !(PAGE_SIZE - 1);
            let offset = va - page_va;
            let n = remaining.len().min(PAGE_SIZE - offset);

            let page = self.lookup(ctx, page_va).ok_or(KernelError::InvalidArgument)?;
            let mut buf = [0u8; PAGE_SIZE];
            kernel.page_store.read(page, &mut buf);
            let (chunk, rest) = remaining.split_at_mut(n);
            chunk.copy_from_slice(&buf[offset..offset + n]);
            remaining = rest;

            va += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string out of this address space starting
    /// at `src_va`, for pathname arguments (spec.md §6). Rejects strings
    /// that do not terminate within `dst`'s capacity; the terminator
    /// itself is not included in the returned slice.
    pub fn copy_in_str<'b>(&self, ctx: &KCtx<'_>, kernel: &Kernel, src_va: usize, dst: &'b mut [u8]) -> Result<&'b [u8]> {
        for (i, slot) in dst.iter_mut().enumerate() {
            self.copy_in(ctx, kernel, src_va + i, core::slice::from_mut(slot))?;
            if *slot == 0 {
                return Ok(&dst[..i]);
            }
        }
        Err(KernelError::NameTooLong)
    }

    /// fork's copy-on-write clone (spec.md §8, scenario S6): every
    /// present mapping becomes read-only and COW-flagged in both the
    /// parent and the (freshly created, empty) `child`, sharing the
    /// underlying physical pages.
    pub fn cow_clone(&self, ctx: &KCtx<'_>, kernel: &Kernel, child: &AddressSpace) {
        let mut parent = self.state.lock(ctx);
        for (_, pte) in parent.ptes.iter_mut() {
            pte.writable = false;
            pte.cow = true;
            kernel.pageref.kref(pte.page);
        }
        let mut kid = child.state.lock(ctx);
        kid.sections = parent.sections.clone();
        kid.ptes = parent.ptes.clone();
        // A fresh child never inherits swapped-out sections directly;
        // the parent's pages it now shares are all resident (`ptes`
        // above only ever holds resident mappings).
        kid.swapped.clear();
    }

    /// Tears the address space down (spec.md §4.6, `exit`): releases
    /// every mapped page's reference and every reserved swap slot.
    pub fn destroy(&self, ctx: &KCtx<'_>, kernel: &Kernel) {
        let mut g = self.state.lock(ctx);
        for (_, pte) in g.ptes.drain(..) {
            if kernel.pageref.kderef(pte.page) {
                kernel.page_alloc.free(pte.page);
            }
        }
        for (_, slot) in g.swapped.drain(..) {
            kernel.swap.free_slot(slot);
        }
        g.sections.clear();
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BlockDevice, Console};
    use crate::kernel::Kernel;
    use crate::testutil::{FakeConsole, FakeDisk};

    fn with_kernel<R>(f: impl FnOnce(&Kernel, &KCtx<'_>) -> R) -> R {
        let disk: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new(28_000)));
        let console: &'static FakeConsole = Box::leak(Box::new(FakeConsole::new()));
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(disk as &'static dyn BlockDevice, console as &'static dyn Console, 1)));
        kernel.page_alloc.init(256);
        kernel.containers.init();
        let proc = kernel.procs.alloc_raw(crate::proc::container::ROOT_CONTAINER);
        kernel.sched.set_idle(0, proc);
        kernel.sched.context_in(&kernel.procs, 0, proc, 0);
        let ctx = kernel.ctx(0);
        f(kernel, &ctx)
    }

    #[test]
    fn page_fault_on_unmapped_heap_installs_a_fresh_page() {
        with_kernel(|kernel, ctx| {
            let space = AddressSpace::new();
            space.init_heap(ctx, 0x1000);
            space.sbrk(ctx, kernel, PAGE_SIZE as i64).unwrap();
            space.page_fault(ctx, kernel, 0x1000).unwrap();
            assert!(space.lookup(ctx, 0x1000).is_some());
        });
    }

    #[test]
    fn page_fault_outside_any_section_is_an_error() {
        with_kernel(|kernel, ctx| {
            let space = AddressSpace::new();
            space.init_heap(ctx, 0x1000);
            assert_eq!(space.page_fault(ctx, kernel, 0x9999_0000), Err(KernelError::InvalidArgument));
        });
    }

    #[test]
    fn sbrk_shrink_frees_pages_and_restores_refcount() {
        with_kernel(|kernel, ctx| {
            let space = AddressSpace::new();
            space.init_heap(ctx, 0x1000);
            space.sbrk(ctx, kernel, 2 * PAGE_SIZE as i64).unwrap();
            space.page_fault(ctx, kernel, 0x1000).unwrap();
            let page = space.lookup(ctx, 0x1000).unwrap();
            assert_eq!(kernel.pageref.get(page), 1);

            space.sbrk(ctx, kernel, -(PAGE_SIZE as i64)).unwrap();
            assert!(space.lookup(ctx, 0x1000).is_some());

            space.sbrk(ctx, kernel, -(PAGE_SIZE as i64)).unwrap();
            assert!(space.lookup(ctx, 0x1000).is_none());
            assert_eq!(kernel.pageref.get(page), 0);
        });
    }

    #[test]
    fn cow_fork_then_write_copies_the_page() {
        with_kernel(|kernel, ctx| {
            let parent = AddressSpace::new();
            parent.init_heap(ctx, 0x1000);
            parent.sbrk(ctx, kernel, PAGE_SIZE as i64).unwrap();
            parent.page_fault(ctx, kernel, 0x1000).unwrap();
            let original = parent.lookup(ctx, 0x1000).unwrap();
            kernel.page_store.write(original, &{
                let mut b = [0u8; PAGE_SIZE];
                b[0] = b'A';
                b
            });

            let child = AddressSpace::new();
            parent.cow_clone(ctx, kernel, &child);
            assert_eq!(kernel.pageref.get(original), 2);

            // Child writes: triggers COW, allocates a new page.
            child.page_fault(ctx, kernel, 0x1000).unwrap();
            let child_page = child.lookup(ctx, 0x1000).unwrap();
            assert_ne!(child_page, original);
            kernel.page_store.write(child_page, &{
                let mut b = [0u8; PAGE_SIZE];
                b[0] = b'B';
                b
            });

            // Parent still reads 'A'; refcount on the original page is
            // back down to 1 (spec.md §8, scenario S6).
            let mut buf = [0u8; PAGE_SIZE];
            kernel.page_store.read(original, &mut buf);
            assert_eq!(buf[0], b'A');
            assert_eq!(kernel.pageref.get(original), 1);

            kernel.page_store.read(child_page, &mut buf);
            assert_eq!(buf[0], b'B');
        });
    }

    #[test]
    fn swap_out_then_fault_swaps_back_in() {
        with_kernel(|kernel, ctx| {
            let space = AddressSpace::new();
            space.add_section(ctx, SectionKind::Text, 0x2000, 1);
            space.page_fault(ctx, kernel, 0x2000).unwrap();
            let before = space.lookup(ctx, 0x2000).unwrap();
            kernel.page_store.write(before, &{
                let mut b = [0u8; PAGE_SIZE];
                b[10] = 42;
                b
            });

            space.swap_out(ctx, kernel, SectionKind::Text).unwrap();
            assert!(space.lookup(ctx, 0x2000).is_none());

            space.page_fault(ctx, kernel, 0x2000).unwrap();
            let after = space.lookup(ctx, 0x2000).unwrap();
            let mut buf = [0u8; PAGE_SIZE];
            kernel.page_store.read(after, &mut buf);
            assert_eq!(buf[10], 42);
        });
    }

    #[test]
    fn destroy_releases_every_mapping() {
        with_kernel(|kernel, ctx| {
            let space = AddressSpace::new();
            space.init_heap(ctx, 0x1000);
            space.sbrk(ctx, kernel, PAGE_SIZE as i64).unwrap();
            space.page_fault(ctx, kernel, 0x1000).unwrap();
            let page = space.lookup(ctx, 0x1000).unwrap();
            let in_use_before = kernel.page_alloc.in_use();

            space.destroy(ctx, kernel);
            assert_eq!(kernel.pageref.get(page), 0);
            assert_eq!(kernel.page_alloc.in_use(), in_use_before - 1);
        });
    }
}
