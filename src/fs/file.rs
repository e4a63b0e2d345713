//! The system-wide open-file table (spec.md §6's `open`/`dup`/`close`
//! surface).
//!
//! Grounded on `original_source/src/fs/file.h`/`file.c`: a `File` there
//! is a refcounted object tagged `FD_PIPE`/`FD_INODE` living in a global
//! `ftable`, and each process's fd array holds pointers into it so that
//! `dup` and `fork` can share one object (and its read/write offset)
//! between two fds. This crate keeps the same shape with a plain index
//! instead of a pointer (spec.md §9): `Process::files` holds
//! `Option<usize>` slots into this table rather than `OpenFile` values.
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, Result};
use crate::kernel::KCtx;
use crate::lock::{RefCount, Spinlock};
use crate::param::{MAX_IO_BYTES, NFILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// An inode-cache slot this file object holds its own reference on.
    Inode(usize),
    /// A pipe-table slot; `true` means this end is the write end.
    Pipe(usize, bool),
}

struct FileSlot {
    kind: FileKind,
    readable: bool,
    writable: bool,
    rc: RefCount,
    offset: AtomicUsize,
}

/// The global open-file table. Guarded by one spinlock, same as the
/// original's `ftable.lock`; no call that can block (pipe I/O, inode
/// sleeplocks) runs while that spinlock is held, since each `FileSlot`'s
/// own fields (besides `rc`/`offset`, both lock-free atomics) are
/// immutable after `open`/`pipe` create it.
pub struct FileTable {
    used: Spinlock<[bool; NFILE]>,
    slots: [FileSlotCell; NFILE],
}

/// One table entry, only ever written once (at allocation) except for
/// the atomic `rc`/`offset` fields, so it needs no per-slot lock of its
/// own beyond the table's allocation bitmap.
struct FileSlotCell(core::cell::UnsafeCell<Option<FileSlot>>);

// SAFETY: a slot's `Some(..)` payload is written exactly once under
// `used`'s lock before any fd can observe it, and torn down (back to
// `None`) only after `rc` has reached zero with no other holder left.
unsafe impl Sync for FileSlotCell {}

impl FileTable {
    pub const fn new() -> Self {
        const EMPTY: FileSlotCell = FileSlotCell(core::cell::UnsafeCell::new(None));
        Self {
            used: Spinlock::new("ftable", [false; NFILE]),
            slots: [EMPTY; NFILE],
        }
    }

    fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> usize {
        let mut g = self.used.lock();
        let id = g.iter().position(|&u| !u).expect("file table exhausted");
        g[id] = true;
        // SAFETY: just claimed in `used`, no other caller can reach it
        // until this write completes.
        unsafe {
            *self.slots[id].0.get() = Some(FileSlot {
                kind,
                readable,
                writable,
                rc: RefCount::new(1),
                offset: AtomicUsize::new(0),
            });
        }
        id
    }

    pub fn open_inode(&self, inode_slot: usize, readable: bool, writable: bool) -> usize {
        self.alloc(FileKind::Inode(inode_slot), readable, writable)
    }

    pub fn open_pipe_ends(&self, pipe_id: usize) -> (usize, usize) {
        let read_fd = self.alloc(FileKind::Pipe(pipe_id, false), true, false);
        let write_fd = self.alloc(FileKind::Pipe(pipe_id, true), false, true);
        (read_fd, write_fd)
    }

    // SAFETY: caller holds a live reference (an fd or a just-allocated
    // slot) so the slot cannot be torn down concurrently.
    fn with<R>(&self, id: usize, f: impl FnOnce(&FileSlot) -> R) -> R {
        let slot = unsafe { (*self.slots[id].0.get()).as_ref() }.expect("file slot not open");
        f(slot)
    }

    /// spec.md §6, `dup`: shares the same object (and offset) rather
    /// than creating an independent copy.
    pub fn dup(&self, id: usize) -> usize {
        self.with(id, |s| s.rc.increment());
        id
    }

    pub fn readable(&self, id: usize) -> bool {
        self.with(id, |s| s.readable)
    }

    pub fn writable(&self, id: usize) -> bool {
        self.with(id, |s| s.writable)
    }

    /// spec.md §6, `close`: decrements the refcount; on last reference
    /// releases the underlying inode or marks the pipe end closed.
    pub fn close(&self, ctx: &KCtx<'_>, kernel: &crate::kernel::Kernel, id: usize) {
        let (kind, last) = self.with(id, |s| (s.kind, s.rc.decrement()));
        if last {
            match kind {
                FileKind::Inode(inode_slot) => {
                    let sb = kernel.fs.superblock();
                    let mut op = kernel.fs.log.begin_op(ctx);
                    kernel.fs.inodes.put(ctx, &mut op, &kernel.fs, kernel.disk, sb, inode_slot);
                    kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
                }
                FileKind::Pipe(pipe_id, writable) => kernel.pipes.close_end(ctx, pipe_id, writable),
            }
            let mut g = self.used.lock();
            // SAFETY: `rc` just reached zero and `used` is locked, so no
            // other caller can be mid-`with` on this slot.
            unsafe {
                *self.slots[id].0.get() = None;
            }
            g[id] = false;
        }
    }

    /// spec.md §6, `read`. Caps each call at `MAX_IO_BYTES` the same
    /// way `inode::write` is capped, so one syscall cannot dirty more
    /// blocks than a single grouped operation allows.
    pub fn read(&self, ctx: &KCtx<'_>, kernel: &crate::kernel::Kernel, id: usize, dst: &mut [u8]) -> Result<usize> {
        let (kind, readable, offset) = self.with(id, |s| (s.kind, s.readable, s.offset.load(Ordering::Relaxed)));
        if !readable {
            return Err(KernelError::InvalidArgument);
        }
        let dst = &mut dst[..dst.len().min(MAX_IO_BYTES)];
        match kind {
            FileKind::Inode(inode_slot) => {
                let sb = kernel.fs.superblock();
                let guard = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, inode_slot);
                let n = kernel.fs.inodes.read(ctx, kernel.disk, &kernel.fs.cache, kernel.console, &guard, dst, offset)?;
                drop(guard);
                self.with(id, |s| s.offset.fetch_add(n, Ordering::Relaxed));
                Ok(n)
            }
            FileKind::Pipe(pipe_id, _) => kernel.pipes.read(ctx, pipe_id, dst),
        }
    }

    /// spec.md §6, `write`.
    pub fn write(&self, ctx: &KCtx<'_>, kernel: &crate::kernel::Kernel, id: usize, src: &[u8]) -> Result<usize> {
        let (kind, writable, offset) = self.with(id, |s| (s.kind, s.writable, s.offset.load(Ordering::Relaxed)));
        if !writable {
            return Err(KernelError::InvalidArgument);
        }
        let src = &src[..src.len().min(MAX_IO_BYTES)];
        match kind {
            FileKind::Inode(inode_slot) => {
                let sb = kernel.fs.superblock();
                let mut op = kernel.fs.log.begin_op(ctx);
                let mut guard = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, inode_slot);
                let n = kernel.fs.inodes.write(ctx, &mut op, &kernel.fs, kernel.disk, sb, &mut guard, src, offset)?;
                drop(guard);
                kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
                self.with(id, |s| s.offset.fetch_add(n, Ordering::Relaxed));
                Ok(n)
            }
            FileKind::Pipe(pipe_id, _) => kernel.pipes.write(ctx, pipe_id, src),
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
