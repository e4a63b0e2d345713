//! `read`/`write`/`open`/`close`/`dup`/`pipe`/`mknod`/`execve` (spec.md
//! §6), grounded on the teacher's `syscall/file.rs` `create()` helper
//! for `open`'s O_CREATE path and `mknod`, and on
//! `original_source/src/kernel/file.c`'s `fileread`/`filewrite` for the
//! fd-indirection shape.
use super::{argstr, Args};
use crate::error::{KernelError, Result};
use crate::fs::log::OpContext;
use crate::fs::path;
use crate::fs::stat::InodeType;
use crate::fs::superblock::Superblock;
use crate::hal::ElfLoader;
use crate::kernel::{KCtx, Kernel};
use crate::param::{MAX_IO_BYTES, MAX_PATH, USER_HEAP_BASE};
use crate::vm::AddressSpace;

const O_CREATE: u64 = 0x200;
const O_WRONLY: u64 = 0x1;
const O_RDWR: u64 = 0x2;

fn open_mode(flags: u64) -> (bool, bool) {
    if flags & O_RDWR != 0 {
        (true, true)
    } else if flags & O_WRONLY != 0 {
        (false, true)
    } else {
        (true, false)
    }
}

pub(super) fn sys_read(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let fd = a.0[0] as usize;
    let va = a.0[1] as usize;
    let n = (a.0[2] as usize).min(MAX_IO_BYTES);
    let file = kernel.procs.fd_file(me, fd).ok_or(KernelError::BadFd)?;

    let mut buf = [0u8; MAX_IO_BYTES];
    let nread = kernel.files.read(ctx, kernel, file, &mut buf[..n])?;

    let as_ptr = kernel.procs.addrspace_ptr(me);
    // SAFETY: `me` is the process currently running on this cpu.
    unsafe { (*as_ptr).copyout(ctx, kernel, va, &buf[..nread]) }?;
    Ok(nread as i64)
}

pub(super) fn sys_write(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let fd = a.0[0] as usize;
    let va = a.0[1] as usize;
    let n = (a.0[2] as usize).min(MAX_IO_BYTES);
    let file = kernel.procs.fd_file(me, fd).ok_or(KernelError::BadFd)?;

    let mut buf = [0u8; MAX_IO_BYTES];
    let as_ptr = kernel.procs.addrspace_ptr(me);
    // SAFETY: `me` is the process currently running on this cpu.
    unsafe { (*as_ptr).copy_in(ctx, kernel, va, &mut buf[..n]) }?;
    let nwritten = kernel.files.write(ctx, kernel, file, &buf[..n])?;
    Ok(nwritten as i64)
}

pub(super) fn sys_close(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let fd = a.0[0] as usize;
    let file = kernel.procs.take_fd(me, fd).ok_or(KernelError::BadFd)?;
    kernel.files.close(ctx, kernel, file);
    Ok(0)
}

pub(super) fn sys_dup(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let fd = a.0[0] as usize;
    let file = kernel.procs.fd_file(me, fd).ok_or(KernelError::BadFd)?;
    let dup = kernel.files.dup(file);
    match kernel.procs.alloc_fd(me, dup) {
        Some(new_fd) => Ok(new_fd as i64),
        None => {
            kernel.files.close(ctx, kernel, dup);
            Err(KernelError::BadFd)
        }
    }
}

pub(super) fn sys_pipe(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let fdarray_va = a.0[0] as usize;
    let pipe_id = kernel.pipes.alloc();
    let (read_file, write_file) = kernel.files.open_pipe_ends(pipe_id);

    let read_fd = kernel.procs.alloc_fd(me, read_file).ok_or(KernelError::BadFd)?;
    let write_fd = match kernel.procs.alloc_fd(me, write_file) {
        Some(fd) => fd,
        None => {
            kernel.files.close(ctx, kernel, read_file);
            kernel.files.close(ctx, kernel, write_file);
            return Err(KernelError::BadFd);
        }
    };

    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&(read_fd as i32).to_le_bytes());
    buf[4..8].copy_from_slice(&(write_fd as i32).to_le_bytes());
    let as_ptr = kernel.procs.addrspace_ptr(me);
    // SAFETY: `me` is the process currently running on this cpu.
    unsafe { (*as_ptr).copyout(ctx, kernel, fdarray_va, &buf) }?;
    Ok(0)
}

pub(super) fn sys_open(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let mut path_buf = [0u8; MAX_PATH];
    let len = argstr(kernel, ctx, me, a.0[0], &mut path_buf)?;
    let path_bytes = &path_buf[..len];
    let flags = a.0[1];
    let (readable, writable) = open_mode(flags);
    let cwd = kernel.procs.cwd(me);

    let mut op = kernel.fs.log.begin_op(ctx);
    let sb = kernel.fs.superblock();
    let opened = if flags & O_CREATE != 0 {
        create_file(kernel, ctx, &mut op, sb, cwd, path_bytes)
    } else {
        path::namei(ctx, &mut op, &kernel.fs, kernel.disk, sb, cwd, path_bytes)
    };
    kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
    let inode_slot = opened?;

    let file = kernel.files.open_inode(inode_slot, readable, writable);
    match kernel.procs.alloc_fd(me, file) {
        Some(fd) => Ok(fd as i64),
        None => {
            kernel.files.close(ctx, kernel, file);
            Err(KernelError::BadFd)
        }
    }
}

/// `open`'s `O_CREATE` path: reuses an existing entry under that name if
/// one exists, otherwise allocates and links a fresh regular-file
/// inode. Narrowed to [`InodeType::File`] — `mknod` is the only other
/// entry-creating syscall, and it builds `InodeType::Device` nodes
/// itself, so there is no shared three-way branch to factor out.
fn create_file(kernel: &Kernel, ctx: &KCtx<'_>, op: &mut OpContext, sb: Superblock, cwd: u32, path_bytes: &[u8]) -> Result<usize> {
    let (dir_slot, name) = path::nameiparent(ctx, op, &kernel.fs, kernel.disk, sb, cwd, path_bytes)?;
    let mut dir = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, dir_slot);
    if dir.entry().ty != InodeType::Directory {
        drop(dir);
        kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, dir_slot);
        return Err(KernelError::NotADirectory);
    }
    if let Some((existing, _)) = kernel.fs.inodes.lookup(ctx, kernel.disk, &kernel.fs.cache, &dir, &name[..]) {
        drop(dir);
        kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, dir_slot);
        return Ok(kernel.fs.inodes.get(existing as u32));
    }

    let inode_no = kernel.fs.inodes.alloc(ctx, op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);
    let slot = kernel.fs.inodes.get(inode_no);
    {
        let mut g = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, slot);
        g.entry_mut().nlink = 1;
        kernel.fs.inodes.sync(ctx, op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, &g);
    }
    kernel
        .fs
        .inodes
        .insert(ctx, op, &kernel.fs, kernel.disk, sb, &mut dir, &name[..], inode_no as u16)
        .expect("name just confirmed absent under the directory's own lock");
    drop(dir);
    kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, dir_slot);
    Ok(slot)
}

pub(super) fn sys_mknod(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let mut path_buf = [0u8; MAX_PATH];
    let len = argstr(kernel, ctx, me, a.0[0], &mut path_buf)?;
    let path_bytes = &path_buf[..len];
    let major = a.0[1] as u16;
    let minor = a.0[2] as u16;
    let cwd = kernel.procs.cwd(me);

    let mut op = kernel.fs.log.begin_op(ctx);
    let sb = kernel.fs.superblock();
    let result = mknod_entry(kernel, ctx, &mut op, sb, cwd, path_bytes, major, minor);
    kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
    result.map(|_| 0)
}

fn mknod_entry(kernel: &Kernel, ctx: &KCtx<'_>, op: &mut OpContext, sb: Superblock, cwd: u32, path_bytes: &[u8], major: u16, minor: u16) -> Result<()> {
    let (dir_slot, name) = path::nameiparent(ctx, op, &kernel.fs, kernel.disk, sb, cwd, path_bytes)?;
    let mut dir = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, dir_slot);
    if dir.entry().ty != InodeType::Directory {
        drop(dir);
        kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, dir_slot);
        return Err(KernelError::NotADirectory);
    }

    let inode_no = kernel.fs.inodes.alloc(ctx, op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::Device);
    let slot = kernel.fs.inodes.get(inode_no);
    {
        let mut g = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, slot);
        g.entry_mut().major = major;
        g.entry_mut().minor = minor;
        g.entry_mut().nlink = 1;
        kernel.fs.inodes.sync(ctx, op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, &g);
    }

    let inserted = kernel.fs.inodes.insert(ctx, op, &kernel.fs, kernel.disk, sb, &mut dir, &name[..], inode_no as u16);
    drop(dir);
    kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, dir_slot);
    if inserted.is_err() {
        kernel.fs.inodes.put(ctx, op, &kernel.fs, kernel.disk, sb, slot);
    }
    inserted
}

/// spec.md §6, `execve`: builds a fresh address space via the
/// out-of-scope [`ElfLoader`] and, only on success, swaps it in for the
/// caller's current one (spec.md §7, "Bad ELF" — a failed load must
/// never touch the process being exec'd into, so nothing is installed
/// until `elf.load` has already returned a valid entry point and stack).
pub(super) fn sys_exec(kernel: &Kernel, ctx: &KCtx<'_>, elf: &dyn ElfLoader, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let mut path_buf = [0u8; MAX_PATH];
    let len = argstr(kernel, ctx, me, a.0[0], &mut path_buf)?;
    let path_bytes = &path_buf[..len];

    let scratch = AddressSpace::new();
    scratch.init_heap(ctx, USER_HEAP_BASE);
    let (entry, sp) = elf.load(path_bytes, &scratch).map_err(|_| KernelError::NoSuchFile)?;

    kernel.procs.install_address_space(ctx, kernel, me, scratch, entry, sp);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BlockDevice, Console};
    use crate::kernel::Kernel;
    use crate::param::{NINODE_DISK, PAGE_SIZE, USER_HEAP_BASE};
    use crate::proc::container::ROOT_CONTAINER;
    use crate::testutil::{FakeConsole, FakeDisk};

    fn format_disk(disk: &FakeDisk) {
        let sb = Superblock {
            num_blocks: 122,
            num_data_blocks: 64,
            num_inodes: NINODE_DISK as u32,
            num_log_blocks: 31,
            log_start: 1,
            inode_start: 32,
            bitmap_start: 57,
            data_start: 58,
        };
        disk.write(0, &sb.to_bytes());
    }

    fn with_kernel<R>(f: impl FnOnce(&Kernel, &KCtx<'_>, usize) -> R) -> R {
        let disk: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new(128)));
        let console: &'static FakeConsole = Box::leak(Box::new(FakeConsole::new()));
        format_disk(disk);
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(disk as &'static dyn BlockDevice, console as &'static dyn Console, 1)));
        kernel.init(16);
        let me = kernel.procs.alloc_raw(ROOT_CONTAINER);
        kernel.sched.set_idle(0, me);
        kernel.sched.context_in(&kernel.procs, 0, me, 0);
        kernel.procs.with(me, |p| p.addrspace.init_heap(&kernel.ctx(0), USER_HEAP_BASE));
        let ctx = kernel.ctx(0);
        kernel
            .procs
            .with(me, |p| p.addrspace.sbrk(&ctx, kernel, 4 * PAGE_SIZE as i64))
            .expect("room for path/data/read-back scratch pages");
        f(kernel, &ctx, me)
    }

    fn put_bytes(kernel: &Kernel, ctx: &KCtx<'_>, me: usize, va: usize, bytes: &[u8]) {
        kernel.procs.with(me, |p| p.addrspace.copyout(ctx, kernel, va, bytes)).unwrap();
    }

    /// spec.md §8 scenario S4, "create-write-read file": `open(O_CREATE)`,
    /// write `"hello\n"`, close, reopen, read. Exercises the syscall
    /// layer directly (`sys_open`/`sys_write`/`sys_close`/`sys_read`)
    /// rather than through a real `execve`, since this crate has no ELF
    /// loader of its own (spec.md §1).
    #[test]
    fn create_write_close_reopen_read_round_trips_file_contents() {
        with_kernel(|kernel, ctx, me| {
            let path_va = USER_HEAP_BASE;
            let data_va = USER_HEAP_BASE + PAGE_SIZE;
            let read_va = USER_HEAP_BASE + 2 * PAGE_SIZE;

            let path_bytes = b"/foo\0";
            put_bytes(kernel, ctx, me, path_va, path_bytes);

            let fd = sys_open(kernel, ctx, Args([path_va as u64, O_CREATE | O_WRONLY, 0, 0, 0, 0])).expect("create");
            assert!(fd >= 0);

            let data = b"hello\n";
            put_bytes(kernel, ctx, me, data_va, data);
            let nwritten = sys_write(kernel, ctx, Args([fd as u64, data_va as u64, data.len() as u64, 0, 0, 0])).expect("write");
            assert_eq!(nwritten, data.len() as i64);

            sys_close(kernel, ctx, Args([fd as u64, 0, 0, 0, 0, 0])).expect("close");

            let fd2 = sys_open(kernel, ctx, Args([path_va as u64, 0, 0, 0, 0, 0])).expect("reopen");

            let mut read_buf = [0u8; 8];
            let nread = sys_read(kernel, ctx, Args([fd2 as u64, read_va as u64, read_buf.len() as u64, 0, 0, 0])).expect("read");
            assert_eq!(nread, data.len() as i64);
            kernel
                .procs
                .with(me, |p| p.addrspace.copy_in(ctx, kernel, read_va, &mut read_buf[..nread as usize]))
                .unwrap();
            assert_eq!(&read_buf[..nread as usize], data);

            sys_close(kernel, ctx, Args([fd2 as u64, 0, 0, 0, 0, 0])).expect("close reopened fd");

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(ctx);
            let inode_slot = path::namei(ctx, &mut op, &kernel.fs, kernel.disk, sb, kernel.procs.cwd(me), b"/foo").expect("resolves");
            kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
            let guard = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, inode_slot);
            assert_eq!(guard.entry().size, data.len() as u32);
            assert_eq!(guard.entry().nlink, 1);
        });
    }
}
