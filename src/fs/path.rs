//! Pathname resolution (spec.md §4.3's directory contract, walked one
//! `/`-separated component at a time).
//!
//! Grounded on `original_source/src/fs/fs.c`'s `namex`/`skipelem`: a
//! single walk shared by `namei` (resolve the whole path) and
//! `nameiparent` (resolve to the final component's parent directory
//! plus its name, for `create`/`unlink`-style callers). Every
//! intermediate directory is `get`'d then `put` back as the walk
//! descends past it, exactly as the original's `iget`/`iput` pairing
//! around each step.
use arrayvec::ArrayVec;

use crate::error::{KernelError, Result};
use crate::fs::log::OpContext;
use crate::fs::stat::InodeType;
use crate::fs::superblock::Superblock;
use crate::fs::FileSystem;
use crate::hal::BlockDevice;
use crate::kernel::KCtx;
use crate::param::{FILE_NAME_MAX_LENGTH, MAX_PATH};

/// Inode number of the filesystem root directory.
pub const ROOT_INODE: u32 = 1;

/// Splits the next non-empty `/`-delimited component off the front of
/// `path`, skipping any leading slashes (mirrors `skipelem`). Returns
/// `None` once nothing but slashes remain.
fn next_component(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() {
        return None;
    }
    let start = i;
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    Some((&path[start..i], &path[i..]))
}

/// Resolves every component of `path` but the last, returning the
/// parent directory's inode slot (reference held, caller must
/// eventually `put` it) and the final component's name. `path` starting
/// with `/` resolves from the root; otherwise from `cwd`.
fn walk(ctx: &KCtx<'_>, op: &mut OpContext, fs: &FileSystem, disk: &dyn BlockDevice, sb: Superblock, cwd: u32, path: &[u8]) -> Result<(usize, ArrayVec<u8, FILE_NAME_MAX_LENGTH>)> {
    if path.len() > MAX_PATH {
        return Err(KernelError::NameTooLong);
    }
    let start_ino = if path.first() == Some(&b'/') { ROOT_INODE } else { cwd };
    let mut cur = fs.inodes.get(start_ino);
    let mut rest = path;

    loop {
        let Some((name, next_rest)) = next_component(rest) else {
            return Ok((cur, ArrayVec::new()));
        };
        if name.len() > FILE_NAME_MAX_LENGTH {
            fs.inodes.put(ctx, op, fs, disk, sb, cur);
            return Err(KernelError::NameTooLong);
        }
        if next_component(next_rest).is_none() {
            let mut last = ArrayVec::new();
            last.try_extend_from_slice(name).expect("length checked above");
            return Ok((cur, last));
        }

        let dir = fs.inodes.lock(ctx, disk, &fs.cache, sb, cur);
        if dir.entry().ty != InodeType::Directory {
            drop(dir);
            fs.inodes.put(ctx, op, fs, disk, sb, cur);
            return Err(KernelError::NotADirectory);
        }
        let found = fs.inodes.lookup(ctx, disk, &fs.cache, &dir, name);
        drop(dir);

        let Some((inode_no, _)) = found else {
            fs.inodes.put(ctx, op, fs, disk, sb, cur);
            return Err(KernelError::NoSuchFile);
        };
        let next = fs.inodes.get(inode_no as u32);
        fs.inodes.put(ctx, op, fs, disk, sb, cur);
        cur = next;
        rest = next_rest;
    }
}

/// Resolves `path` to the inode it names (spec.md §4.3's directory
/// contract applied transitively). The returned slot holds a reference
/// the caller must eventually `put`.
pub fn namei(ctx: &KCtx<'_>, op: &mut OpContext, fs: &FileSystem, disk: &dyn BlockDevice, sb: Superblock, cwd: u32, path: &[u8]) -> Result<usize> {
    let (slot, name) = walk(ctx, op, fs, disk, sb, cwd, path)?;
    if name.is_empty() {
        return Ok(slot);
    }

    let dir = fs.inodes.lock(ctx, disk, &fs.cache, sb, slot);
    if dir.entry().ty != InodeType::Directory {
        drop(dir);
        fs.inodes.put(ctx, op, fs, disk, sb, slot);
        return Err(KernelError::NotADirectory);
    }
    let found = fs.inodes.lookup(ctx, disk, &fs.cache, &dir, &name);
    drop(dir);
    fs.inodes.put(ctx, op, fs, disk, sb, slot);

    match found {
        Some((inode_no, _)) => Ok(fs.inodes.get(inode_no as u32)),
        None => Err(KernelError::NoSuchFile),
    }
}

/// Resolves `path` to its final component's parent directory (spec.md
/// §4.3's directory contract; used by callers that then `insert`,
/// `remove`, or `alloc` a new inode themselves). Rejects a path whose
/// final component is empty (`"/"` or `""`) since there is nothing to
/// parent.
pub fn nameiparent(ctx: &KCtx<'_>, op: &mut OpContext, fs: &FileSystem, disk: &dyn BlockDevice, sb: Superblock, cwd: u32, path: &[u8]) -> Result<(usize, ArrayVec<u8, FILE_NAME_MAX_LENGTH>)> {
    let (slot, name) = walk(ctx, op, fs, disk, sb, cwd, path)?;
    if name.is_empty() {
        fs.inodes.put(ctx, op, fs, disk, sb, slot);
        return Err(KernelError::InvalidArgument);
    }
    Ok((slot, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Console;
    use crate::kernel::Kernel;
    use crate::proc::container::ROOT_CONTAINER;
    use crate::testutil::{FakeConsole, FakeDisk};

    fn format_disk(disk: &FakeDisk) -> Superblock {
        let sb = Superblock {
            num_blocks: 122,
            num_data_blocks: 64,
            num_inodes: crate::param::NINODE_DISK as u32,
            num_log_blocks: 31,
            log_start: 1,
            inode_start: 32,
            bitmap_start: 57,
            data_start: 58,
        };
        disk.write(0, &sb.to_bytes());
        sb
    }

    fn with_kernel<R>(f: impl FnOnce(&Kernel) -> R) -> R {
        let disk: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new(128)));
        let console: &'static FakeConsole = Box::leak(Box::new(FakeConsole::new()));
        format_disk(disk);
        let kernel = Kernel::new(disk as &'static dyn BlockDevice, console as &'static dyn Console, 1);
        kernel.init(16);
        f(&kernel)
    }

    /// Builds a root directory (forced to inode 1 by being the first
    /// allocation after mount) containing one file named `child_name`,
    /// returning that file's inode number.
    fn make_root_with_child(kernel: &Kernel, ctx: &KCtx<'_>, child_name: &[u8]) -> u32 {
        let sb = kernel.fs.superblock();
        let mut op = kernel.fs.log.begin_op(ctx);
        let root_no = kernel.fs.inodes.alloc(ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::Directory);
        assert_eq!(root_no, ROOT_INODE, "root directory must land on the well-known root inode number");
        let child_no = kernel.fs.inodes.alloc(ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);

        let root_slot = kernel.fs.inodes.get(root_no);
        let mut root_guard = kernel.fs.inodes.lock(ctx, kernel.disk, &kernel.fs.cache, sb, root_slot);
        kernel
            .fs
            .inodes
            .insert(ctx, &mut op, &kernel.fs, kernel.disk, sb, &mut root_guard, child_name, child_no as u16)
            .expect("insert into fresh root directory");
        drop(root_guard);
        kernel.fs.log.end_op(op, ctx, kernel.disk, &kernel.fs.cache);
        child_no
    }

    #[test]
    fn namei_resolves_an_absolute_path_to_the_child_inode() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            let child_no = make_root_with_child(kernel, &ctx, b"greeting");

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let slot = namei(&ctx, &mut op, &kernel.fs, kernel.disk, sb, ROOT_INODE, b"/greeting").expect("resolves");
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);

            let guard = kernel.fs.inodes.lock(&ctx, kernel.disk, &kernel.fs.cache, sb, slot);
            assert_eq!(guard.entry().ty, InodeType::File);
            let entry_inode_no = kernel.fs.inodes.get(child_no);
            assert_eq!(entry_inode_no, slot, "namei should land on the same cache slot as a direct get");
        });
    }

    #[test]
    fn namei_reports_no_such_file_for_a_missing_component() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            make_root_with_child(kernel, &ctx, b"greeting");

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let err = namei(&ctx, &mut op, &kernel.fs, kernel.disk, sb, ROOT_INODE, b"/missing").unwrap_err();
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);
            assert_eq!(err, KernelError::NoSuchFile);
        });
    }

    #[test]
    fn nameiparent_splits_the_final_component_from_its_directory() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            make_root_with_child(kernel, &ctx, b"greeting");

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let (dir_slot, name) = nameiparent(&ctx, &mut op, &kernel.fs, kernel.disk, sb, ROOT_INODE, b"/newfile").expect("resolves parent");
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);

            assert_eq!(&name[..], b"newfile");
            let root_slot = kernel.fs.inodes.get(ROOT_INODE);
            assert_eq!(dir_slot, root_slot);
        });
    }

    #[test]
    fn nameiparent_rejects_a_path_with_no_final_component() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            make_root_with_child(kernel, &ctx, b"greeting");

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let err = nameiparent(&ctx, &mut op, &kernel.fs, kernel.disk, sb, ROOT_INODE, b"/").unwrap_err();
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);
            assert_eq!(err, KernelError::InvalidArgument);
        });
    }
}
