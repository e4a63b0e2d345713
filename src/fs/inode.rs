//! In-memory inode cache, directory operations (spec.md §4.3).
//!
//! Grounded on `original_source/src/fs/fs.c`'s `inode_get`/`inode_lock`/
//! `inode_put`/`dirlookup`, with the same LRU/index co-ownership
//! simplification `fs::block` uses (spec.md §9, "arena indices"): slots
//! are plain array indices, the LRU order and the inode-number index
//! are both `ArrayVec`s over those indices.
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, Result};
use crate::fs::block::BlockCache;
use crate::fs::log::{Log, OpContext};
use crate::fs::stat::{DirEntry, InodeEntry, InodeType, DIR_ENTRY_SIZE};
use crate::fs::superblock::Superblock;
use crate::hal::{BlockDevice, Console};
use crate::kernel::KCtx;
use crate::lock::refcount::RefCount;
use crate::lock::sleeplock::{Sleeplock, SleeplockGuard};
use crate::lock::Spinlock;
use crate::param::{BLOCK_SIZE, CONSOLE_MAJOR, INODE_ENTRY_SIZE, INODE_MAX_BYTES, INODE_NUM_DIRECT, INODE_NUM_INDIRECT, INODE_PER_BLOCK, NINODE, NINODE_DISK};

struct InodeState {
    valid: bool,
    entry: InodeEntry,
}

struct InodeSlot {
    inode_no: AtomicU32,
    rc: RefCount,
    inner: Sleeplock<InodeState>,
}

impl InodeSlot {
    const fn new() -> Self {
        Self {
            inode_no: AtomicU32::new(0),
            rc: RefCount::new(0),
            inner: Sleeplock::new(
                "inode",
                InodeState {
                    valid: false,
                    entry: InodeEntry {
                        ty: InodeType::Invalid,
                        major: 0,
                        minor: 0,
                        nlink: 0,
                        size: 0,
                        direct: [0; INODE_NUM_DIRECT],
                        indirect: 0,
                    },
                },
            ),
        }
    }
}

struct CacheState {
    index: ArrayVec<(u32, usize), NINODE>,
    lru: ArrayVec<usize, NINODE>,
    free: ArrayVec<usize, NINODE>,
}

/// The in-memory inode cache plus the on-disk free-inode list (spec.md
/// §4.3, "At init...").
pub struct InodeTable {
    state: Spinlock<CacheState>,
    slots: [InodeSlot; NINODE],
    disk_free: Spinlock<ArrayVec<u32, NINODE_DISK>>,
}

fn inode_location(sb: &Superblock, inode_no: u32) -> (u32, usize) {
    let block = sb.inode_start + inode_no / INODE_PER_BLOCK as u32;
    let off = (inode_no as usize % INODE_PER_BLOCK) * INODE_ENTRY_SIZE;
    (block, off)
}

impl InodeTable {
    pub const fn new() -> Self {
        const S: InodeSlot = InodeSlot::new();
        Self {
            state: Spinlock::new(
                "itable",
                CacheState {
                    index: ArrayVec::new_const(),
                    lru: ArrayVec::new_const(),
                    free: ArrayVec::new_const(),
                },
            ),
            slots: [S; NINODE],
            disk_free: Spinlock::new("ifree", ArrayVec::new_const()),
        }
    }

    /// Scans every on-disk inode slot: INVALID ones go on the free
    /// list, valid ones are pre-loaded into the cache (spec.md §4.3).
    pub fn init(&self, disk: &dyn BlockDevice, sb: Superblock) {
        {
            let mut g = self.state.lock();
            g.index.clear();
            g.lru.clear();
            g.free.clear();
            for i in (0..NINODE).rev() {
                g.free.push(i);
            }
        }
        let mut free_disk = self.disk_free.lock();
        free_disk.clear();
        for inode_no in 1..NINODE_DISK as u32 {
            let (block, off) = inode_location(&sb, inode_no);
            let mut buf = [0u8; BLOCK_SIZE];
            disk.read(block, &mut buf);
            let entry = InodeEntry::from_bytes(&buf[off..off + INODE_ENTRY_SIZE]);
            if !entry.is_valid() {
                free_disk.push(inode_no);
            } else if let Some(slot) = self.bind_slot(inode_no) {
                // SAFETY: init runs once at mount time, before any other
                // code can observe this slot.
                unsafe {
                    let state = self.slots[slot].inner.get_mut_unchecked();
                    state.entry = entry;
                    state.valid = true;
                }
            }
        }
    }

    /// Finds `inode_no` in the index or binds a free/evictable slot
    /// for it, without touching disk (spec.md §4.3, `get`).
    fn bind_slot(&self, inode_no: u32) -> Option<usize> {
        let mut g = self.state.lock();
        if let Ok(pos) = g.index.binary_search_by_key(&inode_no, |&(n, _)| n) {
            let slot = g.index[pos].1;
            if let Some(p) = g.lru.iter().position(|&s| s == slot) {
                g.lru.remove(p);
            }
            g.lru.push(slot);
            return Some(slot);
        }

        let slot = match g.free.pop() {
            Some(s) => s,
            None => {
                let victim = g.lru.iter().copied().find(|&s| self.slots[s].rc.get() == 0)?;
                let pos = g.lru.iter().position(|&s| s == victim).unwrap();
                g.lru.remove(pos);
                let old_no = self.slots[victim].inode_no.load(Ordering::Relaxed);
                if let Ok(ipos) = g.index.binary_search_by_key(&old_no, |&(n, _)| n) {
                    g.index.remove(ipos);
                }
                victim
            }
        };

        self.slots[slot].inode_no.store(inode_no, Ordering::Relaxed);
        let ipos = g.index.partition_point(|&(n, _)| n < inode_no);
        g.index.insert(ipos, (inode_no, slot));
        g.lru.push(slot);
        // SAFETY: slot just bound, not yet visible to any other looker-up.
        unsafe {
            self.slots[slot].inner.get_mut_unchecked().valid = false;
        }
        Some(slot)
    }

    /// spec.md §4.3, `get`: looks up an active inode, incrementing its
    /// refcount. Refcount only guards cache existence, not exclusivity.
    pub fn get(&self, inode_no: u32) -> usize {
        let slot = self.bind_slot(inode_no).expect("inode cache exhausted");
        self.slots[slot].rc.increment();
        slot
    }

    /// spec.md §4.3, `share`: duplicates a reference the caller already
    /// holds (e.g. when an fd is `dup`'d).
    pub fn share(&self, slot: usize) -> usize {
        self.slots[slot].rc.increment();
        slot
    }

    /// spec.md §4.3, `alloc`: pops the on-disk free list, zeroes and
    /// types the entry, binds it into the cache, and syncs.
    pub fn alloc(&self, ctx: &KCtx<'_>, op: &mut OpContext, disk: &dyn BlockDevice, cache: &BlockCache, log: &Log, sb: Superblock, ty: InodeType) -> u32 {
        let inode_no = self.disk_free.lock().pop().expect("no free on-disk inodes");
        let slot = self.bind_slot(inode_no).expect("inode cache exhausted");
        self.slots[slot].rc.increment();
        let entry = {
            let mut guard = self.slots[slot].inner.lock(ctx);
            guard.entry = InodeEntry::invalid();
            guard.entry.ty = ty;
            guard.valid = true;
            guard.entry
        };
        self.write_entry_to_disk(ctx, op, disk, cache, log, sb, inode_no, &entry);
        inode_no
    }

    /// spec.md §4.3, `lock`: acquires the inode's sleeping lock,
    /// reading its on-disk entry first if not already cached.
    pub fn lock<'s, 'k>(&'s self, ctx: &'s KCtx<'k>, disk: &dyn BlockDevice, cache: &BlockCache, sb: Superblock, slot: usize) -> InodeGuard<'s, 'k> {
        let mut guard = self.slots[slot].inner.lock(ctx);
        if !guard.valid {
            let inode_no = self.slots[slot].inode_no.load(Ordering::Relaxed);
            let (block, off) = inode_location(&sb, inode_no);
            let data = cache.acquire(ctx, disk, block);
            guard.entry = InodeEntry::from_bytes(&data[off..off + INODE_ENTRY_SIZE]);
            guard.valid = true;
        }
        InodeGuard { slot, lock: Some(guard) }
    }

    /// spec.md §4.3, `sync`: writes the in-memory entry to its on-disk
    /// slot through the log. Takes the entry by value rather than
    /// re-locking the slot's sleeplock, since every caller already
    /// holds an [`InodeGuard`] on it.
    fn write_entry_to_disk(&self, ctx: &KCtx<'_>, op: &mut OpContext, disk: &dyn BlockDevice, cache: &BlockCache, log: &Log, sb: Superblock, inode_no: u32, entry: &InodeEntry) {
        let (block, off) = inode_location(&sb, inode_no);
        let mut data = cache.acquire(ctx, disk, block);
        entry.to_bytes(&mut data[off..off + INODE_ENTRY_SIZE]);
        log.sync(Some(op), disk, cache, &mut data);
    }

    pub fn sync(&self, ctx: &KCtx<'_>, op: &mut OpContext, disk: &dyn BlockDevice, cache: &BlockCache, log: &Log, sb: Superblock, guard: &InodeGuard<'_, '_>) {
        let inode_no = self.slots[guard.slot].inode_no.load(Ordering::Relaxed);
        self.write_entry_to_disk(ctx, op, disk, cache, log, sb, inode_no, guard.entry());
    }

    /// spec.md §4.3, `clear`: frees every data block (direct and
    /// single-indirect), frees the indirect table, zeroes size, syncs.
    pub fn clear(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, sb: Superblock, guard: &mut InodeGuard<'_, '_>) {
        for i in 0..INODE_NUM_DIRECT {
            let bn = guard.entry().direct[i];
            if bn != 0 {
                fs.free_block(ctx, op, disk, bn);
                guard.entry_mut().direct[i] = 0;
            }
        }
        if guard.entry().indirect != 0 {
            let indirect = fs.cache.acquire(ctx, disk, guard.entry().indirect);
            for i in 0..INODE_NUM_INDIRECT {
                let off = i * 4;
                let bn = u32::from_le_bytes([indirect[off], indirect[off + 1], indirect[off + 2], indirect[off + 3]]);
                if bn != 0 {
                    fs.free_block(ctx, op, disk, bn);
                }
            }
            drop(indirect);
            fs.free_block(ctx, op, disk, guard.entry().indirect);
            guard.entry_mut().indirect = 0;
        }
        guard.entry_mut().size = 0;
        self.sync(ctx, op, disk, &fs.cache, &fs.log, sb, guard);
    }

    /// spec.md §4.3, `put`: decrements refcount; if it and the link
    /// count both reach zero, frees the inode's data and returns it to
    /// the on-disk free list.
    pub fn put(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, sb: Superblock, slot: usize) {
        let reached_zero = self.slots[slot].rc.decrement();
        if !reached_zero {
            return;
        }
        let mut guard = self.lock(ctx, disk, &fs.cache, sb, slot);
        if guard.entry().nlink != 0 {
            return;
        }
        self.clear(ctx, op, fs, disk, sb, &mut guard);
        guard.entry_mut().ty = InodeType::Invalid;
        self.sync(ctx, op, disk, &fs.cache, &fs.log, sb, &guard);
        drop(guard);
        let inode_no = self.slots[slot].inode_no.load(Ordering::Relaxed);
        self.disk_free.lock().push(inode_no);
    }

    /// Returns the data block number holding offset `off` within
    /// `entry`, allocating it (and, if needed, the indirect table) if
    /// absent (spec.md §4.3, "Block mapping").
    fn bmap(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, entry: &mut InodeEntry, bn: usize) -> u32 {
        if bn < INODE_NUM_DIRECT {
            if entry.direct[bn] == 0 {
                entry.direct[bn] = fs.alloc_block(ctx, op, disk);
            }
            return entry.direct[bn];
        }
        let ibn = bn - INODE_NUM_DIRECT;
        assert!(ibn < INODE_NUM_INDIRECT, "offset exceeds INODE_MAX_BYTES");
        if entry.indirect == 0 {
            entry.indirect = fs.alloc_block(ctx, op, disk);
        }
        let mut indirect = fs.cache.acquire(ctx, disk, entry.indirect);
        let off = ibn * 4;
        let mut block_no = u32::from_le_bytes([indirect[off], indirect[off + 1], indirect[off + 2], indirect[off + 3]]);
        if block_no == 0 {
            block_no = fs.alloc_block(ctx, op, disk);
            indirect[off..off + 4].copy_from_slice(&block_no.to_le_bytes());
            fs.log.sync(Some(op), disk, &fs.cache, &mut indirect);
        }
        block_no
    }

    /// spec.md §4.3, `read`: clamps to size, delegates console-device
    /// reads, otherwise walks the block mapping copying block-aligned
    /// chunks. The [`Console`] HAL only exposes output (spec.md §1: line
    /// editing and input are the TTY layer's job, out of scope), so a
    /// read against the console device is a no-data short-circuit
    /// rather than an actual transfer.
    pub fn read(&self, ctx: &KCtx<'_>, disk: &dyn BlockDevice, cache: &BlockCache, console: &dyn Console, guard: &InodeGuard<'_, '_>, dst: &mut [u8], offset: usize) -> Result<usize> {
        let entry = guard.entry();
        if entry.ty == InodeType::Device && entry.major == CONSOLE_MAJOR {
            let _ = console;
            return Ok(0);
        }
        if offset >= entry.size as usize {
            return Ok(0);
        }
        let n = dst.len().min(entry.size as usize - offset);
        let mut done = 0;
        while done < n {
            let bn = (offset + done) / BLOCK_SIZE;
            let boff = (offset + done) % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - boff).min(n - done);
            let block_no = {
                let e = guard.entry();
                if bn < INODE_NUM_DIRECT {
                    e.direct[bn]
                } else {
                    let ibn = bn - INODE_NUM_DIRECT;
                    if e.indirect == 0 {
                        0
                    } else {
                        let indirect = cache.acquire(ctx, disk, e.indirect);
                        let off = ibn * 4;
                        u32::from_le_bytes([indirect[off], indirect[off + 1], indirect[off + 2], indirect[off + 3]])
                    }
                }
            };
            if block_no == 0 {
                dst[done..done + chunk].fill(0);
            } else {
                let data = cache.acquire(ctx, disk, block_no);
                dst[done..done + chunk].copy_from_slice(&data[boff..boff + chunk]);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// spec.md §4.3, `write`: may extend size up to `INODE_MAX_BYTES`;
    /// dirties the inode if size grew.
    pub fn write(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, sb: Superblock, guard: &mut InodeGuard<'_, '_>, src: &[u8], offset: usize) -> Result<usize> {
        if offset + src.len() > INODE_MAX_BYTES {
            return Err(KernelError::InvalidArgument);
        }
        let mut done = 0;
        while done < src.len() {
            let bn = (offset + done) / BLOCK_SIZE;
            let boff = (offset + done) % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - boff).min(src.len() - done);
            let block_no = {
                let mut entry = *guard.entry();
                let bn_resolved = self.bmap(ctx, op, fs, disk, &mut entry, bn);
                *guard.entry_mut() = entry;
                bn_resolved
            };
            let mut data = fs.cache.acquire(ctx, disk, block_no);
            data[boff..boff + chunk].copy_from_slice(&src[done..done + chunk]);
            fs.log.sync(Some(op), disk, &fs.cache, &mut data);
            done += chunk;
        }
        let new_size = (offset + done) as u32;
        if new_size > guard.entry().size {
            guard.entry_mut().size = new_size;
        }
        self.sync(ctx, op, disk, &fs.cache, &fs.log, sb, guard);
        Ok(done)
    }

    /// spec.md §4.3, `lookup`: linear scan of a directory's entries.
    pub fn lookup(&self, ctx: &KCtx<'_>, disk: &dyn BlockDevice, cache: &BlockCache, dir: &InodeGuard<'_, '_>, name: &[u8]) -> Option<(u16, usize)> {
        assert_eq!(dir.entry().ty, InodeType::Directory, "lookup on a non-directory inode");
        let size = dir.entry().size as usize;
        let count = size / DIR_ENTRY_SIZE;
        for i in 0..count {
            let mut buf = [0u8; DIR_ENTRY_SIZE];
            let n = self.read_raw(ctx, disk, cache, dir, &mut buf, i * DIR_ENTRY_SIZE);
            if n < DIR_ENTRY_SIZE {
                continue;
            }
            let e = DirEntry::from_bytes(&buf);
            if !e.is_free() && e.name_str() == name {
                return Some((e.inode_no, i));
            }
        }
        None
    }

    /// spec.md §4.3, `insert`: appends a new directory entry (reusing
    /// a free slot if one exists).
    pub fn insert(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, sb: Superblock, dir: &mut InodeGuard<'_, '_>, name: &[u8], inode_no: u16) -> Result<()> {
        assert_eq!(dir.entry().ty, InodeType::Directory, "insert on a non-directory inode");
        if self.lookup(ctx, disk, &fs.cache, dir, name).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let size = dir.entry().size as usize;
        let count = size / DIR_ENTRY_SIZE;
        let mut target = count;
        for i in 0..count {
            let mut buf = [0u8; DIR_ENTRY_SIZE];
            self.read_raw(ctx, disk, &fs.cache, dir, &mut buf, i * DIR_ENTRY_SIZE);
            if DirEntry::from_bytes(&buf).is_free() {
                target = i;
                break;
            }
        }
        let mut entry = DirEntry::empty();
        entry.inode_no = inode_no;
        entry.set_name(name);
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        entry.to_bytes(&mut buf);
        self.write(ctx, op, fs, disk, sb, dir, &buf, target * DIR_ENTRY_SIZE)?;
        Ok(())
    }

    /// spec.md §4.3, `remove`: clears the entry at directory index
    /// `index` (sets it free; does not compact the directory).
    pub fn remove(&self, ctx: &KCtx<'_>, op: &mut OpContext, fs: &crate::fs::FileSystem, disk: &dyn BlockDevice, sb: Superblock, dir: &mut InodeGuard<'_, '_>, index: usize) {
        let entry = DirEntry::empty();
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        entry.to_bytes(&mut buf);
        self.write(ctx, op, fs, disk, sb, dir, &buf, index * DIR_ENTRY_SIZE).expect("remove: write within existing directory bounds");
    }

    fn read_raw(&self, ctx: &KCtx<'_>, disk: &dyn BlockDevice, cache: &BlockCache, dir: &InodeGuard<'_, '_>, dst: &mut [u8], offset: usize) -> usize {
        let entry = dir.entry();
        if offset >= entry.size as usize {
            return 0;
        }
        let n = dst.len().min(entry.size as usize - offset);
        let mut done = 0;
        while done < n {
            let bn = (offset + done) / BLOCK_SIZE;
            let boff = (offset + done) % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - boff).min(n - done);
            let block_no = if bn < INODE_NUM_DIRECT {
                entry.direct[bn]
            } else {
                0
            };
            if block_no != 0 {
                let data = cache.acquire(ctx, disk, block_no);
                dst[done..done + chunk].copy_from_slice(&data[boff..boff + chunk]);
            } else {
                dst[done..done + chunk].fill(0);
            }
            done += chunk;
        }
        done
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked view of a cached inode (spec.md §4.3).
pub struct InodeGuard<'s, 'k> {
    slot: usize,
    lock: Option<SleeplockGuard<'s, 'k, InodeState>>,
}

impl InodeGuard<'_, '_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn entry(&self) -> &InodeEntry {
        &self.lock.as_ref().unwrap().entry
    }

    pub fn entry_mut(&mut self) -> &mut InodeEntry {
        &mut self.lock.as_mut().unwrap().entry
    }
}

impl Drop for InodeGuard<'_, '_> {
    fn drop(&mut self) {
        self.lock = None; // releases the sleeplock (posts its semaphore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BlockDevice, Console};
    use crate::kernel::Kernel;
    use crate::proc::container::ROOT_CONTAINER;
    use crate::testutil::{FakeConsole, FakeDisk};

    fn format_disk(disk: &FakeDisk) -> Superblock {
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

    #[test]
    fn write_then_read_round_trips_through_the_block_mapping() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let inode_no = kernel.fs.inodes.alloc(&ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);
            let slot = kernel.fs.inodes.get(inode_no);
            let mut guard = kernel.fs.inodes.lock(&ctx, kernel.disk, &kernel.fs.cache, sb, slot);
            let data = b"hello kernel";
            let n = kernel
                .fs
                .inodes
                .write(&ctx, &mut op, &kernel.fs, kernel.disk, sb, &mut guard, data, 0)
                .expect("write within bounds");
            assert_eq!(n, data.len());
            drop(guard);
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);

            let guard = kernel.fs.inodes.lock(&ctx, kernel.disk, &kernel.fs.cache, sb, slot);
            assert_eq!(guard.entry().size as usize, data.len());
            let mut buf = [0u8; 32];
            let n = kernel
                .fs
                .inodes
                .read(&ctx, kernel.disk, &kernel.fs.cache, kernel.console, &guard, &mut buf[..data.len()], 0)
                .expect("read within bounds");
            assert_eq!(&buf[..n], data);
        });
    }

    #[test]
    fn insert_then_lookup_finds_the_directory_entry() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let dir_no = kernel.fs.inodes.alloc(&ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::Directory);
            let dir_slot = kernel.fs.inodes.get(dir_no);
            let file_no = kernel.fs.inodes.alloc(&ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);

            let mut dir_guard = kernel.fs.inodes.lock(&ctx, kernel.disk, &kernel.fs.cache, sb, dir_slot);
            kernel
                .fs
                .inodes
                .insert(&ctx, &mut op, &kernel.fs, kernel.disk, sb, &mut dir_guard, b"greeting", file_no as u16)
                .expect("insert into fresh directory");
            drop(dir_guard);
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);

            let dir_guard = kernel.fs.inodes.lock(&ctx, kernel.disk, &kernel.fs.cache, sb, dir_slot);
            let found = kernel.fs.inodes.lookup(&ctx, kernel.disk, &kernel.fs.cache, &dir_guard, b"greeting");
            assert_eq!(found.map(|(n, _)| n), Some(file_no as u16));
            assert!(kernel.fs.inodes.lookup(&ctx, kernel.disk, &kernel.fs.cache, &dir_guard, b"missing").is_none());
        });
    }

    #[test]
    fn put_to_zero_refcount_with_no_links_frees_the_inode_back_to_disk() {
        with_kernel(|kernel| {
            let caller = kernel.procs.alloc_raw(ROOT_CONTAINER);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            let ctx = kernel.ctx(0);

            let sb = kernel.fs.superblock();
            let mut op = kernel.fs.log.begin_op(&ctx);
            let inode_no = kernel.fs.inodes.alloc(&ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);
            let slot = kernel.fs.inodes.get(inode_no);
            kernel.fs.inodes.put(&ctx, &mut op, &kernel.fs, kernel.disk, sb, slot);
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);

            let mut op = kernel.fs.log.begin_op(&ctx);
            let reused = kernel.fs.inodes.alloc(&ctx, &mut op, kernel.disk, &kernel.fs.cache, &kernel.fs.log, sb, InodeType::File);
            kernel.fs.log.end_op(op, &ctx, kernel.disk, &kernel.fs.cache);
            assert_eq!(reused, inode_no, "freed inode number should be reused");
        });
    }
}
