//! The filesystem facade: wires the block cache, write-ahead log,
//! on-disk bitmap allocator, and inode cache into the single contract
//! spec.md §4.2/§4.3 describes (`acquire`/`release`/`begin_op`/`sync`/
//! `end_op`/`alloc`/`free` plus the inode operations).
pub mod bitmap;
pub mod block;
pub mod file;
pub mod inode;
pub mod log;
pub mod path;
pub mod pipe;
pub mod stat;
pub mod superblock;

use crate::hal::BlockDevice;
use crate::kernel::KCtx;
use crate::lock::Spinlock;
use crate::param::BLOCK_SIZE;
use block::BlockCache;
use inode::InodeTable;
use log::{Log, OpContext};
use superblock::Superblock;

pub struct FileSystem {
    sb: Spinlock<Option<Superblock>>,
    pub cache: BlockCache,
    pub log: Log,
    pub inodes: InodeTable,
}

impl FileSystem {
    pub const fn new(log_start: u32) -> Self {
        Self {
            sb: Spinlock::new("sb", None),
            cache: BlockCache::new(),
            log: Log::new(log_start),
            inodes: InodeTable::new(),
        }
    }

    pub fn superblock(&self) -> Superblock {
        self.sb.lock().expect("filesystem not mounted")
    }

    /// Reads the superblock, replays the write-ahead log, and loads
    /// the on-disk inode free list (spec.md §4.2 "Recovery", §4.3
    /// "At init..."). Must run once before any other `FileSystem` call.
    pub fn mount(&self, disk: &dyn BlockDevice) {
        self.cache.init();
        let mut raw = [0u8; BLOCK_SIZE];
        disk.read(0, &mut raw);
        let sb = Superblock::from_bytes(&raw);
        *self.sb.lock() = Some(sb);
        self.log.recover(disk);
        self.inodes.init(disk, sb);
    }

    /// spec.md §4.2, "Allocator": linear bitmap scan, first zero bit
    /// flipped and synced, backing data block zeroed and synced.
    pub fn alloc_block(&self, ctx: &KCtx<'_>, op: &mut OpContext, disk: &dyn BlockDevice) -> u32 {
        let sb = self.superblock();
        for data_index in 0..sb.num_data_blocks {
            let (bitmap_block, bit) = bitmap::locate(data_index);
            let mut guard = self.cache.acquire(ctx, disk, sb.bitmap_start + bitmap_block);
            if bitmap::is_free(&guard, bit) {
                bitmap::set_used(&mut guard, bit);
                self.log.sync(Some(op), disk, &self.cache, &mut guard);
                drop(guard);

                let block_no = sb.data_start + data_index;
                let mut data = self.cache.acquire(ctx, disk, block_no);
                for b in data.iter_mut() {
                    *b = 0;
                }
                self.log.sync(Some(op), disk, &self.cache, &mut data);
                return block_no;
            }
        }
        panic!("alloc_block: no free data blocks");
    }

    /// spec.md §4.2, `free`.
    pub fn free_block(&self, ctx: &KCtx<'_>, op: &mut OpContext, disk: &dyn BlockDevice, block_no: u32) {
        let sb = self.superblock();
        let data_index = block_no - sb.data_start;
        let (bitmap_block, bit) = bitmap::locate(data_index);
        let mut guard = self.cache.acquire(ctx, disk, sb.bitmap_start + bitmap_block);
        bitmap::clear_used(&mut guard, bit);
        self.log.sync(Some(op), disk, &self.cache, &mut guard);
    }
}
