//! Long-term sleeping lock for blocks and inodes (spec.md §3, §4.2, §4.3).
//!
//! Grounded directly on `original_source/src/fs/cache.c`'s
//! `init_sleeplock`/`wait_sem`/`post_sem` pair: a sleeplock here *is* a
//! binary [`Semaphore`] plus an owner tag, exactly as the original models
//! `Block.lock`. The teacher's Rust version (`lock/sleeplock.rs`) reaches
//! the same place through a `Sleepablelock<i32>` holder field; this
//! collapses the two since [`Semaphore`] already provides the sleeping
//! wait/wakeup discipline.
//!
//! Unlike [`super::spinlock::Spinlock`], acquiring or releasing a
//! sleeplock can put the calling process to sleep, so every operation
//! needs a [`KCtx`] — there is no context-free `RawLock` impl for this
//! type; the guard below threads the context through instead.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::semaphore::Semaphore;
use crate::kernel::KCtx;

const NO_HOLDER: usize = usize::MAX;

pub struct RawSleeplock {
    sem: Semaphore,
    holder: AtomicUsize,
    name: &'static str,
}

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            sem: Semaphore::new("sleeplock", 1),
            holder: AtomicUsize::new(NO_HOLDER),
            name,
        }
    }

    /// Acquires the lock. Never returns early even if the caller is
    /// killed — block/inode locks use non-alertable waits to preserve
    /// the cache's invariants (spec.md §5, "Cancellation").
    fn acquire(&self, ctx: &KCtx<'_>) {
        self.sem.wait(ctx);
        self.holder.store(ctx.current_slot(), Ordering::Relaxed);
    }

    fn release(&self, ctx: &KCtx<'_>) {
        assert!(self.held_by(ctx.current_slot()), "release {}: not held", self.name);
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.sem.post(ctx);
    }

    pub fn held_by(&self, slot: usize) -> bool {
        self.holder.load(Ordering::Relaxed) == slot
    }
}

/// A [`RawSleeplock`] paired with the data it protects.
pub struct Sleeplock<T> {
    lock: RawSleeplock,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `SleeplockGuard`, which only
// exists while `lock` is held.
unsafe impl<T: Send> Sync for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleeplock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock<'s, 'k>(&'s self, ctx: &'s KCtx<'k>) -> SleeplockGuard<'s, 'k, T> {
        self.lock.acquire(ctx);
        SleeplockGuard { owner: self, ctx }
    }

    pub fn holding(&self, ctx: &KCtx<'_>) -> bool {
        self.lock.held_by(ctx.current_slot())
    }

    /// # Safety
    /// The caller must ensure no other thread can observe `self`
    /// concurrently.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct SleeplockGuard<'s, 'k, T> {
    owner: &'s Sleeplock<T>,
    ctx: &'s KCtx<'k>,
}

impl<T> Deref for SleeplockGuard<'_, '_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for SleeplockGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.owner.lock.release(self.ctx);
    }
}
