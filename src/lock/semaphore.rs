//! Sleeping semaphore (spec.md §4.1).
//!
//! "Integer counter with an intrusive waiter queue; `post` increments and
//! wakes one waiter; `wait` decrements (blocking if zero). Two waiter
//! variants: alertable ... and non-alertable." Semaphores are the
//! exclusive mechanism for kernel-mode blocking (spec.md §4.1, §5).
//!
//! Grounded on `original_source/src/common/spinlock.h`'s `Semaphore` and
//! on the teacher's `Sleepablelock`/`WaitChannel` pairing, collapsed into
//! one type since every sleeper here blocks on exactly one counter.
use core::cell::RefCell;

use crate::kernel::KCtx;
use crate::lock::spinlock::RawSpinlock;
use crate::proc;

/// FIFO of process-table slot indices waiting on a semaphore.
///
/// `std::collections::VecDeque` would allocate from the host heap and is
/// only available under `#[cfg(test)]`; the real kernel has no general
/// heap (spec.md §1 keeps the slab-backed allocator out of scope beyond
/// fixed-size object pools), so waiters are linked through a fixed-size
/// ring sized to `NPROC` — at most one entry per live process can ever be
/// queued on any single semaphore at a time.
struct WaiterRing {
    buf: [usize; crate::param::NPROC],
    head: usize,
    len: usize,
}

impl WaiterRing {
    const fn new() -> Self {
        Self {
            buf: [0; crate::param::NPROC],
            head: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, v: usize) {
        assert!(self.len < crate::param::NPROC, "semaphore waiter ring full");
        let idx = (self.head + self.len) % crate::param::NPROC;
        self.buf[idx] = v;
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let v = self.buf[self.head];
        self.head = (self.head + 1) % crate::param::NPROC;
        self.len -= 1;
        Some(v)
    }

    fn remove(&mut self, v: usize) {
        let mut items = [0usize; crate::param::NPROC];
        let mut n = 0;
        while let Some(x) = self.pop_front() {
            if x != v {
                items[n] = x;
                n += 1;
            }
        }
        for &x in &items[..n] {
            self.push_back(x);
        }
    }
}

struct SemState {
    count: i64,
    waiters: WaiterRing,
}

/// A counting semaphore. See module docs and spec.md §4.1.
pub struct Semaphore {
    lock: RawSpinlock,
    state: RefCell<SemState>,
}

// SAFETY: `state` is only touched while `lock` is held.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(name: &'static str, count: i64) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            state: RefCell::new(SemState {
                count,
                waiters: WaiterRing::new(),
            }),
        }
    }

    /// Non-alertable wait: ignores the caller's killed flag, guaranteed
    /// to return once posted. Used by block/inode sleeping locks and the
    /// log's admission semaphore (spec.md §5, "Cancellation").
    pub fn wait(&self, ctx: &KCtx<'_>) {
        let ok = self.wait_inner(ctx, false);
        debug_assert!(ok);
    }

    /// Alertable wait: may return early with `false` if the calling
    /// process is killed while blocked (spec.md §4.1, §7).
    #[must_use]
    pub fn wait_alertable(&self, ctx: &KCtx<'_>) -> bool {
        self.wait_inner(ctx, true)
    }

    fn wait_inner(&self, ctx: &KCtx<'_>, alertable: bool) -> bool {
        loop {
            self.lock.acquire_as(ctx.cpu);
            {
                let mut s = self.state.borrow_mut();
                if s.count > 0 {
                    s.count -= 1;
                    self.lock.release_owned_by(ctx.cpu);
                    return true;
                }
                let me = ctx.current_slot();
                s.waiters.push_back(me);
            }
            self.lock.release_owned_by(ctx.cpu);

            let killed = proc::park_current(ctx, alertable);
            if alertable && killed {
                self.lock.acquire_as(ctx.cpu);
                self.state.borrow_mut().waiters.remove(ctx.current_slot());
                self.lock.release_owned_by(ctx.cpu);
                return false;
            }
        }
    }

    /// Increments the count and wakes exactly one waiter, if any.
    pub fn post(&self, ctx: &KCtx<'_>) {
        self.lock.acquire_as(ctx.cpu);
        let woken = {
            let mut s = self.state.borrow_mut();
            s.count += 1;
            s.waiters.pop_front()
        };
        self.lock.release_owned_by(ctx.cpu);
        if let Some(slot) = woken {
            proc::activate_slot(ctx, slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> i64 {
        self.lock.acquire_as(0);
        let c = self.state.borrow().count;
        self.lock.release_owned_by(0);
        c
    }
}
