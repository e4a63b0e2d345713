//! Pipes (spec.md §6's `pipe`/`read`/`write` surface).
//!
//! Grounded on `original_source/src/fs/pipe.c`: a fixed-size ring buffer
//! guarded by one lock, with a pair of semaphores standing in for the
//! original's condition-variable `wakeup`/`sleep` pairs — one counting
//! free slots, one counting filled slots, so `write` blocks on back-
//! pressure and `read` blocks on an empty pipe the same way the original
//! does, a byte at a time.
//!
//! Every pipe lives in a fixed-size table rather than behind a heap
//! allocation (spec.md §1). The original frees a pipe's memory once both
//! ends are closed; this crate has nowhere to return a freed slot to
//! without a general allocator, so a pipe's table slot is never reused
//! once allocated — `NPIPE` bounds how many pipes a running system can
//! ever create, not how many can be open at once.
use crate::error::{KernelError, Result};
use crate::kernel::KCtx;
use crate::lock::{Semaphore, Spinlock};
use crate::param::{NPIPE, PIPE_SIZE};

struct RingState {
    data: [u8; PIPE_SIZE],
    nread: usize,
    nwrite: usize,
    readopen: bool,
    writeopen: bool,
}

/// One pipe's ring buffer plus its readable/writable flags.
struct Pipe {
    state: Spinlock<RingState>,
    /// Counts free slots in the ring; a writer waits here for room.
    space: Semaphore,
    /// Counts filled slots; a reader waits here for data.
    data_ready: Semaphore,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            state: Spinlock::new(
                "pipe",
                RingState {
                    data: [0; PIPE_SIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            space: Semaphore::new("pipe_space", PIPE_SIZE as i64),
            data_ready: Semaphore::new("pipe_data", 0),
        }
    }

    /// Writes `src` a byte at a time, blocking on back-pressure.
    /// Stops early (returning the short count) if the read end closes
    /// or the caller is killed, mirroring `pipeWrite`'s per-byte
    /// `myproc()->killed` check.
    fn write(&self, ctx: &KCtx<'_>, src: &[u8]) -> Result<usize> {
        for (i, &b) in src.iter().enumerate() {
            if !self.state.lock().readopen {
                return Err(KernelError::InvalidArgument);
            }
            if !self.space.wait_alertable(ctx) {
                return Ok(i);
            }
            {
                let mut g = self.state.lock();
                let idx = g.nwrite % PIPE_SIZE;
                g.data[idx] = b;
                g.nwrite += 1;
            }
            self.data_ready.post(ctx);
        }
        Ok(src.len())
    }

    fn read(&self, ctx: &KCtx<'_>, dst: &mut [u8]) -> Result<usize> {
        for (i, slot) in dst.iter_mut().enumerate() {
            let drained = {
                let g = self.state.lock();
                g.nread == g.nwrite && !g.writeopen
            };
            if drained {
                return Ok(i);
            }
            if !self.data_ready.wait_alertable(ctx) {
                return Ok(i);
            }
            {
                let mut g = self.state.lock();
                let idx = g.nread % PIPE_SIZE;
                *slot = g.data[idx];
                g.nread += 1;
            }
            self.space.post(ctx);
        }
        Ok(dst.len())
    }

    /// Marks one end closed. Returns `true` once both ends are closed.
    fn close_end(&self, writable: bool) -> bool {
        let mut g = self.state.lock();
        if writable {
            g.writeopen = false;
        } else {
            g.readopen = false;
        }
        !g.readopen && !g.writeopen
    }
}

/// The system-wide pipe table (spec.md §6: `pipe` hands back a read fd
/// and a write fd sharing one of these).
pub struct PipeTable {
    alloc_bitmap: Spinlock<[bool; NPIPE]>,
    pipes: [Pipe; NPIPE],
}

impl PipeTable {
    pub const fn new() -> Self {
        const P: Pipe = Pipe::new();
        Self {
            alloc_bitmap: Spinlock::new("pipetable", [false; NPIPE]),
            pipes: [P; NPIPE],
        }
    }

    /// Claims a never-before-used pipe slot.
    pub fn alloc(&self) -> usize {
        let mut g = self.alloc_bitmap.lock();
        let id = g.iter().position(|&u| !u).expect("pipe table exhausted");
        g[id] = true;
        id
    }

    pub fn write(&self, ctx: &KCtx<'_>, id: usize, src: &[u8]) -> Result<usize> {
        self.pipes[id].write(ctx, src)
    }

    pub fn read(&self, ctx: &KCtx<'_>, id: usize, dst: &mut [u8]) -> Result<usize> {
        self.pipes[id].read(ctx, dst)
    }

    /// Closes one end. The underlying slot is never returned to
    /// `alloc` (see module docs); this only flips the flag so the
    /// other end's blocked reader/writer observes end-of-pipe.
    pub fn close_end(&self, _ctx: &KCtx<'_>, id: usize, writable: bool) {
        self.pipes[id].close_end(writable);
    }
}

impl Default for PipeTable {
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

    fn with_kernel<R>(f: impl FnOnce(&Kernel) -> R) -> R {
        let disk: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new(64)));
        let console: &'static FakeConsole = Box::leak(Box::new(FakeConsole::new()));
        let kernel = Kernel::new(disk as &'static dyn BlockDevice, console as &'static dyn Console, 1);
        kernel.containers.init();
        let slot = kernel.procs.alloc_raw(crate::proc::container::ROOT_CONTAINER);
        kernel.sched.set_idle(0, slot);
        kernel.sched.context_in(&kernel.procs, 0, slot, 0);
        f(&kernel)
    }

    #[test]
    fn write_then_read_round_trips() {
        with_kernel(|kernel| {
            let ctx = kernel.ctx(0);
            let id = kernel.pipes.alloc();
            assert_eq!(kernel.pipes.write(&ctx, id, b"hello").unwrap(), 5);
            let mut buf = [0u8; 5];
            assert_eq!(kernel.pipes.read(&ctx, id, &mut buf).unwrap(), 5);
            assert_eq!(&buf, b"hello");
        });
    }

    #[test]
    fn read_after_write_end_closed_returns_short_count() {
        with_kernel(|kernel| {
            let ctx = kernel.ctx(0);
            let id = kernel.pipes.alloc();
            kernel.pipes.write(&ctx, id, b"ab").unwrap();
            kernel.pipes.close_end(&ctx, id, true);
            let mut buf = [0u8; 10];
            assert_eq!(kernel.pipes.read(&ctx, id, &mut buf).unwrap(), 2);
            assert_eq!(kernel.pipes.read(&ctx, id, &mut buf).unwrap(), 0);
        });
    }
}
