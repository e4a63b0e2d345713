//! Syscall numeric dispatch (spec.md §1, §6: "syscall entry demux ...
//! referenced only as opaque types/signatures that `vm`/`proc`/a thin
//! `syscall` module call into"). The trap entry itself — decoding the
//! exception, reading `x8`/`x0..x5` off the real trap frame, writing a
//! return value back into `x0` on `eret` — is that out-of-scope
//! trampoline's job. This module is the "thin `syscall` module" the
//! expanded spec names as the one piece of that boundary this crate
//! does own: it reads the calling process's already-saved
//! [`crate::proc::UserContext`], dispatches on the numeric syscall id,
//! and calls into the component APIs the rest of this crate exposes.
//!
//! Grounded on the teacher's `syscall/mod.rs` dispatch table and its
//! `argraw`/`argint`/`argaddr`/`argstr` argument-fetch helpers, adapted
//! to this crate's own `x8`-is-the-syscall-number / `x0..x5`-are-the-
//! arguments convention (`original_source/src/kernel/syscall.c`).
mod file;
mod proc_calls;

use crate::error::{KernelError, Result};
use crate::hal::ElfLoader;
use crate::kernel::{KCtx, Kernel};
use crate::param::MAX_PATH;

const SYS_FORK: u64 = 1;
const SYS_EXIT: u64 = 2;
const SYS_WAIT: u64 = 3;
const SYS_PIPE: u64 = 4;
const SYS_READ: u64 = 5;
const SYS_KILL: u64 = 6;
const SYS_EXEC: u64 = 7;
const SYS_DUP: u64 = 8;
const SYS_SBRK: u64 = 9;
const SYS_OPEN: u64 = 10;
const SYS_WRITE: u64 = 11;
const SYS_MKNOD: u64 = 12;
const SYS_CLOSE: u64 = 13;

/// One in-flight syscall's already-fetched `x0..x5` argument words.
#[derive(Clone, Copy)]
pub(crate) struct Args(pub [u64; 6]);

impl Kernel {
    /// Dispatches the calling process's pending syscall (its number in
    /// `x8`, arguments in `x0..x5`, per the saved [`crate::proc::UserContext`])
    /// and returns the value the trampoline should write back into `x0`:
    /// non-negative on success, a negated errno (spec.md §7) on failure.
    ///
    /// `elf` is the loader `execve` hands a scratch address space to; it
    /// is passed in rather than stored on `Kernel` so that every other
    /// syscall, and every existing caller of [`Kernel::new`], stays free
    /// of a dependency this crate does not implement.
    pub fn syscall(&self, ctx: &KCtx<'_>, elf: &dyn ElfLoader) -> i64 {
        let me = ctx.current_slot();
        let (num, a) = self.procs.with(me, |p| {
            let r = &p.uctx.regs;
            (r[8], Args([r[0], r[1], r[2], r[3], r[4], r[5]]))
        });

        let result: Result<i64> = match num {
            SYS_FORK => Ok(self.procs.fork(ctx, self) as i64),
            SYS_EXIT => {
                self.procs.exit(ctx, a.0[0] as i32);
                Ok(0)
            }
            SYS_WAIT => proc_calls::sys_wait(self, ctx),
            SYS_KILL => proc_calls::sys_kill(self, ctx, a),
            SYS_SBRK => proc_calls::sys_sbrk(self, ctx, a),
            SYS_PIPE => file::sys_pipe(self, ctx, a),
            SYS_READ => file::sys_read(self, ctx, a),
            SYS_WRITE => file::sys_write(self, ctx, a),
            SYS_OPEN => file::sys_open(self, ctx, a),
            SYS_CLOSE => file::sys_close(self, ctx, a),
            SYS_DUP => file::sys_dup(self, ctx, a),
            SYS_MKNOD => file::sys_mknod(self, ctx, a),
            SYS_EXEC => file::sys_exec(self, ctx, elf, a),
            _ => Err(KernelError::InvalidArgument),
        };
        result.unwrap_or_else(|e| e.to_errno() as i64)
    }
}

/// Copies a NUL-terminated pathname argument out of `me`'s address
/// space into `buf`, returning the number of bytes before the
/// terminator (spec.md §6: every path-taking syscall).
fn argstr(kernel: &Kernel, ctx: &KCtx<'_>, me: usize, va: u64, buf: &mut [u8; MAX_PATH]) -> Result<usize> {
    let as_ptr = kernel.procs.addrspace_ptr(me);
    // SAFETY: `me` is the process currently running on this cpu and
    // stays live for the duration of this call.
    let s = unsafe { (*as_ptr).copy_in_str(ctx, kernel, va as usize, buf) }?;
    Ok(s.len())
}
