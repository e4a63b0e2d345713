//! `fork`/`exit`/`wait`/`kill`/`sbrk` (spec.md §6), thin wrappers over
//! the process-table and address-space APIs `proc`/`vm` already expose.
use super::Args;
use crate::error::{KernelError, Result};
use crate::kernel::{KCtx, Kernel};

/// spec.md §6, `wait`: blocks for a child to exit and reaps it,
/// returning its pid. [`crate::proc::ProcTable::wait`] already does the
/// blocking and the bookkeeping; there is nothing left to add here but
/// the "no children at all" → `ECHILD` mapping.
pub(super) fn sys_wait(kernel: &Kernel, ctx: &KCtx<'_>) -> Result<i64> {
    kernel.procs.wait(ctx).map(|(_code, pid)| pid as i64).ok_or(KernelError::NoChildren)
}

/// spec.md §6, `kill`: marks the target runnable-to-die. `a.0[0]` is the
/// target's pid, scoped to the caller's own container.
pub(super) fn sys_kill(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let pid = a.0[0] as u32;
    if kernel.procs.kill(ctx, pid) {
        Ok(0)
    } else {
        Err(KernelError::NoSuchProcess)
    }
}

/// spec.md §6, `sbrk`: grows or shrinks the caller's heap section by
/// `a.0[0]` bytes (as a signed delta), returning the break's old value.
pub(super) fn sys_sbrk(kernel: &Kernel, ctx: &KCtx<'_>, a: Args) -> Result<i64> {
    let me = ctx.current_slot();
    let as_ptr = kernel.procs.addrspace_ptr(me);
    let incr = a.0[0] as i64;
    // SAFETY: `me` is the process currently running on this cpu.
    let old_break = unsafe { (*as_ptr).sbrk(ctx, kernel, incr) }?;
    Ok(old_break as i64)
}
