//! Process lifecycle (spec.md §3 "Process", §4.6).
//!
//! Grounded on `original_source/src/kernel/proc.c`'s `create_proc`/
//! `start_proc`/`exit`/`wait`/`kill` and `kernel/proc.h`'s register-save
//! layout. Slot allocation reuses [`crate::mm::slab::Pool`] rather than
//! the original's indexed red-black set (spec.md §9's "arena indices"
//! note). Each process's `child_exit` semaphore lives in its own
//! process-table-wide array rather than as a `Process` field: posting
//! it can wake another process, which re-enters the process table, and
//! a field nested under the table's own lock would self-deadlock on
//! that re-entry (the semaphore's internal lock is what actually
//! serializes it instead).
pub mod container;

use arrayvec::ArrayVec;

use crate::kernel::{KCtx, Kernel};
use crate::lock::Semaphore;
use crate::mm::slab::Pool;
use crate::param::{NOFILE, NPROC};
use crate::vm::AddressSpace;
use container::ContainerTable;

/// spec.md §3, "States".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    DeepSleeping,
    Zombie,
}

/// Callee-saved registers and return address the (external, unimplemented)
/// switch trampoline restores on resume. Field layout mirrors
/// `original_source/src/kernel/proc.h`'s `KernelContext` (aarch64
/// `x19..x29` plus `lr`); only the data shape is in scope, not the
/// assembly that saves/restores it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelContext {
    pub x19_x29: [u64; 11],
    pub lr: u64,
}

/// Full general-purpose register file plus the exception-return state,
/// mirroring `original_source/src/kernel/proc.h`'s `UserContext`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UserContext {
    pub regs: [u64; 31],
    pub sp: u64,
    pub spsr: u64,
    pub elr: u64,
}

pub struct Process {
    pub state: ProcState,
    pub local_pid: u32,
    pub container: usize,
    pub parent: Option<usize>,
    pub children: ArrayVec<usize, NPROC>,
    pub exited_children: ArrayVec<usize, NPROC>,
    pub killed: bool,
    pub exit_code: i32,
    pub cwd: Option<u32>,
    /// Slots into the system-wide [`crate::fs::file::FileTable`]; see
    /// that module's docs for why an fd is an index rather than an
    /// owned object.
    pub files: [Option<usize>; NOFILE],
    pub kstack: Option<crate::mm::page::PageId>,
    pub kctx: KernelContext,
    pub uctx: UserContext,
    pub addrspace: AddressSpace,
}

impl Process {
    fn new(container: usize) -> Self {
        Self {
            state: ProcState::Unused,
            local_pid: 0,
            container,
            parent: None,
            children: ArrayVec::new(),
            exited_children: ArrayVec::new(),
            killed: false,
            exit_code: 0,
            cwd: None,
            files: [None; NOFILE],
            kstack: None,
            kctx: KernelContext::default(),
            uctx: UserContext::default(),
            addrspace: AddressSpace::new(),
        }
    }
}

/// The global process table plus each process's wake channel (spec.md
/// §5: "guarded by a single spinlock" for the table; the channel is
/// separate, see module docs).
pub struct ProcTable {
    pool: Pool<Process, NPROC>,
    child_exit: [Semaphore; NPROC],
}

impl ProcTable {
    pub const fn new() -> Self {
        const S: Semaphore = Semaphore::new("child_exit", 0);
        Self {
            pool: Pool::new("procs"),
            child_exit: [S; NPROC],
        }
    }

    pub fn with<R>(&self, slot: usize, f: impl FnOnce(&Process) -> R) -> R {
        self.pool.with(slot, f)
    }

    pub fn with_mut<R>(&self, slot: usize, f: impl FnOnce(&mut Process) -> R) -> R {
        self.pool.with_mut(slot, f)
    }

    pub fn container_of(&self, slot: usize) -> usize {
        self.pool.with(slot, |p| p.container)
    }

    /// spec.md §4.6, `create_proc`: pops a free slot and allocates its
    /// kernel stack. The page directory and the user/kernel register
    /// areas' placement atop the stack are the switch trampoline's
    /// concern (out of scope, spec.md §1).
    pub fn create_proc(&self, ctx: &KCtx<'_>, container: usize) -> usize {
        let slot = self.pool.alloc(|| Process::new(container)).expect("no free process slots");
        let kstack = ctx.kernel.page_alloc.alloc().expect("no free pages for kernel stack");
        self.pool.with_mut(slot, |p| p.kstack = Some(kstack));
        slot
    }

    /// spec.md §4.6, `start_proc`.
    pub fn start_proc(&self, ctx: &KCtx<'_>, slot: usize, entry: u64, arg: u64) {
        let container = self.container_of(slot);
        let needs_parent = self.pool.with(slot, |p| p.parent.is_none());
        if needs_parent {
            let root = ctx.kernel.containers.root_proc(container).unwrap_or(slot);
            self.pool.with_mut(slot, |p| p.parent = Some(root));
            if root != slot {
                self.pool.with_mut(root, |p| p.children.push(slot));
            }
        }
        self.pool.with_mut(slot, |p| {
            p.kctx.lr = entry;
            p.kctx.x19_x29[0] = arg;
        });
        let pid = ctx.kernel.containers.alloc_local_pid(container);
        self.pool.with_mut(slot, |p| p.local_pid = pid);
        ctx.kernel.sched.activate(self, &ctx.kernel.containers, slot, false);
    }

    /// spec.md §4.6, `exit`. The bookkeeping half of "never returns":
    /// the actual divergence is the switch trampoline jumping away,
    /// which this crate does not implement (see module docs on
    /// [`crate::sched`]).
    pub fn exit(&self, ctx: &KCtx<'_>, code: i32) {
        let me = ctx.current_slot();
        let container = self.container_of(me);
        let root = ctx.kernel.containers.root_proc(container).unwrap_or(me);

        let (live, exited) = self.pool.with_mut(me, |p| (core::mem::take(&mut p.children), core::mem::take(&mut p.exited_children)));

        for &child in live.iter() {
            self.pool.with_mut(child, |p| p.parent = Some(root));
            if root != me {
                self.pool.with_mut(root, |p| p.children.push(child));
            }
        }
        for &child in exited.iter() {
            self.pool.with_mut(child, |p| p.parent = Some(root));
            if root != me {
                self.pool.with_mut(root, |p| p.exited_children.push(child));
            }
            self.child_exit[root].post(ctx);
        }

        if let Some(parent) = self.pool.with(me, |p| p.parent) {
            self.pool.with_mut(parent, |p| {
                if let Some(pos) = p.children.iter().position(|&c| c == me) {
                    p.children.remove(pos);
                }
                p.exited_children.push(me);
            });
            self.pool.with_mut(me, |p| p.exit_code = code);
            self.child_exit[parent].post(ctx);
        }

        ctx.kernel.sched.sched(ctx, 0, ProcState::Zombie);
    }

    /// spec.md §4.6, `wait`. Returns `(exit_code, local_pid)` of a
    /// reaped child, or `None` if the caller has no live or exited
    /// children.
    pub fn wait(&self, ctx: &KCtx<'_>) -> Option<(i32, u32)> {
        let me = ctx.current_slot();
        loop {
            let has_children = self.pool.with(me, |p| !p.children.is_empty() || !p.exited_children.is_empty());
            if !has_children {
                return None;
            }
            if let Some(child) = self.pool.with_mut(me, |p| p.exited_children.pop()) {
                let (code, pid, container, kstack) = self.pool.with(child, |p| (p.exit_code, p.local_pid, p.container, p.kstack));
                ctx.kernel.containers.free_local_pid(container, pid);
                if let Some(page) = kstack {
                    ctx.kernel.page_alloc.free(page);
                }
                // SAFETY: see `fork`/`install_address_space`; `child` is
                // already unreachable from anyone but us (its exited-child
                // entry was just popped), so its address space outlives
                // this call and the pool's lock is never held reentrantly.
                let addrspace: *const AddressSpace = self.pool.with(child, |p| &p.addrspace as *const AddressSpace);
                unsafe { (*addrspace).destroy(ctx, ctx.kernel) };
                self.pool.free(child);
                return Some((code, pid));
            }
            self.child_exit[me].wait(ctx);
        }
    }

    /// spec.md §4.6, `fork` (`original_source/src/kernel/proc.c`'s
    /// `fork`, §8 scenario S6): clones the calling process's address
    /// space copy-on-write, duplicates its open files and `cwd`, and
    /// activates the child runnable. Returns the child's slot.
    ///
    /// The parent and child address spaces are fetched with two
    /// separate, non-nested `with` calls rather than one nested pair,
    /// since [`Pool`] serializes every slot behind a single coarse lock
    /// and re-entering it from the same caller would deadlock (`cow_clone`
    /// itself locks both address spaces in turn, so neither `with` call
    /// may still be held open when it runs).
    pub fn fork(&self, ctx: &KCtx<'_>, kernel: &Kernel) -> usize {
        let me = ctx.current_slot();
        let container = self.container_of(me);
        let child = self.create_proc(ctx, container);

        let parent_as: *const AddressSpace = self.pool.with(me, |p| &p.addrspace as *const AddressSpace);
        let child_as: *const AddressSpace = self.pool.with(child, |p| &p.addrspace as *const AddressSpace);
        // SAFETY: both slots are allocated and live for the rest of this
        // call (`me` is the running process, `child` was just created and
        // is not yet visible to anything else), and the pointers are used
        // only after their originating `with` call returned, so the
        // pool's lock is never held reentrantly.
        unsafe { (*parent_as).cow_clone(ctx, kernel, &*child_as) };

        let (uctx, cwd, files) = self.pool.with(me, |p| (p.uctx, p.cwd, p.files));
        let mut child_files = [None; NOFILE];
        for (slot, fd) in files.iter().enumerate() {
            if let Some(fd) = fd {
                child_files[slot] = Some(kernel.files.dup(*fd));
            }
        }

        self.pool.with_mut(child, |p| {
            p.uctx = uctx;
            p.uctx.regs[0] = 0; // fork's return value in the child
            p.cwd = cwd;
            p.files = child_files;
            p.parent = Some(me);
        });
        self.pool.with_mut(me, |p| p.children.push(child));

        let pid = ctx.kernel.containers.alloc_local_pid(container);
        self.pool.with_mut(child, |p| p.local_pid = pid);
        ctx.kernel.sched.activate(self, &ctx.kernel.containers, child, false);
        child
    }

    /// Swaps in a freshly built address space in place of the calling
    /// process's current one and resets its saved user registers to the
    /// new entry point/stack (spec.md §6's `execve`). Callers only reach
    /// this once the new address space has been built successfully, so a
    /// failed load never touches the process being exec'd into (spec.md
    /// §7, "Bad ELF").
    pub fn install_address_space(&self, ctx: &KCtx<'_>, kernel: &Kernel, slot: usize, new_as: AddressSpace, entry: u64, sp: u64) {
        // SAFETY: see `fork`; `slot` is the calling process and stays
        // live for the duration of this call.
        let old: *const AddressSpace = self.pool.with(slot, |p| &p.addrspace as *const AddressSpace);
        unsafe { (*old).destroy(ctx, kernel) };
        self.pool.with_mut(slot, |p| {
            p.addrspace = new_as;
            p.uctx = UserContext::default();
            p.uctx.elr = entry;
            p.uctx.sp = sp;
        });
    }

    /// spec.md §4.6, `kill`: `pid` is scoped to the caller's container.
    pub fn kill(&self, ctx: &KCtx<'_>, pid: u32) -> bool {
        let me = ctx.current_slot();
        let container = self.container_of(me);
        for slot in 0..NPROC {
            if !self.pool.is_allocated(slot) {
                continue;
            }
            let matches = self
                .pool
                .with(slot, |p| p.container == container && p.local_pid == pid && !matches!(p.state, ProcState::Unused | ProcState::Zombie));
            if matches {
                self.pool.with_mut(slot, |p| p.killed = true);
                ctx.kernel.sched.activate(self, &ctx.kernel.containers, slot, true);
                return true;
            }
        }
        false
    }

    /// Exposes the calling process's address space behind a raw pointer,
    /// for syscall argument fetching (`copy_in`/`copy_in_str`/`copyout`)
    /// that must not hold the process table's own lock across a
    /// possible sleep (spec.md §5: "Spinlocks must be released before
    /// suspension points" — [`AddressSpace`]'s own sleeplock can block).
    pub fn addrspace_ptr(&self, slot: usize) -> *const AddressSpace {
        self.pool.with(slot, |p| &p.addrspace as *const AddressSpace)
    }

    /// Finds a free fd slot in `slot`'s table and claims it for `file`,
    /// a [`crate::fs::file::FileTable`] id (spec.md §6's `open`/`pipe`).
    pub fn alloc_fd(&self, slot: usize, file: usize) -> Option<usize> {
        self.pool.with_mut(slot, |p| {
            let fd = p.files.iter().position(Option::is_none)?;
            p.files[fd] = Some(file);
            Some(fd)
        })
    }

    /// Looks up the file-table id behind fd `fd` in `slot`'s table.
    pub fn fd_file(&self, slot: usize, fd: usize) -> Option<usize> {
        self.pool.with(slot, |p| p.files.get(fd).copied().flatten())
    }

    /// Clears fd `fd` in `slot`'s table, returning the file-table id it
    /// named, if any (spec.md §6's `close`).
    pub fn take_fd(&self, slot: usize, fd: usize) -> Option<usize> {
        self.pool.with_mut(slot, |p| p.files.get_mut(fd).and_then(Option::take))
    }

    /// The calling process's current directory, defaulting to the
    /// filesystem root for a process that has never `chdir`'d.
    pub fn cwd(&self, slot: usize) -> u32 {
        self.pool.with(slot, |p| p.cwd.unwrap_or(crate::fs::path::ROOT_INODE))
    }

    #[cfg(test)]
    pub fn alloc_raw(&self, container: usize) -> usize {
        self.pool.alloc(|| Process::new(container)).expect("no free process slots")
    }

    #[cfg(test)]
    pub fn force_state(&self, slot: usize, state: ProcState) {
        self.pool.with_mut(slot, |p| p.state = state);
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts the calling process to sleep and hands control to the
/// scheduler (called from [`crate::lock::semaphore::Semaphore::wait`]).
/// Returns whether the process was killed while parked; only
/// meaningful when `alertable`.
pub fn park_current(ctx: &KCtx<'_>, alertable: bool) -> bool {
    let slot = ctx.current_slot();
    let new_state = if alertable { ProcState::Sleeping } else { ProcState::DeepSleeping };
    ctx.kernel.sched.sched(ctx, 0, new_state);
    if alertable {
        ctx.kernel.procs.with(slot, |p| p.killed)
    } else {
        false
    }
}

/// Wakes the process in process-table slot `slot` (called from
/// [`crate::lock::semaphore::Semaphore::post`]).
pub fn activate_slot(ctx: &KCtx<'_>, slot: usize) {
    ctx.kernel.sched.activate(&ctx.kernel.procs, &ctx.kernel.containers, slot, false);
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
        f(&kernel)
    }

    #[test]
    fn kill_sets_the_killed_flag_on_a_live_process() {
        with_kernel(|kernel| {
            kernel.containers.init();
            let caller = kernel.procs.alloc_raw(container::ROOT_CONTAINER);
            let target = kernel.procs.alloc_raw(container::ROOT_CONTAINER);
            kernel.procs.with_mut(target, |p| {
                p.state = ProcState::Sleeping;
                p.local_pid = 5;
            });
            let ctx = kernel.ctx(0);
            kernel.sched.set_idle(0, caller);
            kernel.sched.context_in(&kernel.procs, 0, caller, 0);
            assert!(kernel.procs.kill(&ctx, 5));
            assert!(kernel.procs.with(target, |p| p.killed));
        });
    }

    /// spec.md §8, property 7 ("Orphan reparenting") and scenario S7:
    /// after a parent `exit`s, every former live or already-exited child
    /// of it ends up parented by the container's root process, not by
    /// the exiting process.
    #[test]
    fn exit_reparents_live_and_exited_children_to_container_root() {
        with_kernel(|kernel| {
            kernel.containers.init();
            let sub_container = kernel.containers.create(container::ROOT_CONTAINER);
            let root = kernel.procs.alloc_raw(sub_container);
            kernel.containers.set_root_proc(sub_container, root);

            let parent = kernel.procs.alloc_raw(sub_container);
            let live_child = kernel.procs.alloc_raw(sub_container);
            let already_exited_child = kernel.procs.alloc_raw(sub_container);
            kernel.procs.with_mut(live_child, |p| p.parent = Some(parent));
            kernel.procs.with_mut(already_exited_child, |p| p.parent = Some(parent));
            kernel.procs.with_mut(parent, |p| {
                p.parent = Some(root);
                p.children.push(live_child);
                p.exited_children.push(already_exited_child);
            });

            let idle = kernel.procs.alloc_raw(container::IDLE_CONTAINER);
            kernel.sched.set_idle(0, idle);
            kernel.sched.context_in(&kernel.procs, 0, parent, 0);
            let ctx = kernel.ctx(0);

            kernel.procs.exit(&ctx, 0);

            assert_eq!(kernel.procs.with(live_child, |p| p.parent), Some(root));
            assert_eq!(kernel.procs.with(already_exited_child, |p| p.parent), Some(root));
            assert!(kernel.procs.with(root, |p| p.children.contains(&live_child)));
            assert!(kernel.procs.with(root, |p| p.exited_children.contains(&already_exited_child)));
            assert!(kernel.procs.with(root, |p| p.exited_children.contains(&parent)));
        });
    }

    /// spec.md §4.6 `wait`/§8 scenario S5: reaping a zombie child returns
    /// its exit code and local pid, frees its container-local pid and
    /// process-table slot, and a second `wait` with no children left
    /// reports none.
    #[test]
    fn wait_reaps_an_exited_child_and_a_second_wait_reports_no_children() {
        with_kernel(|kernel| {
            kernel.containers.init();
            let parent = kernel.procs.alloc_raw(container::ROOT_CONTAINER);
            let child = kernel.procs.alloc_raw(container::ROOT_CONTAINER);
            let local_pid = kernel.containers.alloc_local_pid(container::ROOT_CONTAINER);
            kernel.procs.with_mut(child, |p| {
                p.parent = Some(parent);
                p.exit_code = 7;
                p.local_pid = local_pid;
            });
            kernel.procs.with_mut(parent, |p| p.exited_children.push(child));

            let idle = kernel.procs.alloc_raw(container::IDLE_CONTAINER);
            kernel.sched.set_idle(0, idle);
            kernel.sched.context_in(&kernel.procs, 0, parent, 0);
            let ctx = kernel.ctx(0);

            let reaped = kernel.procs.wait(&ctx).expect("child already exited, should reap without blocking");
            assert_eq!(reaped, (7, local_pid));
            assert_eq!(kernel.procs.wait(&ctx), None);
        });
    }
}
