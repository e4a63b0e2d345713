//! The kernel-wide singleton bundle and the context handle threaded
//! through internal APIs (spec.md §9, "Global mutable state": "inject
//! them into a kernel-context struct passed to all internal APIs rather
//! than relying on hidden globals").
//!
//! Grounded on the teacher's `kernel_builder()`/`KernelCtx` pairing,
//! generalized from a pinned self-referential singleton to plain
//! references: `Kernel` owns every subsystem named in spec.md §2's
//! component table, and [`KCtx`] is a `(&Kernel, cpu id)` pair handed to
//! any call that might need to identify "the calling process" or touch
//! a subsystem.
use crate::fs::file::FileTable;
use crate::fs::pipe::PipeTable;
use crate::fs::FileSystem;
use crate::hal::{BlockDevice, Console};
use crate::mm::{PageAllocator, PageStore};
use crate::param::NCPU;
use crate::proc::container::ContainerTable;
use crate::proc::ProcTable;
use crate::sched::Scheduler;
use crate::vm::{PageRefTable, SwapArea};

/// Every process-wide singleton named in spec.md §2 and §9, owned in
/// one place instead of module-level `static`s.
pub struct Kernel {
    pub page_alloc: PageAllocator,
    /// Backing byte storage for every physical page (COW memcpy and
    /// swap I/O both need real content, not just liveness).
    pub page_store: PageStore,
    /// Global page reference counts (spec.md §4.4, "Page reference
    /// counts").
    pub pageref: PageRefTable,
    /// The fixed swap disk range (spec.md §4.4, "Swap").
    pub swap: SwapArea,
    pub fs: FileSystem,
    /// The system-wide open-file table (spec.md §6): shared, refcounted
    /// file objects that process fd tables index into.
    pub files: FileTable,
    /// The system-wide pipe table.
    pub pipes: PipeTable,
    pub procs: ProcTable,
    pub containers: ContainerTable,
    pub sched: Scheduler,
    pub disk: &'static dyn BlockDevice,
    pub console: &'static dyn Console,
}

impl Kernel {
    pub const fn new(disk: &'static dyn BlockDevice, console: &'static dyn Console, log_start: u32) -> Self {
        Self {
            page_alloc: PageAllocator::new(),
            page_store: PageStore::new(),
            pageref: PageRefTable::new(),
            swap: SwapArea::new(),
            fs: FileSystem::new(log_start),
            files: FileTable::new(),
            pipes: PipeTable::new(),
            procs: ProcTable::new(),
            containers: ContainerTable::new(),
            sched: Scheduler::new(),
            disk,
            console,
        }
    }

    /// Brings every subsystem up from its on-disk or static initial
    /// state. Must run once, from the boot CPU, before any other API on
    /// `self` is called (mirrors the teacher's top-level `kernel_init`).
    pub fn init(&self, num_pages: usize) {
        self.page_alloc.init(num_pages);
        self.fs.mount(self.disk);
        self.containers.init();
    }

    /// Builds the context handle for code running as CPU `cpu`.
    pub fn ctx(&self, cpu: usize) -> KCtx<'_> {
        assert!(cpu < NCPU, "cpu id out of range");
        KCtx { kernel: self, cpu }
    }

    /// spec.md §4.6, "Containers": creates a new container under the
    /// calling process's own container, plus its root process, and
    /// schedules that root process to start running `entry(arg)`.
    /// Returns `(container slot, root process slot)`.
    pub fn create_container(&self, ctx: &KCtx<'_>, entry: u64, arg: u64) -> (usize, usize) {
        let caller = ctx.current_slot();
        let parent_container = self.procs.container_of(caller);
        let container = self.containers.create(parent_container);
        let root = self.procs.create_proc(ctx, container);
        self.containers.set_root_proc(container, root);
        self.procs.start_proc(ctx, root, entry, arg);
        (container, root)
    }
}

/// A `(&Kernel, calling cpu)` pair. Every blocking-capable API takes one
/// of these instead of reaching for a global — see module docs.
#[derive(Clone, Copy)]
pub struct KCtx<'k> {
    pub kernel: &'k Kernel,
    pub cpu: usize,
}

impl<'k> KCtx<'k> {
    /// The process-table slot of the process currently running on this
    /// context's CPU. Panics if called from a CPU with nothing
    /// scheduled on it (every code path that can legitimately block
    /// runs on behalf of some process, even the per-CPU idle one).
    pub fn current_slot(&self) -> usize {
        self.kernel
            .sched
            .running_on(self.cpu)
            .expect("current_slot: no process scheduled on this cpu")
    }
}
