//! Container tree: scheduling groups with their own local-pid namespace
//! (spec.md §3 "Container", §4.6 "Containers").
//!
//! Grounded on `original_source/src/kernel/proc.h`'s `struct container`;
//! `local_pids` is modeled as a single `u64` free-bitmap since
//! `NPROC == 64` fits one machine word exactly, rather than the
//! original's `struct bitmap`.
use crate::mm::slab::Pool;
use crate::param::NCONTAINER;

/// Slot of the root container: its own parent, holds no root process of
/// its own (the boot "root process" lives directly under it).
pub const ROOT_CONTAINER: usize = 0;
/// Slot of the container holding every CPU's idle process. Never
/// scheduled as a CFS entity (spec.md §4.5, "Idle").
pub const IDLE_CONTAINER: usize = 1;

pub struct Container {
    pub parent: usize,
    pub root_proc: Option<usize>,
    /// One bit per possible local pid; `1` means free.
    local_pids_free: u64,
}

impl Container {
    fn new(parent: usize) -> Self {
        Self {
            parent,
            root_proc: None,
            local_pids_free: u64::MAX,
        }
    }

    /// Pops the lowest-numbered free local pid (spec.md §4.6,
    /// `start_proc`: "Allocate a local pid from the container's
    /// bitmap").
    pub fn alloc_local_pid(&mut self) -> Option<u32> {
        if self.local_pids_free == 0 {
            return None;
        }
        let bit = self.local_pids_free.trailing_zeros();
        self.local_pids_free &= !(1 << bit);
        Some(bit)
    }

    pub fn free_local_pid(&mut self, pid: u32) {
        assert!(pid < 64, "local pid out of range");
        assert!(self.local_pids_free & (1 << pid) == 0, "double free of local pid {pid}");
        self.local_pids_free |= 1 << pid;
    }
}

pub struct ContainerTable {
    pool: Pool<Container, NCONTAINER>,
}

impl ContainerTable {
    pub const fn new() -> Self {
        Self {
            pool: Pool::new("containers"),
        }
    }

    /// Creates the root and idle containers. Must run once at boot,
    /// before any `create_container`.
    pub fn init(&self) {
        let root = self.pool.alloc(|| Container::new(ROOT_CONTAINER)).expect("container pool just initialized");
        assert_eq!(root, ROOT_CONTAINER, "root container did not land in slot 0");
        let idle = self.pool.alloc(|| Container::new(ROOT_CONTAINER)).expect("container pool just initialized");
        assert_eq!(idle, IDLE_CONTAINER, "idle container did not land in slot 1");
    }

    /// Allocates a new container whose parent is `parent` (spec.md
    /// §4.6: "links its parent to the creator's container").
    pub fn create(&self, parent: usize) -> usize {
        self.pool.alloc(|| Container::new(parent)).expect("no free container slots")
    }

    pub fn parent(&self, slot: usize) -> usize {
        self.pool.with(slot, |c| c.parent)
    }

    pub fn root_proc(&self, slot: usize) -> Option<usize> {
        self.pool.with(slot, |c| c.root_proc)
    }

    pub fn set_root_proc(&self, slot: usize, proc_slot: usize) {
        self.pool.with_mut(slot, |c| c.root_proc = Some(proc_slot));
    }

    pub fn alloc_local_pid(&self, slot: usize) -> u32 {
        self.pool
            .with_mut(slot, |c| c.alloc_local_pid())
            .expect("container has no free local pids")
    }

    pub fn free_local_pid(&self, slot: usize, pid: u32) {
        self.pool.with_mut(slot, |c| c.free_local_pid(pid));
    }
}

impl Default for ContainerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_idle_land_in_fixed_slots() {
        let t = ContainerTable::new();
        t.init();
        assert_eq!(t.parent(ROOT_CONTAINER), ROOT_CONTAINER);
        assert_eq!(t.parent(IDLE_CONTAINER), ROOT_CONTAINER);
    }

    #[test]
    fn local_pid_alloc_reuses_freed_bits() {
        let t = ContainerTable::new();
        t.init();
        let c = t.create(ROOT_CONTAINER);
        let a = t.alloc_local_pid(c);
        let b = t.alloc_local_pid(c);
        assert_ne!(a, b);
        t.free_local_pid(c, a);
        let reused = t.alloc_local_pid(c);
        assert_eq!(reused, a);
    }
}
