//! Collaborator contracts consumed by the process core
//!
//! The scheduler, the address-space layer and the kernel heap live outside
//! this crate. A kernel plugs them in by implementing [`Platform`]; the host
//! test build uses [`crate::mock::MockPlatform`].

use std::sync::Arc;

use crate::{Pid, ProcessManager, Result, TrapFrame};

/// User virtual address supplied by a syscall argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserPtr(usize);

impl UserPtr {
    pub const NULL: UserPtr = UserPtr(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn addr(&self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// A process address space
///
/// Owned by exactly one [`Process`](crate::Process) while it runs.
pub trait AddressSpace: Send + Sized + 'static {
    /// Deep copy: no writable page may be shared with `self` afterwards
    ///
    /// # Errors
    /// `OutOfMemory` if frames or page tables cannot be allocated.
    fn duplicate(&self) -> Result<Self>;

    /// Load this space into the MMU of the running CPU
    fn activate(&self);

    /// Unload this space from the running CPU
    fn deactivate(&self);

    /// Release every frame and page table
    ///
    /// Must not be called while the space is active. May block.
    fn destroy(self);

    /// Copy `bytes` to user memory at `dest`
    ///
    /// # Errors
    /// `BadAddress` if any part of the destination is unmapped or read-only.
    fn copy_out(&mut self, dest: UserPtr, bytes: &[u8]) -> Result<()>;
}

/// Kernel objects fork allocates besides the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelObject {
    /// A process descriptor
    Process,

    /// The child's saved trap frame
    TrapFrame,
}

/// Thread entry handed to the scheduler
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler, kernel heap and user-mode entry
///
/// Every thread the scheduler runs on behalf of a process is bound to that
/// process's pid; [`current_pid`](Platform::current_pid) reports the binding
/// of the calling thread.
pub trait Platform: Send + Sync + Sized + 'static {
    type AddressSpace: AddressSpace;

    /// Reserve kernel heap for one object
    ///
    /// Platforms without heap accounting accept every allocation.
    ///
    /// # Errors
    /// `OutOfMemory` if the heap is exhausted.
    fn alloc_object(&self, object: KernelObject) -> Result<()> {
        let _ = object;
        Ok(())
    }

    /// Start a new thread bound to `pid` running `entry`
    ///
    /// # Errors
    /// `OutOfMemory` if no thread can be created. `entry` is dropped unrun.
    fn thread_fork(&self, name: &str, pid: Pid, entry: ThreadEntry) -> Result<()>;

    /// Pid the calling thread is bound to, if any
    fn current_pid(&self) -> Option<Pid>;

    /// Bind the calling thread to `pid`
    fn attach_current(&self, pid: Pid);

    /// Unbind the calling thread from `pid`
    fn detach_current(&self, pid: Pid);

    /// Terminate the calling thread
    fn thread_exit(&self) -> !;

    /// Restore `tf` and drop to user mode on the calling thread
    fn enter_usermode(manager: &Arc<ProcessManager<Self>>, tf: TrapFrame) -> !;

    /// The last running user process has exited
    fn last_process_exited(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_ptr() {
        assert!(UserPtr::NULL.is_null());
        let ptr = UserPtr::new(0x4000_1000);
        assert!(!ptr.is_null());
        assert_eq!(ptr.addr(), 0x4000_1000);
    }
}
