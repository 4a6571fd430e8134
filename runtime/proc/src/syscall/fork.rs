//! `fork` - duplicate the calling process

use std::sync::Arc;

use crate::{
    AddressSpace, KernelObject, Pid, Platform, ProcError, Process, ProcessManager, Result,
    ThreadEntry, TrapFrame,
};

impl<P: Platform> ProcessManager<P> {
    /// Create a child with a copy of the caller's address space
    ///
    /// The child thread resumes from `tf` with 0 in `x0`; the caller gets
    /// the child's pid. Every partial allocation is released on failure.
    /// The child is visible from the moment its thread is requested; if the
    /// thread cannot be started it is abandoned, and anyone already waiting
    /// on it gets `NoSuchProcess`.
    ///
    /// # Errors
    /// `OutOfMemory` if the pid, descriptor, address space, trap frame or
    /// thread cannot be allocated (a full table is reported the same way).
    pub fn sys_fork(self: &Arc<Self>, tf: &TrapFrame) -> Result<Pid> {
        let parent = self.current_process();

        self.platform
            .alloc_object(KernelObject::Process)
            .map_err(|err| fork_failed("process descriptor", err))?;
        let reservation = self
            .table
            .reserve()
            .map_err(|err| fork_failed("pid", err))?;
        let child_pid = reservation.pid();

        let address_space = match parent.with_address_space(|space| space.duplicate()) {
            Some(result) => result.map_err(|err| fork_failed("address space", err))?,
            None => panic!("pid {} forked without an address space", parent.pid()),
        };
        let child = Arc::new(Process::new(child_pid, "child process", Some(address_space)));

        self.platform
            .alloc_object(KernelObject::TrapFrame)
            .map_err(|err| fork_failed("trap frame", err))?;
        let child_tf = tf.derive_child();

        reservation.commit(Arc::clone(&child), Some(parent.pid()));

        let manager = Arc::clone(self);
        let entry: ThreadEntry = Box::new(move || manager.enter_user_thread(child_tf));

        if let Err(err) = self.platform.thread_fork(child.name(), child_pid, entry) {
            self.abandon(&child);
            return Err(fork_failed("thread", err));
        }

        log::debug!("[proc] pid {} forked pid {}", parent.pid(), child_pid);
        Ok(child_pid)
    }
}

fn fork_failed(what: &str, err: ProcError) -> ProcError {
    log::warn!("[proc] fork: {} allocation failed: {}", what, err);
    ProcError::OutOfMemory
}
