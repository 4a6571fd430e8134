//! Process Manager - owns the process table and the platform
//!
//! The syscall handlers in [`crate::syscall`] are methods on
//! [`ProcessManager`]. The manager is shared as an `Arc` so a forked
//! child's thread entry can hold it for as long as the child runs.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let manager = ProcessManager::new(platform, ProcConfig::default());
//!
//! // Start the first user process on its own thread
//! let init = manager.spawn_init("init", address_space, TrapFrame::user(entry, sp))?;
//!
//! // Trap handler
//! syscall::dispatch(&manager, &mut tf);
//! ```

use std::sync::Arc;

use crate::{
    AddressSpace, Pid, Platform, ProcConfig, ProcError, Process, ProcessState, ProcessTable,
    ReapPolicy, Result, ThreadEntry, TrapFrame,
};
use crate::table::Reclaim;

/// Process lifecycle manager
pub struct ProcessManager<P: Platform> {
    pub(crate) table: ProcessTable<P::AddressSpace>,
    pub(crate) platform: P,
    config: ProcConfig,
}

impl<P: Platform> ProcessManager<P> {
    pub fn new(platform: P, config: ProcConfig) -> Arc<Self> {
        log::info!(
            "[proc] process table: {} slots from pid {}, reap policy {:?}",
            config.max_processes,
            config.first_pid,
            config.reap_policy
        );

        Arc::new(Self {
            table: ProcessTable::new(config.first_pid, config.max_processes),
            platform,
            config,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &ProcConfig {
        &self.config
    }

    /// Make the calling thread a user process with no parent
    ///
    /// Binds the thread to the new pid and activates `address_space`.
    ///
    /// # Errors
    /// `OutOfIds` if the table is full; `address_space` is destroyed.
    pub fn bootstrap(&self, name: &str, address_space: P::AddressSpace) -> Result<Pid> {
        let (pid, process) = self.table.allocate(name, Some(address_space), None)?;

        self.platform.attach_current(pid);
        process.with_address_space(|space| space.activate());

        log::info!("[proc] bootstrapped '{}' as pid {}", name, pid);
        Ok(pid)
    }

    /// Start a user process with no parent on a new thread
    ///
    /// The thread enters user mode with `tf`.
    ///
    /// # Errors
    /// `OutOfIds` if the table is full, `OutOfMemory` if no thread can be
    /// created. Nothing stays allocated on error.
    pub fn spawn_init(
        self: &Arc<Self>,
        name: &str,
        address_space: P::AddressSpace,
        tf: TrapFrame,
    ) -> Result<Pid> {
        let (pid, process) = self.table.allocate(name, Some(address_space), None)?;

        let manager = Arc::clone(self);
        let entry: ThreadEntry = Box::new(move || manager.enter_user_thread(tf));

        if let Err(err) = self.platform.thread_fork(name, pid, entry) {
            log::warn!("[proc] failed to start '{}': {}", name, err);
            self.abandon(&process);
            return Err(err);
        }

        log::info!("[proc] spawned '{}' as pid {}", name, pid);
        Ok(pid)
    }

    /// Roll back a process whose thread could not be started
    ///
    /// Waiters that already looked it up are woken before the slot is freed.
    pub(crate) fn abandon(&self, process: &Arc<Process<P::AddressSpace>>) {
        process.abandon();
        self.table.discard(process);
    }

    /// Body of every user thread: activate the bound process's space and
    /// drop to user mode
    pub(crate) fn enter_user_thread(self: Arc<Self>, tf: TrapFrame) -> ! {
        let process = self.current_process();
        let activated = process.with_address_space(|space| space.activate());
        assert!(
            activated.is_some(),
            "pid {} started without an address space",
            process.pid()
        );
        drop(process);

        P::enter_usermode(&self, tf)
    }

    /// Pid bound to the calling thread
    ///
    /// # Panics
    /// If the calling thread does not belong to a process.
    pub fn current_pid(&self) -> Pid {
        match self.platform.current_pid() {
            Some(pid) => pid,
            None => panic!("syscall from a thread with no process"),
        }
    }

    /// Descriptor of the calling process
    ///
    /// # Panics
    /// If the calling thread's pid is not in the table.
    pub(crate) fn current_process(&self) -> Arc<Process<P::AddressSpace>> {
        let pid = self.current_pid();
        match self.table.lookup(pid) {
            Ok(process) => process,
            Err(err) => panic!("current process vanished from the table: {}", err),
        }
    }

    /// Free a zombie's pid
    ///
    /// The only way a zombie is reclaimed under [`ReapPolicy::Explicit`].
    ///
    /// # Errors
    /// `NoSuchProcess` if `pid` is not in the table, `InvalidArgument` if
    /// the process is still running.
    pub fn reap(&self, pid: Pid) -> Result<()> {
        let process = self.table.lookup(pid)?;
        if process.state() == ProcessState::Running {
            return Err(ProcError::InvalidArgument);
        }

        match self.table.reclaim(&process) {
            Reclaim::Freed | Reclaim::Deferred => {
                log::debug!("[proc] reaped pid {}", pid);
                Ok(())
            }
            Reclaim::Absent => Err(ProcError::NoSuchProcess {
                pid: pid.as_u64() as i64,
            }),
        }
    }

    /// Reclaim after a delivered status, if the policy says so
    pub(crate) fn reap_after_wait(&self, process: &Arc<Process<P::AddressSpace>>) {
        if self.config.reap_policy == ReapPolicy::OnWait {
            self.table.reclaim(process);
        }
    }

    /// Run `f` against a process's address space
    ///
    /// # Errors
    /// `NoSuchProcess` if `pid` is not in the table or has already
    /// released its space.
    pub fn with_address_space<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut P::AddressSpace) -> R,
    ) -> Result<R> {
        self.table
            .lookup(pid)?
            .with_address_space(f)
            .ok_or(ProcError::NoSuchProcess {
                pid: pid.as_u64() as i64,
            })
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.table.contains(pid)
    }

    /// Exit state of a process still in the table
    ///
    /// # Errors
    /// `NoSuchProcess` if `pid` is not in the table.
    pub fn state(&self, pid: Pid) -> Result<ProcessState> {
        Ok(self.table.lookup(pid)?.state())
    }

    /// Number of occupied table slots
    pub fn process_count(&self) -> usize {
        self.table.len()
    }
}

impl<P: Platform> core::fmt::Debug for ProcessManager<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("config", &self.config)
            .field("processes", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    fn manager(config: ProcConfig) -> Arc<ProcessManager<MockPlatform>> {
        ProcessManager::new(MockPlatform::new(), config)
    }

    #[test]
    fn test_bootstrap_binds_thread() {
        let mgr = manager(ProcConfig::default());
        let space = mgr.platform().new_address_space();

        let pid = mgr.bootstrap("init", space).unwrap();
        assert_eq!(pid, Pid::new(2));
        assert_eq!(mgr.current_pid(), pid);
        assert_eq!(mgr.state(pid), Ok(ProcessState::Running));
        assert_eq!(mgr.process_count(), 1);
        assert!(mgr.platform().active_space().is_some());
    }

    #[test]
    fn test_reap_running_process_rejected() {
        let mgr = manager(ProcConfig::default());
        let pid = mgr
            .bootstrap("init", mgr.platform().new_address_space())
            .unwrap();

        assert_eq!(mgr.reap(pid), Err(ProcError::InvalidArgument));
        assert_eq!(
            mgr.reap(Pid::new(40)),
            Err(ProcError::NoSuchProcess { pid: 40 })
        );
    }

    #[test]
    fn test_with_address_space() {
        let mgr = manager(ProcConfig::default());
        let pid = mgr
            .bootstrap("init", mgr.platform().new_address_space())
            .unwrap();

        let id = mgr.with_address_space(pid, |space| space.id()).unwrap();
        assert_eq!(mgr.platform().active_space(), Some(id));
        assert!(mgr.with_address_space(Pid::new(30), |_| ()).is_err());
    }

    #[test]
    fn test_bootstrap_table_full() {
        let config = ProcConfig {
            max_processes: 0,
            ..ProcConfig::default()
        };
        let mgr = manager(config);
        let result = mgr.bootstrap("init", mgr.platform().new_address_space());
        assert_eq!(result, Err(ProcError::OutOfIds { capacity: 0 }));
        assert_eq!(mgr.platform().live_address_spaces(), 0);
    }
}
