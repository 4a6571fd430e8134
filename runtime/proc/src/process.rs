//! Process Descriptor
//!
//! One descriptor per running or zombie process. It records:
//! - the pid, fixed for the descriptor's lifetime
//! - the address space, owned while the process runs
//! - the exit state, `Running` until the process calls `_exit`
//!
//! ## Lifecycle
//!
//! ```text
//! fork ──► Running ──_exit──► Zombie(code) ──waitpid/reap──► slot freed
//!             │
//!             └──thread not started──► Abandoned ──► slot freed
//! ```
//!
//! The exit state is a single tagged value behind one lock, paired with a
//! condition variable that `_exit` broadcasts on. A waiter can therefore
//! never observe "exited" without the code. The exit state is the only part
//! of a descriptor that outlives the process's thread and address space.

use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::{AddressSpace, ProcError};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for Pid {
    type Error = ProcError;

    /// Decode a pid syscall argument; zero and negative ids name no process
    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        if raw > 0 {
            Ok(Self(raw as u32))
        } else {
            Err(ProcError::NoSuchProcess { pid: raw as i64 })
        }
    }
}

/// Exit state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Has not called `_exit`
    Running,

    /// Exited with this code; status not yet reclaimed
    Zombie(i32),

    /// Creation rolled back before its thread started; has no status
    Abandoned,
}

impl ProcessState {
    pub fn is_zombie(&self) -> bool {
        matches!(self, ProcessState::Zombie(_))
    }
}

/// Process descriptor
pub struct Process<A: AddressSpace> {
    pid: Pid,

    name: String,

    /// `None` once `_exit` has released it
    address_space: spin::Mutex<Option<A>>,

    /// Exit state, guarded for `exited`
    state: Mutex<ProcessState>,

    /// Broadcast when `state` leaves `Running`
    exited: Condvar,
}

impl<A: AddressSpace> Process<A> {
    pub(crate) fn new(pid: Pid, name: &str, address_space: Option<A>) -> Self {
        Self {
            pid,
            name: name.into(),
            address_space: spin::Mutex::new(address_space),
            state: Mutex::new(ProcessState::Running),
            exited: Condvar::new(),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current exit state (non-blocking)
    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    pub fn has_address_space(&self) -> bool {
        self.address_space.lock().is_some()
    }

    /// Run `f` against the owned address space, `None` if already released
    pub(crate) fn with_address_space<R>(&self, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        self.address_space.lock().as_mut().map(f)
    }

    /// Swap the owned address space, returning the previous one
    pub(crate) fn set_address_space(&self, address_space: Option<A>) -> Option<A> {
        core::mem::replace(&mut *self.address_space.lock(), address_space)
    }

    /// Publish the exit code and wake every waiter
    ///
    /// # Panics
    /// If the process already exited or was abandoned.
    pub(crate) fn record_exit(&self, exit_code: i32) {
        let mut state = self.lock_state();
        match *state {
            ProcessState::Running => {}
            ProcessState::Zombie(previous) => panic!(
                "pid {} exited twice (status {} then {})",
                self.pid, previous, exit_code
            ),
            ProcessState::Abandoned => panic!("abandoned pid {} called _exit", self.pid),
        }
        *state = ProcessState::Zombie(exit_code);
        self.exited.notify_all();
    }

    /// Mark a process whose thread never started and wake every waiter
    ///
    /// Waiters that looked the process up before its creation was rolled
    /// back see `None` from [`Process::wait_for_exit`].
    pub(crate) fn abandon(&self) {
        let mut state = self.lock_state();
        if *state == ProcessState::Running {
            *state = ProcessState::Abandoned;
            self.exited.notify_all();
        }
    }

    /// Block until the process leaves `Running`
    ///
    /// Returns the exit code, or `None` if the process was abandoned.
    /// Returns immediately for a zombie. The state lock is not held on return.
    pub(crate) fn wait_for_exit(&self) -> Option<i32> {
        let state = self
            .exited
            .wait_while(self.lock_state(), |state| *state == ProcessState::Running)
            .unwrap_or_else(PoisonError::into_inner);

        match *state {
            ProcessState::Zombie(code) => Some(code),
            ProcessState::Abandoned => None,
            ProcessState::Running => unreachable!("woke with pid {} still running", self.pid),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: AddressSpace> Drop for Process<A> {
    fn drop(&mut self) {
        // A fork that never started the child, or a process torn down
        // with its kernel before it exited
        if let Some(address_space) = self.address_space.get_mut().take() {
            address_space.deactivate();
            address_space.destroy();
        }
    }
}

impl<A: AddressSpace> fmt::Debug for Process<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("has_address_space", &self.has_address_space())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAddressSpace, MockPlatform};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn process(pid: u32) -> Process<MockAddressSpace> {
        Process::new(Pid::new(pid), "test", None)
    }

    #[test]
    fn test_pid_from_syscall_arg() {
        assert_eq!(Pid::try_from(7i32), Ok(Pid::new(7)));
        assert_eq!(Pid::try_from(0i32), Err(ProcError::NoSuchProcess { pid: 0 }));
        assert_eq!(Pid::try_from(-3i32), Err(ProcError::NoSuchProcess { pid: -3 }));
    }

    #[test]
    fn test_new_process_is_running() {
        let proc = process(2);
        assert_eq!(proc.pid(), Pid::new(2));
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(!proc.has_address_space());
    }

    #[test]
    fn test_wait_after_exit_returns_immediately() {
        let proc = process(2);
        proc.record_exit(-17);
        assert_eq!(proc.state(), ProcessState::Zombie(-17));
        assert_eq!(proc.wait_for_exit(), Some(-17));
        assert_eq!(proc.wait_for_exit(), Some(-17));
    }

    #[test]
    fn test_wait_blocks_until_exit() {
        let proc = Arc::new(process(3));
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let proc = Arc::clone(&proc);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let code = proc.wait_for_exit();
                assert!(released.load(Ordering::SeqCst));
                code
            })
        };

        thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        proc.record_exit(42);

        assert_eq!(waiter.join().unwrap(), Some(42));
    }

    #[test]
    fn test_exit_wakes_every_waiter() {
        let proc = Arc::new(process(4));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let proc = Arc::clone(&proc);
                thread::spawn(move || proc.wait_for_exit())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        proc.record_exit(i32::MIN);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(i32::MIN));
        }
    }

    #[test]
    #[should_panic(expected = "exited twice")]
    fn test_double_exit_is_fatal() {
        let proc = process(5);
        proc.record_exit(0);
        proc.record_exit(1);
    }

    #[test]
    fn test_abandon_wakes_waiters() {
        let proc = Arc::new(process(8));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let proc = Arc::clone(&proc);
                thread::spawn(move || proc.wait_for_exit())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        proc.abandon();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), None);
        }
        assert_eq!(proc.state(), ProcessState::Abandoned);
        assert!(!proc.state().is_zombie());
    }

    #[test]
    fn test_abandon_after_exit_keeps_status() {
        let proc = process(9);
        proc.record_exit(5);
        proc.abandon();
        assert_eq!(proc.wait_for_exit(), Some(5));
    }

    #[test]
    fn test_address_space_swap() {
        let platform = MockPlatform::new();
        let proc = Process::new(Pid::new(6), "test", Some(platform.new_address_space()));
        assert!(proc.has_address_space());

        let space = proc.set_address_space(None);
        assert!(space.is_some());
        assert!(!proc.has_address_space());
        assert_eq!(proc.with_address_space(|_| ()), None);
    }

    #[test]
    fn test_drop_destroys_owned_address_space() {
        let platform = MockPlatform::new();
        let proc = Process::new(Pid::new(7), "test", Some(platform.new_address_space()));
        assert_eq!(platform.live_address_spaces(), 1);

        drop(proc);
        assert_eq!(platform.live_address_spaces(), 0);
        assert_eq!(platform.destroyed_address_spaces(), 1);
    }
}
