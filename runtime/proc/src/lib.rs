//! Process Lifecycle Core - fork, _exit, waitpid and getpid for KaaL
//!
//! # Purpose
//! Creates, duplicates, suspends-on-wait and tears down user processes, and
//! hands a saved execution context from a parent to its forked child.
//!
//! # Integration Points
//! - Depends on: thread scheduler, address-space layer, kernel heap
//!   (all reached through the [`Platform`] and [`AddressSpace`] traits)
//! - Provides to: the syscall trap handler ([`syscall::dispatch`])
//! - IPC endpoints: none
//! - Capabilities required: none
//!
//! # Architecture
//! A fixed-capacity [`ProcessTable`] is the only structure shared between
//! processes. Each [`Process`] descriptor owns its address space and a
//! tagged exit state (`Running` / `Zombie(code)`) guarded by one lock and
//! one condition variable. Fork reserves a pid, deep-copies the address
//! space, derives the child's trap frame as a value and hands it to a new
//! thread. Exit deactivates, then destroys, then publishes the status.
//! Waitpid blocks on the target's condition variable and copies the status
//! out to user memory.
//!
//! # Testing Strategy
//! - Unit tests: trap-frame derivation, table allocation/reclaim, exit state
//! - Integration tests: fork/exit/waitpid on the host mock platform
//! - Benchmarks: fork + exit + waitpid round trip (criterion)

/// Trace a syscall when built with `--features debug-syscall`
macro_rules! ksyscall_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug-syscall")]
        log::trace!($($arg)*);
    };
}

mod config;
mod context;
mod manager;
mod process;
mod table;

pub mod platform;
pub mod syscall;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{ProcConfig, ReapPolicy, DEFAULT_MAX_PROCESSES, PID_MIN};
pub use context::{TrapFrame, INSTRUCTION_SIZE, NUM_GPRS};
pub use manager::ProcessManager;
pub use platform::{AddressSpace, KernelObject, Platform, ThreadEntry, UserPtr};
pub use process::{Pid, Process, ProcessState};
pub use syscall::WaitOptions;
pub use table::ProcessTable;

use thiserror::Error;

/// Error numbers surfaced to user space (negated in `x0`)
pub mod errno {
    pub const ESRCH: i32 = 3;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
}

/// Error types for process operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Process table full ({capacity} slots)")]
    OutOfIds { capacity: usize },

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("No such process: {pid}")]
    NoSuchProcess { pid: i64 },

    #[error("Bad user address: {addr:#x}")]
    BadAddress { addr: usize },

    #[error("Unknown syscall number: {number}")]
    UnknownSyscall { number: u64 },
}

impl ProcError {
    /// Positive errno for this error
    pub fn errno(&self) -> i32 {
        match self {
            ProcError::OutOfMemory => errno::ENOMEM,
            ProcError::OutOfIds { .. } => errno::EAGAIN,
            ProcError::InvalidArgument => errno::EINVAL,
            ProcError::NoSuchProcess { .. } => errno::ESRCH,
            ProcError::BadAddress { .. } => errno::EFAULT,
            ProcError::UnknownSyscall { .. } => errno::ENOSYS,
        }
    }
}

pub type Result<T> = core::result::Result<T, ProcError>;
