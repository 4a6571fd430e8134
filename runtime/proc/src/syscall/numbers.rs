//! System call numbers
//!
//! Numbering follows the OS/161 user ABI the test programs are built against.

/// Duplicate the calling process
pub const SYS_FORK: u64 = 0;

/// Terminate the calling process with a status (does not return)
pub const SYS_EXIT: u64 = 3;

/// Wait for a process to exit (pid, status ptr, options)
pub const SYS_WAITPID: u64 = 4;

/// Pid of the calling process
pub const SYS_GETPID: u64 = 5;
