//! System call handling
//!
//! [`dispatch`] decodes a trapped frame and routes it to one of the
//! process syscalls:
//! - `fork`: duplicate the caller, the child resumes with 0
//! - `_exit`: publish a status and terminate the calling thread
//! - `waitpid`: block for a process's status and copy it to user memory
//! - `getpid`: report the caller's pid

pub mod numbers;

mod exit;
mod fork;
mod wait;

pub use wait::WaitOptions;

use std::sync::Arc;

use crate::{Platform, ProcError, ProcessManager, TrapFrame, UserPtr};

/// Handle the syscall saved in `tf`
///
/// On return `x0` holds the result, or `-(errno)` on failure, and the
/// frame resumes after the trapping instruction. `_exit` does not return.
pub fn dispatch<P: Platform>(manager: &Arc<ProcessManager<P>>, tf: &mut TrapFrame) {
    let syscall_num = tf.syscall_number();
    let args = tf.syscall_args();

    ksyscall_debug!("[syscall] #{} args={:x?}", syscall_num, args);

    let result = match syscall_num {
        numbers::SYS_FORK => manager.sys_fork(tf).map(|pid| pid.as_u64()),
        numbers::SYS_EXIT => manager.sys_exit(args[0] as i32),
        numbers::SYS_WAITPID => manager
            .sys_waitpid(args[0] as i32, UserPtr::new(args[1] as usize), args[2] as i32)
            .map(|pid| pid.as_u64()),
        numbers::SYS_GETPID => Ok(manager.sys_getpid().as_u64()),
        _ => {
            log::warn!("[syscall] Unknown syscall number: {}", syscall_num);
            Err(ProcError::UnknownSyscall {
                number: syscall_num,
            })
        }
    };

    match result {
        Ok(value) => tf.set_return_value(value),
        Err(err) => {
            ksyscall_debug!("[syscall] #{} failed: {}", syscall_num, err);
            tf.set_error(err.errno());
        }
    }

    tf.advance_pc();
}
