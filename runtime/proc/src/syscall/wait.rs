//! `waitpid` and `getpid`

use bitflags::bitflags;

use crate::{AddressSpace, Pid, Platform, ProcError, ProcessManager, Result, UserPtr};

bitflags! {
    /// `waitpid` option bits
    ///
    /// Recognised so the rejection can be logged precisely; no option is
    /// supported and any nonzero value is refused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Return immediately if the process has not exited
        const NOHANG = 1 << 0;
        /// Also report stopped processes
        const UNTRACED = 1 << 1;
    }
}

impl<P: Platform> ProcessManager<P> {
    /// Wait for `pid` to exit and store its status at `status`
    ///
    /// `pid` is the raw syscall argument. Blocks the calling thread only.
    /// The status lock is released before the copy to user memory. If the
    /// copy fails the zombie is kept, so the wait can be retried with a
    /// valid address.
    ///
    /// # Errors
    /// - `InvalidArgument` if `options` is nonzero (checked first), or if
    ///   `pid` is the caller's own pid
    /// - `NoSuchProcess` if no process has that pid, or its fork was rolled
    ///   back while this call waited
    /// - `BadAddress` if `status` is not writable by the caller
    pub fn sys_waitpid(&self, pid: i32, status: UserPtr, options: i32) -> Result<Pid> {
        if options != 0 {
            match WaitOptions::from_bits(options as u32) {
                Some(flags) => log::debug!("[proc] waitpid: unsupported options {:?}", flags),
                None => log::debug!("[proc] waitpid: unknown option bits {:#x}", options),
            }
            return Err(ProcError::InvalidArgument);
        }

        let pid = Pid::try_from(pid)?;
        if pid == self.current_pid() {
            log::debug!("[proc] waitpid: pid {} waited on itself", pid);
            return Err(ProcError::InvalidArgument);
        }

        let target = self.table.lookup(pid)?;
        let exit_code = target.wait_for_exit().ok_or(ProcError::NoSuchProcess {
            pid: pid.as_u64() as i64,
        })?;

        let caller = self.current_process();
        caller
            .with_address_space(|space| space.copy_out(status, &exit_code.to_ne_bytes()))
            .unwrap_or_else(|| Err(ProcError::BadAddress {
                addr: status.addr(),
            }))?;

        self.reap_after_wait(&target);

        log::debug!(
            "[proc] pid {} collected status {} of pid {}",
            caller.pid(),
            exit_code,
            pid
        );
        Ok(pid)
    }

    /// Pid of the calling process
    pub fn sys_getpid(&self) -> Pid {
        self.current_pid()
    }
}
