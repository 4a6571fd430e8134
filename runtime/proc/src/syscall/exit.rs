//! `_exit` - terminate the calling process

use crate::{AddressSpace, Platform, ProcessManager};

impl<P: Platform> ProcessManager<P> {
    /// Publish `exit_code` and terminate the calling thread
    ///
    /// The address space is deactivated, then destroyed, before the status
    /// becomes visible. Waiters are woken by the status alone; the
    /// descriptor stays in the table as a zombie until reclaimed.
    ///
    /// # Panics
    /// If the calling process has no address space or already exited.
    pub fn sys_exit(&self, exit_code: i32) -> ! {
        let process = self.current_process();
        let pid = process.pid();

        if process.with_address_space(|space| space.deactivate()).is_none() {
            panic!("pid {} exited without an address space", pid);
        }
        if let Some(address_space) = process.set_address_space(None) {
            address_space.destroy();
        }

        process.record_exit(exit_code);
        self.platform.detach_current(pid);

        let report = self.table.mark_exited(&process);
        drop(process);

        log::debug!(
            "[proc] pid {} exited with status {} (self_reaped={}, children reaped={} orphaned={})",
            pid,
            exit_code,
            report.self_reaped,
            report.reaped_children,
            report.orphaned_children
        );

        if report.running == 0 {
            log::info!("[proc] last user process exited");
            self.platform.last_process_exited();
        }

        self.platform.thread_exit()
    }
}
