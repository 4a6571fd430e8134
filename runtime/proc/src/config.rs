//! Process core configuration

/// Default number of process table slots
pub const DEFAULT_MAX_PROCESSES: usize = 64;

/// Lowest pid handed to a user process (pid 1 belongs to the kernel)
pub const PID_MIN: u32 = 2;

/// When a zombie's pid is returned to the table
///
/// Zombies whose parent has already exited (or that never had one) are
/// reclaimed by the kernel under either policy, since nobody is left to
/// wait for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    /// A successful `waitpid` frees the pid
    #[default]
    OnWait,

    /// The zombie stays until [`ProcessManager::reap`](crate::ProcessManager::reap)
    Explicit,
}

/// Process core configuration
#[derive(Debug, Clone)]
pub struct ProcConfig {
    /// Number of process table slots
    pub max_processes: usize,

    /// Pid of the first table slot
    pub first_pid: u32,

    /// Zombie reclamation policy
    pub reap_policy: ReapPolicy,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            max_processes: DEFAULT_MAX_PROCESSES,
            first_pid: PID_MIN,
            reap_policy: ReapPolicy::OnWait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProcConfig::default();
        assert_eq!(config.max_processes, 64);
        assert_eq!(config.first_pid, 2);
        assert_eq!(config.reap_policy, ReapPolicy::OnWait);
    }
}
