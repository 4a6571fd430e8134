//! Process Table - fixed-capacity pid → descriptor registry
//!
//! The table is the sole authority for pid allocation and reuse. Every
//! mutation happens under one table-wide spinlock, and pid allocation is
//! the same critical section as the insertion that claims it.
//!
//! ## Slot States
//!
//! ```text
//! Free ──reserve──► Reserved ──commit──► Live ──reclaim──► Free
//!                      │
//!                      └──dropped (fork failed)──► Free
//! ```
//!
//! A reserved pid is invisible to `lookup`, so a half-built child can never
//! be waited on. Pids are handed out round-robin from the last allocation,
//! which keeps a freshly freed pid out of circulation for as long as possible.
//!
//! The table never takes a descriptor's exit lock. The zombie flag kept in
//! each slot is the table's own record, written by `_exit` after the
//! descriptor's exit state.

use std::sync::Arc;

use crate::{AddressSpace, Pid, ProcError, Process, Result};

/// Occupied slot
struct Slot<A: AddressSpace> {
    process: Arc<Process<A>>,

    /// Parent expected to wait; `None` once nobody will
    parent: Option<Pid>,

    /// `_exit` has finished with this slot
    zombie: bool,

    /// A waiter reclaimed the pid before `_exit` finished
    reap_pending: bool,
}

enum Entry<A: AddressSpace> {
    Free,
    Reserved,
    Live(Slot<A>),
}

struct TableInner<A: AddressSpace> {
    entries: Vec<Entry<A>>,

    /// Index after the last allocation
    next: usize,

    /// Reserved + live entries
    occupied: usize,
}

/// Outcome of reclaiming a zombie's pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaim {
    /// Slot freed now
    Freed,

    /// `_exit` is still running; it frees the slot when done
    Deferred,

    /// The slot no longer holds this descriptor
    Absent,
}

/// What `_exit` did to the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ExitReport {
    /// The exiting process's own slot was freed
    pub self_reaped: bool,

    /// Zombie children freed because their parent is gone
    pub reaped_children: usize,

    /// Running children left without a parent
    pub orphaned_children: usize,

    /// Live processes that have not exited
    pub running: usize,
}

/// Process table
pub struct ProcessTable<A: AddressSpace> {
    inner: spin::Mutex<TableInner<A>>,
    first_pid: u32,
    capacity: usize,
}

/// A pid held for a descriptor still under construction
///
/// Dropping the reservation without [`commit`](Reservation::commit) frees
/// the pid again.
pub(crate) struct Reservation<'a, A: AddressSpace> {
    table: &'a ProcessTable<A>,
    pid: Pid,
    committed: bool,
}

impl<A: AddressSpace> Reservation<'_, A> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Publish `process` under the reserved pid
    pub fn commit(mut self, process: Arc<Process<A>>, parent: Option<Pid>) {
        debug_assert_eq!(process.pid(), self.pid);
        self.table.fill(self.pid, process, parent);
        self.committed = true;
    }
}

impl<A: AddressSpace> Drop for Reservation<'_, A> {
    fn drop(&mut self) {
        if !self.committed {
            self.table.cancel(self.pid);
        }
    }
}

impl<A: AddressSpace> ProcessTable<A> {
    /// Create a table of `capacity` slots numbered from `first_pid`
    pub fn new(first_pid: u32, capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || Entry::Free);

        Self {
            inner: spin::Mutex::new(TableInner {
                entries,
                next: 0,
                occupied: 0,
            }),
            first_pid,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots (including pids reserved by an in-flight fork)
    pub fn len(&self) -> usize {
        self.inner.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a pid and insert a new descriptor in one step
    ///
    /// # Errors
    /// `OutOfIds` if every slot is taken.
    pub fn allocate(
        &self,
        name: &str,
        address_space: Option<A>,
        parent: Option<Pid>,
    ) -> Result<(Pid, Arc<Process<A>>)> {
        let reservation = self.reserve()?;
        let pid = reservation.pid();
        let process = Arc::new(Process::new(pid, name, address_space));
        reservation.commit(Arc::clone(&process), parent);
        Ok((pid, process))
    }

    /// Look up a running or zombie process
    ///
    /// # Errors
    /// `NoSuchProcess` if no descriptor is published under `pid`.
    pub fn lookup(&self, pid: Pid) -> Result<Arc<Process<A>>> {
        let index = self.index_of(pid)?;
        match &self.inner.lock().entries[index] {
            Entry::Live(slot) => Ok(Arc::clone(&slot.process)),
            Entry::Free | Entry::Reserved => Err(no_such_process(pid)),
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lookup(pid).is_ok()
    }

    /// Remove the mapping for `pid` unconditionally
    ///
    /// Only for a descriptor whose exit status has been consumed.
    ///
    /// # Errors
    /// `NoSuchProcess` if no descriptor is published under `pid`.
    pub fn release(&self, pid: Pid) -> Result<Arc<Process<A>>> {
        let index = self.index_of(pid)?;
        self.inner
            .lock()
            .free(index)
            .map(|slot| slot.process)
            .ok_or_else(|| no_such_process(pid))
    }

    /// Hold the next free pid
    pub(crate) fn reserve(&self) -> Result<Reservation<'_, A>> {
        let mut inner = self.inner.lock();
        let capacity = self.capacity;
        let start = inner.next;

        let index = (0..capacity)
            .map(|offset| (start + offset) % capacity)
            .find(|&index| matches!(inner.entries[index], Entry::Free))
            .ok_or(ProcError::OutOfIds { capacity })?;

        inner.entries[index] = Entry::Reserved;
        inner.next = (index + 1) % capacity;
        inner.occupied += 1;

        Ok(Reservation {
            table: self,
            pid: self.pid_at(index),
            committed: false,
        })
    }

    /// Reclaim a zombie's pid after its status was delivered
    pub(crate) fn reclaim(&self, process: &Arc<Process<A>>) -> Reclaim {
        let Ok(index) = self.index_of(process.pid()) else {
            return Reclaim::Absent;
        };
        let mut inner = self.inner.lock();
        match &mut inner.entries[index] {
            Entry::Live(slot) if Arc::ptr_eq(&slot.process, process) => {
                if !slot.zombie {
                    slot.reap_pending = true;
                    return Reclaim::Deferred;
                }
            }
            _ => return Reclaim::Absent,
        }
        inner.free(index);
        Reclaim::Freed
    }

    /// Drop a descriptor whose thread never started
    pub(crate) fn discard(&self, process: &Arc<Process<A>>) {
        let Ok(index) = self.index_of(process.pid()) else {
            return;
        };
        let mut inner = self.inner.lock();
        if matches!(&inner.entries[index], Entry::Live(slot) if Arc::ptr_eq(&slot.process, process)) {
            inner.free(index);
        }
    }

    /// Record that `process` finished `_exit`
    ///
    /// Marks its slot zombie, or frees it when no parent will wait. Its
    /// zombie children are freed and its running children lose their parent.
    pub(crate) fn mark_exited(&self, process: &Arc<Process<A>>) -> ExitReport {
        let pid = process.pid();
        let mut report = ExitReport::default();
        let mut inner = self.inner.lock();

        if let Ok(index) = self.index_of(pid) {
            let mut unwaited = false;
            if let Entry::Live(slot) = &mut inner.entries[index] {
                if Arc::ptr_eq(&slot.process, process) {
                    unwaited = slot.parent.is_none() || slot.reap_pending;
                    slot.zombie = true;
                }
            }
            if unwaited {
                inner.free(index);
                report.self_reaped = true;
            }
        }

        let mut dead_children = Vec::new();
        for (index, entry) in inner.entries.iter_mut().enumerate() {
            match entry {
                Entry::Live(slot) if slot.parent == Some(pid) => {
                    if slot.zombie {
                        dead_children.push(index);
                    } else {
                        slot.parent = None;
                        report.orphaned_children += 1;
                    }
                }
                _ => {}
            }
        }
        for index in dead_children {
            inner.free(index);
            report.reaped_children += 1;
        }

        report.running = inner
            .entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Live(slot) if !slot.zombie))
            .count();

        report
    }

    fn fill(&self, pid: Pid, process: Arc<Process<A>>, parent: Option<Pid>) {
        let index = (pid.as_u32() - self.first_pid) as usize;
        let mut inner = self.inner.lock();
        debug_assert!(matches!(inner.entries[index], Entry::Reserved));
        inner.entries[index] = Entry::Live(Slot {
            process,
            parent,
            zombie: false,
            reap_pending: false,
        });
    }

    fn cancel(&self, pid: Pid) {
        let index = (pid.as_u32() - self.first_pid) as usize;
        let mut inner = self.inner.lock();
        if matches!(inner.entries[index], Entry::Reserved) {
            inner.entries[index] = Entry::Free;
            inner.occupied -= 1;
        }
    }

    fn index_of(&self, pid: Pid) -> Result<usize> {
        pid.as_u32()
            .checked_sub(self.first_pid)
            .map(|offset| offset as usize)
            .filter(|&index| index < self.capacity)
            .ok_or_else(|| no_such_process(pid))
    }

    fn pid_at(&self, index: usize) -> Pid {
        Pid::new(self.first_pid + index as u32)
    }
}

impl<A: AddressSpace> TableInner<A> {
    fn free(&mut self, index: usize) -> Option<Slot<A>> {
        match core::mem::replace(&mut self.entries[index], Entry::Free) {
            Entry::Live(slot) => {
                self.occupied -= 1;
                Some(slot)
            }
            other => {
                self.entries[index] = other;
                None
            }
        }
    }
}

fn no_such_process(pid: Pid) -> ProcError {
    ProcError::NoSuchProcess {
        pid: pid.as_u64() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAddressSpace;
    use crate::ProcessState;

    type Table = ProcessTable<MockAddressSpace>;

    #[test]
    fn test_allocate_sequential_pids() {
        let table = Table::new(2, 8);

        let (pid1, _) = table.allocate("a", None, None).unwrap();
        let (pid2, _) = table.allocate("b", None, None).unwrap();
        assert_eq!(pid1, Pid::new(2));
        assert_eq!(pid2, Pid::new(3));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_full() {
        let table = Table::new(2, 2);
        table.allocate("a", None, None).unwrap();
        table.allocate("b", None, None).unwrap();

        let result = table.allocate("c", None, None);
        assert!(matches!(result, Err(ProcError::OutOfIds { capacity: 2 })));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_missing() {
        let table = Table::new(2, 4);
        assert!(matches!(
            table.lookup(Pid::new(3)),
            Err(ProcError::NoSuchProcess { pid: 3 })
        ));
        // Outside the table's range
        assert!(table.lookup(Pid::new(1)).is_err());
        assert!(table.lookup(Pid::new(100)).is_err());
    }

    #[test]
    fn test_release_frees_pid_for_reuse() {
        let table = Table::new(2, 2);
        let (pid1, _) = table.allocate("a", None, None).unwrap();
        table.allocate("b", None, None).unwrap();

        let released = table.release(pid1).unwrap();
        assert_eq!(released.pid(), pid1);
        assert!(!table.contains(pid1));

        let (pid3, _) = table.allocate("c", None, None).unwrap();
        assert_eq!(pid3, pid1);

        assert!(table.release(Pid::new(50)).is_err());
    }

    #[test]
    fn test_round_robin_delays_reuse() {
        let table = Table::new(2, 4);
        let (pid1, _) = table.allocate("a", None, None).unwrap();
        table.release(pid1).unwrap();

        let (pid2, _) = table.allocate("b", None, None).unwrap();
        assert_ne!(pid2, pid1);
    }

    #[test]
    fn test_reservation_invisible_until_commit() {
        let table = Table::new(2, 4);
        let reservation = table.reserve().unwrap();
        let pid = reservation.pid();

        assert_eq!(table.len(), 1);
        assert!(!table.contains(pid));

        reservation.commit(Arc::new(Process::new(pid, "child", None)), None);
        assert!(table.contains(pid));
    }

    #[test]
    fn test_dropped_reservation_is_rolled_back() {
        let table = Table::new(2, 1);
        {
            let _reservation = table.reserve().unwrap();
            assert!(table.reserve().is_err());
        }
        assert_eq!(table.len(), 0);
        assert!(table.reserve().is_ok());
    }

    #[test]
    fn test_exit_without_parent_frees_slot() {
        let table = Table::new(2, 4);
        let (pid, proc) = table.allocate("init", None, None).unwrap();
        proc.record_exit(0);

        let report = table.mark_exited(&proc);
        assert!(report.self_reaped);
        assert_eq!(report.running, 0);
        assert!(!table.contains(pid));
    }

    #[test]
    fn test_exit_with_parent_leaves_zombie() {
        let table = Table::new(2, 4);
        let (parent, _) = table.allocate("init", None, None).unwrap();
        let (child, proc) = table.allocate("child", None, Some(parent)).unwrap();
        proc.record_exit(3);

        let report = table.mark_exited(&proc);
        assert!(!report.self_reaped);
        assert_eq!(report.running, 1);

        let zombie = table.lookup(child).unwrap();
        assert_eq!(zombie.state(), ProcessState::Zombie(3));
        assert_eq!(table.reclaim(&zombie), Reclaim::Freed);
        assert!(!table.contains(child));
        assert_eq!(table.reclaim(&zombie), Reclaim::Absent);
    }

    #[test]
    fn test_reclaim_before_exit_finishes_is_deferred() {
        let table = Table::new(2, 4);
        let (parent, _) = table.allocate("init", None, None).unwrap();
        let (child, proc) = table.allocate("child", None, Some(parent)).unwrap();
        proc.record_exit(9);

        assert_eq!(table.reclaim(&proc), Reclaim::Deferred);
        assert!(table.contains(child));

        let report = table.mark_exited(&proc);
        assert!(report.self_reaped);
        assert!(!table.contains(child));
    }

    #[test]
    fn test_parent_exit_reaps_zombies_and_orphans_running() {
        let table = Table::new(2, 8);
        let (parent, parent_proc) = table.allocate("parent", None, None).unwrap();
        let (zombie, zombie_proc) = table.allocate("z", None, Some(parent)).unwrap();
        let (running, running_proc) = table.allocate("r", None, Some(parent)).unwrap();

        zombie_proc.record_exit(1);
        table.mark_exited(&zombie_proc);

        parent_proc.record_exit(0);
        let report = table.mark_exited(&parent_proc);
        assert!(report.self_reaped);
        assert_eq!(report.reaped_children, 1);
        assert_eq!(report.orphaned_children, 1);
        assert_eq!(report.running, 1);
        assert!(!table.contains(zombie));

        // The orphan is freed by its own exit
        running_proc.record_exit(2);
        let report = table.mark_exited(&running_proc);
        assert!(report.self_reaped);
        assert!(!table.contains(running));
        assert!(table.is_empty());
    }

    #[test]
    fn test_discard_ignores_reused_pid() {
        let table = Table::new(2, 1);
        let (pid, old) = table.allocate("old", None, None).unwrap();
        table.release(pid).unwrap();
        let (_, new) = table.allocate("new", None, None).unwrap();

        table.discard(&old);
        assert!(Arc::ptr_eq(&table.lookup(pid).unwrap(), &new));
    }
}
