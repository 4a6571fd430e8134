//! Host mock platform
//!
//! Stands in for the scheduler, the address-space layer and the kernel heap
//! so the process core runs under `cargo test`:
//! - every user thread is a host thread bound to its pid by a thread-local
//! - an address space is a map of private 4 KiB frames
//! - a user program is a Rust closure that traps through [`UserContext`]
//!
//! Thread exit unwinds the host thread back to its entry, which swallows
//! the unwind. Allocation failures are injected with
//! [`MockPlatform::fail_next`]; [`MockPlatform::on_thread_fork`] can stall
//! thread creation to widen races.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let platform = MockPlatform::new();
//! platform.set_program(|ctx| {
//!     // runs in every thread started by fork or spawn_init
//!     ctx.getpid() as i32
//! });
//! let manager = ProcessManager::new(platform, ProcConfig::default());
//! ```

use core::fmt;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::channel::{self, Receiver, Sender};
use static_assertions::assert_impl_all;

use crate::syscall::{self, numbers};
use crate::{
    AddressSpace, KernelObject, Pid, Platform, ProcError, ProcessManager, Result, ThreadEntry,
    TrapFrame, UserPtr,
};

/// Page size of the mock MMU
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// Page permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Allocation points that can be made to fail once
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultPoints: u32 {
        /// Process descriptor allocation in fork
        const PROCESS_ALLOC = 1 << 0;
        /// Address space duplication
        const ADDRESS_SPACE_COPY = 1 << 1;
        /// Child trap frame allocation
        const TRAP_FRAME_ALLOC = 1 << 2;
        /// Thread creation
        const THREAD_FORK = 1 << 3;
    }
}

thread_local! {
    static CURRENT_PID: Cell<Option<Pid>> = const { Cell::new(None) };
    static ACTIVE_SPACE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Space ids, unique across every platform in the host process
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Unwind payload used to terminate a user thread
struct ThreadExit;

/// State shared by a platform and every address space it created
#[derive(Default)]
struct MockShared {
    live_spaces: AtomicUsize,
    destroyed_spaces: AtomicUsize,
    faults: AtomicU32,
}

impl MockShared {
    /// Consume an armed fault, reporting whether it was armed
    fn take_fault(&self, point: FaultPoints) -> bool {
        self.faults.fetch_and(!point.bits(), Ordering::SeqCst) & point.bits() != 0
    }
}

#[derive(Clone)]
struct Page {
    frame: Box<[u8; PAGE_SIZE]>,
    flags: PageFlags,
}

fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Mock address space
pub struct MockAddressSpace {
    id: u64,
    pages: BTreeMap<usize, Page>,
    shared: Arc<MockShared>,
}

impl MockAddressSpace {
    fn new(shared: Arc<MockShared>) -> Self {
        let id = NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst);
        shared.live_spaces.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            pages: BTreeMap::new(),
            shared,
        }
    }

    /// Unique id, also reported by [`MockPlatform::active_space`]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Map zeroed pages covering `[vaddr, vaddr + len)`
    ///
    /// Pages already mapped keep their contents and take the new flags.
    ///
    /// # Errors
    /// `InvalidArgument` if `vaddr` is not page aligned, `len` is zero or
    /// the range wraps.
    pub fn map(&mut self, vaddr: usize, len: usize, flags: PageFlags) -> Result<()> {
        if vaddr % PAGE_SIZE != 0 || len == 0 {
            return Err(ProcError::InvalidArgument);
        }
        let end = vaddr.checked_add(len).ok_or(ProcError::InvalidArgument)?;

        for page in (vaddr..end).step_by(PAGE_SIZE) {
            self.pages
                .entry(page)
                .or_insert_with(|| Page {
                    frame: Box::new([0; PAGE_SIZE]),
                    flags,
                })
                .flags = flags;
        }
        Ok(())
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.pages.contains_key(&page_base(vaddr))
    }

    /// Read `len` bytes at `addr`
    ///
    /// # Errors
    /// `BadAddress` if any byte is unmapped or not readable.
    pub fn read(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.check_access(addr, len, PageFlags::READ)?;

        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        while out.len() < len {
            let offset = cursor % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(len - out.len());
            let page = self
                .pages
                .get(&page_base(cursor))
                .ok_or(ProcError::BadAddress { addr: cursor })?;
            out.extend_from_slice(&page.frame[offset..offset + chunk]);
            cursor = cursor.wrapping_add(chunk);
        }
        Ok(out)
    }

    /// Read a native-endian `i32` at `addr`
    pub fn read_i32(&self, addr: usize) -> Result<i32> {
        let mut buf = [0u8; 4];
        let len = buf.len();
        buf.copy_from_slice(&self.read(addr, len)?);
        Ok(i32::from_ne_bytes(buf))
    }

    /// Write `bytes` at `addr`
    ///
    /// Nothing is written unless the whole range is writable.
    ///
    /// # Errors
    /// `BadAddress` if any byte is unmapped or read-only.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.check_access(addr, bytes.len(), PageFlags::WRITE)?;

        let mut written = 0;
        let mut cursor = addr;
        while written < bytes.len() {
            let offset = cursor % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - written);
            let page = self
                .pages
                .get_mut(&page_base(cursor))
                .ok_or(ProcError::BadAddress { addr: cursor })?;
            page.frame[offset..offset + chunk].copy_from_slice(&bytes[written..written + chunk]);
            written += chunk;
            cursor = cursor.wrapping_add(chunk);
        }
        Ok(())
    }

    fn check_access(&self, addr: usize, len: usize, needed: PageFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = addr
            .checked_add(len - 1)
            .ok_or(ProcError::BadAddress { addr })?;

        let mut page = page_base(addr);
        loop {
            match self.pages.get(&page) {
                Some(mapped) if mapped.flags.contains(needed) => {}
                _ => {
                    return Err(ProcError::BadAddress {
                        addr: page.max(addr),
                    })
                }
            }
            if page == page_base(last) {
                return Ok(());
            }
            page += PAGE_SIZE;
        }
    }
}

impl AddressSpace for MockAddressSpace {
    fn duplicate(&self) -> Result<Self> {
        if self.shared.take_fault(FaultPoints::ADDRESS_SPACE_COPY) {
            return Err(ProcError::OutOfMemory);
        }

        let mut copy = MockAddressSpace::new(Arc::clone(&self.shared));
        copy.pages = self.pages.clone();
        Ok(copy)
    }

    fn activate(&self) {
        ACTIVE_SPACE.with(|active| active.set(Some(self.id)));
    }

    fn deactivate(&self) {
        ACTIVE_SPACE.with(|active| {
            if active.get() == Some(self.id) {
                active.set(None);
            }
        });
    }

    fn destroy(self) {
        assert_ne!(
            ACTIVE_SPACE.with(Cell::get),
            Some(self.id),
            "destroying active address space"
        );
        self.shared.destroyed_spaces.fetch_add(1, Ordering::SeqCst);
    }

    fn copy_out(&mut self, dest: UserPtr, bytes: &[u8]) -> Result<()> {
        self.write(dest.addr(), bytes)
    }
}

impl Drop for MockAddressSpace {
    fn drop(&mut self) {
        self.shared.live_spaces.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MockAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAddressSpace")
            .field("id", &self.id)
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// Program run by every user thread
pub type UserProgram = Arc<dyn Fn(&mut UserContext) -> i32 + Send + Sync>;

/// Called with the new thread's pid at the start of every `thread_fork`
pub type ThreadForkHook = Arc<dyn Fn(Pid) + Send + Sync>;

/// Mock platform backed by host threads
pub struct MockPlatform {
    shared: Arc<MockShared>,
    program: spin::Mutex<Option<UserProgram>>,
    thread_fork_hook: spin::Mutex<Option<ThreadForkHook>>,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = channel::unbounded();
        Self {
            shared: Arc::new(MockShared::default()),
            program: spin::Mutex::new(None),
            thread_fork_hook: spin::Mutex::new(None),
            threads: spin::Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Create an empty address space
    pub fn new_address_space(&self) -> MockAddressSpace {
        MockAddressSpace::new(Arc::clone(&self.shared))
    }

    /// Program every user thread runs; its return value is passed to `_exit`
    pub fn set_program(&self, program: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static) {
        *self.program.lock() = Some(Arc::new(program));
    }

    /// Run `hook` before every thread creation, ahead of any injected fault
    pub fn on_thread_fork(&self, hook: impl Fn(Pid) + Send + Sync + 'static) {
        *self.thread_fork_hook.lock() = Some(Arc::new(hook));
    }

    /// Make the next allocation at each of `points` fail
    pub fn fail_next(&self, points: FaultPoints) {
        self.shared.faults.fetch_or(points.bits(), Ordering::SeqCst);
    }

    /// Address spaces not yet dropped
    pub fn live_address_spaces(&self) -> usize {
        self.shared.live_spaces.load(Ordering::SeqCst)
    }

    /// Address spaces released through `destroy`
    pub fn destroyed_address_spaces(&self) -> usize {
        self.shared.destroyed_spaces.load(Ordering::SeqCst)
    }

    /// Id of the space active on the calling thread
    pub fn active_space(&self) -> Option<u64> {
        ACTIVE_SPACE.with(Cell::get)
    }

    /// Join every user thread started so far, including ones started while
    /// joining
    ///
    /// Returns `false` if any thread panicked.
    pub fn join_all(&self) -> bool {
        let mut clean = true;
        loop {
            let handles = core::mem::take(&mut *self.threads.lock());
            if handles.is_empty() {
                return clean;
            }
            for handle in handles {
                clean &= handle.join().is_ok();
            }
        }
    }

    /// Wait for the last user process to exit
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown_rx.recv_timeout(timeout).is_ok()
    }

    fn fault(&self, point: FaultPoints) -> Result<()> {
        if self.shared.take_fault(point) {
            log::debug!("[mock] injected failure at {:?}", point);
            Err(ProcError::OutOfMemory)
        } else {
            Ok(())
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    type AddressSpace = MockAddressSpace;

    fn alloc_object(&self, object: KernelObject) -> Result<()> {
        match object {
            KernelObject::Process => self.fault(FaultPoints::PROCESS_ALLOC),
            KernelObject::TrapFrame => self.fault(FaultPoints::TRAP_FRAME_ALLOC),
        }
    }

    fn thread_fork(&self, name: &str, pid: Pid, entry: ThreadEntry) -> Result<()> {
        let hook = self.thread_fork_hook.lock().clone();
        if let Some(hook) = hook {
            hook(pid);
        }
        self.fault(FaultPoints::THREAD_FORK)?;

        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, pid))
            .spawn(move || {
                CURRENT_PID.with(|current| current.set(Some(pid)));
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    if !payload.is::<ThreadExit>() {
                        panic::resume_unwind(payload);
                    }
                }
            })
            .map_err(|err| {
                log::warn!("[mock] thread spawn failed: {}", err);
                ProcError::OutOfMemory
            })?;

        self.threads.lock().push(handle);
        Ok(())
    }

    fn current_pid(&self) -> Option<Pid> {
        CURRENT_PID.with(Cell::get)
    }

    fn attach_current(&self, pid: Pid) {
        CURRENT_PID.with(|current| current.set(Some(pid)));
    }

    fn detach_current(&self, pid: Pid) {
        CURRENT_PID.with(|current| {
            if current.get() == Some(pid) {
                current.set(None);
            }
        });
    }

    fn thread_exit(&self) -> ! {
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn enter_usermode(manager: &Arc<ProcessManager<Self>>, tf: TrapFrame) -> ! {
        let program = manager.platform().program.lock().clone();
        let mut ctx = UserContext::new(Arc::clone(manager), tf);
        let exit_code = match program {
            Some(program) => program(&mut ctx),
            None => 0,
        };
        ctx.exit(exit_code)
    }

    fn last_process_exited(&self) {
        // The receiver lives as long as `self`
        let _ = self.shutdown_tx.send(());
    }
}

assert_impl_all!(MockPlatform: Send, Sync);
assert_impl_all!(ProcessManager<MockPlatform>: Send, Sync);

/// User-mode view of a process: a trap frame and a way to trap
pub struct UserContext {
    manager: Arc<ProcessManager<MockPlatform>>,
    tf: TrapFrame,
}

impl UserContext {
    pub fn new(manager: Arc<ProcessManager<MockPlatform>>, tf: TrapFrame) -> Self {
        Self { manager, tf }
    }

    pub fn manager(&self) -> &Arc<ProcessManager<MockPlatform>> {
        &self.manager
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        &self.tf
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.tf
    }

    /// Load `number` and `args` into the frame and trap
    ///
    /// Returns `x0` as the signed value user code sees.
    pub fn syscall(&mut self, number: u64, args: &[u64]) -> i64 {
        assert!(args.len() <= 6, "at most six syscall arguments");
        self.tf.x[8] = number;
        self.tf.x[..args.len()].copy_from_slice(args);
        syscall::dispatch(&self.manager, &mut self.tf);
        self.tf.return_value() as i64
    }

    pub fn fork(&mut self) -> i64 {
        self.syscall(numbers::SYS_FORK, &[])
    }

    pub fn getpid(&mut self) -> i64 {
        self.syscall(numbers::SYS_GETPID, &[])
    }

    pub fn waitpid(&mut self, pid: i64, status: UserPtr, options: i32) -> i64 {
        self.syscall(
            numbers::SYS_WAITPID,
            &[pid as u64, status.addr() as u64, options as u64],
        )
    }

    pub fn exit(&mut self, exit_code: i32) -> ! {
        self.syscall(numbers::SYS_EXIT, &[exit_code as u64]);
        unreachable!("_exit returned")
    }

    /// Run `f` against the calling process's address space
    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut MockAddressSpace) -> R) -> Result<R> {
        self.manager
            .with_address_space(self.manager.current_pid(), f)
    }
}
