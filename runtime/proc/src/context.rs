//! Saved execution context (trap frame)
//!
//! A [`TrapFrame`] is the register snapshot taken when a user thread traps
//! into the kernel. It is a plain `Copy` value: duplicating it for a forked
//! child is a copy, and patching the child's return state is the pure
//! [`TrapFrame::derive_child`] transformation, so the parent's frame is never
//! touched on the child's behalf.
//!
//! # Register Conventions
//!
//! - x0-x5: syscall arguments, x0 also carries the return value
//! - x8: syscall number
//! - elr_el1: address of the trapping `svc` instruction while the syscall
//!   runs; the syscall-return path moves it past the trap
//!
//! Errors come back as `x0 = -(errno)`.

use core::fmt;
use static_assertions::const_assert_eq;

/// Number of general-purpose registers saved (x0-x30)
pub const NUM_GPRS: usize = 31;

/// Size of the trapping instruction (`svc #0`)
pub const INSTRUCTION_SIZE: u64 = 4;

/// SPSR value for returning to EL0 with interrupts unmasked
const SPSR_EL0T: u64 = 0;

/// Trap frame - CPU context saved at a syscall trap
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// General purpose registers x0-x30 (x29 = FP, x30 = LR)
    pub x: [u64; NUM_GPRS],

    /// User stack pointer
    pub sp_el0: u64,

    /// Resume address
    pub elr_el1: u64,

    /// Saved processor status
    pub spsr_el1: u64,

    /// Exception syndrome
    pub esr_el1: u64,

    /// Fault address
    pub far_el1: u64,
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), (NUM_GPRS + 5) * 8);

impl TrapFrame {
    /// Create a trap frame with all registers zeroed
    pub const fn new() -> Self {
        Self {
            x: [0; NUM_GPRS],
            sp_el0: 0,
            elr_el1: 0,
            spsr_el1: 0,
            esr_el1: 0,
            far_el1: 0,
        }
    }

    /// Initial frame for a thread entering user mode at `entry`
    pub const fn user(entry: u64, stack_top: u64) -> Self {
        let mut tf = Self::new();
        tf.elr_el1 = entry;
        tf.sp_el0 = stack_top;
        tf.spsr_el1 = SPSR_EL0T;
        tf
    }

    /// Syscall number (x8)
    #[inline]
    pub fn syscall_number(&self) -> u64 {
        self.x[8]
    }

    /// Syscall arguments (x0-x5)
    #[inline]
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.x[0], self.x[1], self.x[2], self.x[3], self.x[4], self.x[5]]
    }

    /// Value in the return register (x0)
    #[inline]
    pub fn return_value(&self) -> u64 {
        self.x[0]
    }

    /// Set syscall return value (x0)
    #[inline]
    pub fn set_return_value(&mut self, value: u64) {
        self.x[0] = value;
    }

    /// Report a failed syscall as `-(errno)` in x0
    #[inline]
    pub fn set_error(&mut self, errno: i32) {
        self.x[0] = (-(errno as i64)) as u64;
    }

    /// Resume after the trapping instruction
    #[inline]
    pub fn advance_pc(&mut self) {
        self.elr_el1 = self.elr_el1.wrapping_add(INSTRUCTION_SIZE);
    }

    /// Frame the forked child resumes with
    ///
    /// Identical to `self` except that the child sees fork return 0 and
    /// resumes after the `svc`, so it does not issue the fork again.
    #[must_use]
    pub fn derive_child(&self) -> Self {
        let mut child = *self;
        child.set_return_value(0);
        child.advance_pc();
        child
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("x0", &format_args!("{:#x}", self.x[0]))
            .field("x8", &self.x[8])
            .field("sp_el0", &format_args!("{:#x}", self.sp_el0))
            .field("elr_el1", &format_args!("{:#x}", self.elr_el1))
            .field("spsr_el1", &format_args!("{:#x}", self.spsr_el1))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_frame() {
        let tf = TrapFrame::user(0x40_0000, 0x7fff_f000);
        assert_eq!(tf.elr_el1, 0x40_0000);
        assert_eq!(tf.sp_el0, 0x7fff_f000);
        assert_eq!(tf.x, [0; NUM_GPRS]);
    }

    #[test]
    fn test_syscall_decode() {
        let mut tf = TrapFrame::new();
        tf.x[8] = 4;
        tf.x[0] = 7;
        tf.x[1] = 0x1000;
        tf.x[5] = 55;
        assert_eq!(tf.syscall_number(), 4);
        assert_eq!(tf.syscall_args(), [7, 0x1000, 0, 0, 0, 55]);
    }

    #[test]
    fn test_error_encoding() {
        let mut tf = TrapFrame::new();
        tf.set_error(22);
        assert_eq!(tf.return_value() as i64, -22);
    }

    #[test]
    fn test_derive_child() {
        let mut parent = TrapFrame::user(0x40_0000, 0x7fff_f000);
        parent.x[0] = 0xdead;
        parent.x[8] = 0;
        parent.x[19] = 42;
        parent.x[30] = 0x40_0100;

        let child = parent.derive_child();

        assert_eq!(child.return_value(), 0);
        assert_eq!(child.elr_el1, 0x40_0000 + INSTRUCTION_SIZE);
        assert_eq!(child.x[19], 42);
        assert_eq!(child.x[30], 0x40_0100);
        assert_eq!(child.sp_el0, parent.sp_el0);

        // Parent snapshot untouched
        assert_eq!(parent.return_value(), 0xdead);
        assert_eq!(parent.elr_el1, 0x40_0000);
    }

    #[test]
    fn test_advance_pc_matches_child() {
        let mut parent = TrapFrame::user(0x1000, 0x2000);
        let child = parent.derive_child();
        parent.advance_pc();
        assert_eq!(parent.elr_el1, child.elr_el1);
    }
}
