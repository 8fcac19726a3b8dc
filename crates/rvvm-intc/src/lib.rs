//! Interrupt plumbing: the per-hart local interruptor (timer + software
//! IPI doorbell) and the platform-level wired IRQ aggregator, plus the MSI
//! delivery helper that lets a PCI function post an interrupt without going
//! through the aggregator at all.
//!
//! Neither piece touches a hart's register file or TLB directly. Both talk
//! to harts only through [`InterruptTarget`], which a hart implements to
//! set a pending-interrupt bit and wake its WFI condition variable. That
//! keeps this crate ignorant of CSR layout, privilege modes, or anything
//! else that lives in `rvvm-cpu`.

pub mod bits;
pub mod local;
pub mod msi;
pub mod plic;

pub use bits::*;
pub use local::{LocalInterruptor, WallClock};
pub use msi::MsiMessage;
pub use plic::{IrqAggregator, IrqError};

/// Something a pending interrupt can be raised or lowered against: a hart's
/// `mip`/`sip`-equivalent bitmask plus its WFI wake signal.
pub trait InterruptTarget: Send + Sync {
    /// Set `bit` (one of the constants in [`bits`]) pending and wake any
    /// thread parked in WFI. Idempotent: raising an already-pending bit is
    /// a no-op on architectural state.
    fn raise(&self, bit: u64);

    /// Clear `bit`. Used by level-sensitive sources when they stop
    /// asserting and by `complete` on the wired aggregator.
    fn lower(&self, bit: u64);
}
