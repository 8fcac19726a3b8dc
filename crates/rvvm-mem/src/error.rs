//! Error types for the rvvm-mem crate.

use thiserror::Error;

/// Errors surfaced by physical-map and MMIO-host operations.
///
/// These are configuration/invariant errors, not guest-facing faults: a
/// guest-visible access failure (e.g. a load/store to an unmapped address)
/// is reported as a `bool`/`Option` at the dispatch boundary per the
/// engine's "no exceptions" propagation policy, and turned into a RISC-V
/// trap by the caller in `rvvm-cpu`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("region [{addr:#x}, {end:#x}) overlaps an existing region")]
    Overlap { addr: u64, end: u64 },

    #[error("region [{addr:#x}, size={size:#x}) would wrap the address space")]
    AddressWrap { addr: u64, size: u64 },

    #[error("no free address range of size {size:#x} at or above hint {hint:#x}")]
    NoFreeRange { hint: u64, size: u64 },

    #[error("handle does not refer to an attached region")]
    StaleHandle,

    #[error("access of width {width} at {addr:#x} is not contained in a single region")]
    Unmapped { addr: u64, width: u8 },

    #[error("device callback rejected the access at offset {offset:#x}")]
    DeviceRejected { offset: u64 },

    #[error("access width {width} is outside the region's supported range {min}..={max}")]
    WidthOutOfRange { width: u8, min: u8, max: u8 },
}

pub type MemResult<T> = Result<T, MemError>;
