//! Error types for the rvvm-pci crate.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PciError {
    #[error("no free bus-address slot for an auto-multifunc attach")]
    NoFreeSlot,

    #[error("bus-address {0:#06x} is already occupied")]
    SlotOccupied(u16),

    #[error("function {0:#06x} is not attached")]
    NoSuchFunction(u16),

    #[error("BAR index {0} is out of range (0..6)")]
    BarIndexOutOfRange(u8),

    #[error("physical map rejected a BAR region: {0}")]
    Map(#[from] rvvm_mem::MemError),
}

pub type PciResult<T> = Result<T, PciError>;
