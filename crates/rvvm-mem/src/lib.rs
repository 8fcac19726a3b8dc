//! Physical memory map, RAM backing, and the MMIO device host.
//!
//! This crate owns guest physical address space composition (component B),
//! the dispatch/widening rules for memory-mapped device access (component
//! C), and the region/device trait contracts devices and the PCI bridge
//! attach against. It does not know about virtual addresses, harts, or
//! traps — that translation layer lives in `rvvm-cpu`, which consults this
//! crate's [`PhysicalMap`] on a TLB miss.

pub mod error;
pub mod map;
pub mod mmio;
pub mod region;

pub use error::{MemError, MemResult};
pub use map::{DmaPtr, PhysicalMap};
pub use region::{FastPathMemory, MmioDevice, Region, RegionKind};
