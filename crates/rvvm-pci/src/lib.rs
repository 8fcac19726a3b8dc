//! PCI Express host bridge: the ECAM configuration window, the function
//! and BAR model, and INTx/MSI interrupt routing (component E).
//!
//! This crate owns everything between a guest ECAM access and either a
//! function's configuration registers or, via [`rvvm_mem::PhysicalMap`],
//! the live MMIO region backing one of its BARs. It does not implement any
//! concrete device — a disk controller, a NIC — those are external
//! collaborators that hand this crate an [`rvvm_mem::MmioDevice`] per BAR
//! and otherwise only call [`bus::PciBus::send_irq`] /
//! [`function::Function::msi_message`].

pub mod bus;
pub mod ecam;
pub mod error;
pub mod function;

pub use bus::{intx_lane, PciBus, INTX_LANES};
pub use ecam::HostBridge;
pub use error::{PciError, PciResult};
pub use function::{BarRequest, BarShape, BarWriteEffect, Command, Function};
