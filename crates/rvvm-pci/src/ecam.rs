//! The ECAM configuration window: the MMIO device the machine maps at the
//! PCI Express host bridge's guest physical base, decoding every access
//! into a (bus-address, register) pair per §4.6.

use std::sync::Arc;

use rvvm_mem::MmioDevice;

use crate::bus::PciBus;
use crate::function::Function;

/// Size in bytes of the ECAM window backing one bus's worth of
/// device/function slots: 32 devices × 8 functions × 4 KiB per function.
pub const BYTES_PER_BUS: u64 = 1 << 20;

/// The synthetic host-bridge function's vendor id, reported at bus-address
/// 0 and nowhere else. Chosen distinct from any real-silicon vendor id.
pub const HOST_BRIDGE_VENDOR_ID: u16 = 0xF15E;

const CAP_PCIE_OFFSET: u16 = 0x40;
const CAP_PM_OFFSET: u16 = 0x50;
const CAP_MSI_OFFSET: u16 = 0x60;

/// The PCI Express host bridge: owns the [`PciBus`] routing table and
/// answers ECAM-decoded configuration-space reads/writes for every
/// attached function plus the synthetic bus-address-0 host bridge itself.
pub struct HostBridge {
    pub bus: Arc<PciBus>,
    buses: u8,
    host_bridge_fn: Arc<Function>,
}

impl HostBridge {
    pub fn new(bus: Arc<PciBus>, buses: u8) -> Self {
        let host_bridge_fn = Arc::new(Function::endpoint(
            HOST_BRIDGE_VENDOR_ID,
            0x0001,
            0x06,
            0x00,
            0,
            1,
            0,
            [None, None, None, None, None, None],
        ));
        Self { bus, buses, host_bridge_fn }
    }

    /// Total size of the ECAM window this bridge answers for.
    pub fn ecam_size(&self) -> u64 {
        BYTES_PER_BUS * self.buses as u64
    }

    fn function_at(&self, bus_address: u16) -> Option<Arc<Function>> {
        if bus_address == 0 {
            return Some(self.host_bridge_fn.clone());
        }
        self.bus.function(bus_address)
    }

    fn config_read(&self, bus_address: u16, register: u16) -> u32 {
        let Some(function) = self.function_at(bus_address) else {
            // Missing devices read as all-ones, per the PCI spec.
            return 0xFFFF_FFFF;
        };

        if let Some(word) = function.read_bridge_word(register) {
            return word;
        }

        match register {
            0x00 => (u32::from(function.device_id) << 16) | u32::from(function.vendor_id),
            0x04 => (u32::from(function.status()) << 16) | u32::from(function.command().bits()),
            0x08 => {
                (u32::from(function.class) << 24)
                    | (u32::from(function.subclass) << 16)
                    | (u32::from(function.prog_if) << 8)
                    | u32::from(function.revision)
            }
            0x0C => {
                let multifunction = bus_address == 0 || self.bus.is_multifunction(bus_address);
                let header_type = if function.is_bridge() { 0x01 } else { 0x00 }
                    | if multifunction { 0x80 } else { 0x00 };
                header_type << 16
            }
            0x10..=0x24 if !function.is_bridge() => {
                let index = ((register - 0x10) / 4) as u8;
                function.read_bar(index)
            }
            0x2C => 0,
            0x34 => u32::from(CAP_PCIE_OFFSET),
            0x3C => {
                let pin = if bus_address == 0 { 0 } else { u32::from(function.irq_pin) };
                (pin << 8) | 0xFF
            }
            CAP_PCIE_OFFSET => {
                // Capability ID 0x10 (PCI Express), next pointer to the PM
                // capability, PCIe v2 endpoint device/port type in the
                // capability register's high bits.
                u32::from(CAP_PCIE_OFFSET as u8)
                    | (u32::from(CAP_PM_OFFSET as u8) << 8)
                    | (0x0002 << 16)
            }
            CAP_PM_OFFSET => {
                // Capability ID 0x01 (power management), next pointer to MSI.
                u32::from(0x01u8) | (u32::from(CAP_MSI_OFFSET as u8) << 8)
            }
            CAP_MSI_OFFSET => {
                let raw = function.msi_raw();
                let message_control = (raw[0] & 1) | (1 << 7); // bit7: 64-bit capable.
                u32::from(0x05u8) | (0 << 8) | (message_control << 16)
            }
            off if off == CAP_MSI_OFFSET + 0x04 => function.msi_raw()[1],
            off if off == CAP_MSI_OFFSET + 0x08 => function.msi_raw()[2],
            off if off == CAP_MSI_OFFSET + 0x0C => function.msi_raw()[3] & 0xFFFF,
            _ => 0,
        }
    }

    fn config_write(&self, bus_address: u16, register: u16, value: u32) {
        let Some(function) = self.function_at(bus_address) else {
            // Writes to a missing device's slot are dropped.
            return;
        };

        if register == 0x18 || register == 0x1C || register == 0x20 {
            function.write_bridge_word(register, value);
            return;
        }

        match register {
            0x04 => {
                function.set_command(crate::function::Command::from_bits_truncate(value as u16));
            }
            0x10..=0x24 if !function.is_bridge() => {
                let index = ((register - 0x10) / 4) as u8;
                if let Some(effect) = function.write_bar(index, value) {
                    if let Some(addr) = self.bus_address_of(&function) {
                        self.bus.relocate_bar(addr, effect.index, effect.new_base).ok();
                    }
                }
            }
            CAP_MSI_OFFSET => function.write_msi_raw(0, value >> 16),
            off if off == CAP_MSI_OFFSET + 0x04 => function.write_msi_raw(1, value),
            off if off == CAP_MSI_OFFSET + 0x08 => function.write_msi_raw(2, value),
            off if off == CAP_MSI_OFFSET + 0x0C => function.write_msi_raw(3, value),
            _ => {}
        }
    }

    fn bus_address_of(&self, function: &Arc<Function>) -> Option<u16> {
        self.bus.bus_address_of(function)
    }
}

fn decode(offset: u64) -> (u16, u16) {
    ((offset >> 12) as u16, (offset & 0xFFC) as u16)
}

impl MmioDevice for HostBridge {
    fn read(&self, offset: u64, buf: &mut [u8]) -> bool {
        let (bus_address, register) = decode(offset);
        let word = self.config_read(bus_address, register);
        let shift = (offset & 0x3) as u32 * 8;
        let bytes = (word >> shift).to_le_bytes();
        buf.copy_from_slice(&bytes[..buf.len()]);
        true
    }

    fn write(&self, offset: u64, buf: &[u8]) -> bool {
        let (bus_address, register) = decode(offset);
        if buf.len() == 4 {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(buf);
            self.config_write(bus_address, register, u32::from_le_bytes(bytes));
            return true;
        }
        // Narrower accesses: read-modify-write the containing word.
        let shift = (offset & 0x3) as u32 * 8;
        let current = self.config_read(bus_address, register);
        let mut bytes = current.to_le_bytes();
        let start = (shift / 8) as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        self.config_write(bus_address, register, u32::from_le_bytes(bytes));
        true
    }

    fn name(&self) -> &str {
        "pci-ecam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{BarRequest, BarShape};
    use rvvm_intc::{DeliveryMode, IrqAggregator};
    use rvvm_mem::PhysicalMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingTarget(AtomicU64);
    impl rvvm_intc::InterruptTarget for RecordingTarget {
        fn raise(&self, bit: u64) {
            self.0.fetch_or(bit, Ordering::SeqCst);
        }
        fn lower(&self, bit: u64) {
            self.0.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    fn bridge_with_one_function() -> (HostBridge, Arc<Function>) {
        let map = Arc::new(PhysicalMap::new());
        let target = Arc::new(RecordingTarget(AtomicU64::new(0)));
        let aggregator = Arc::new(IrqAggregator::new(vec![(target, DeliveryMode::Machine)]));
        let pci_bus = Arc::new(PciBus::new(map, aggregator));
        let f = Arc::new(Function::endpoint(
            0x1234,
            0x0001,
            0x06,
            0x00,
            0,
            1,
            1,
            [
                Some(BarRequest {
                    shape: BarShape::Mem32 { size: 0x1000, prefetchable: false },
                    device: Arc::new(DummyDev),
                }),
                None,
                None,
                None,
                None,
                None,
            ],
        ));
        pci_bus.attach(0x10, f.clone(), 0).unwrap();
        (HostBridge::new(pci_bus, 1), f)
    }

    struct DummyDev;
    impl MmioDevice for DummyDev {
        fn read(&self, _offset: u64, _buf: &mut [u8]) -> bool {
            true
        }
        fn write(&self, _offset: u64, _buf: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn host_bridge_vendor_reads_at_ecam_base() {
        let (bridge, _f) = bridge_with_one_function();
        let mut buf = [0u8; 4];
        bridge.read(0, &mut buf);
        let word = u32::from_le_bytes(buf);
        assert_eq!(word & 0xFFFF, u32::from(HOST_BRIDGE_VENDOR_ID));
    }

    #[test]
    fn unattached_slot_reads_all_ones() {
        let (bridge, _f) = bridge_with_one_function();
        let mut buf = [0u8; 4];
        // Bus-address 1 (offset 0x1000) has nothing attached, unlike bus
        // 0 register 0x800 which is still a register of the present host
        // bridge itself.
        bridge.read(0x1000, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 0xFFFF_FFFF);
    }

    #[test]
    fn bar_sizing_handshake_through_ecam() {
        let (bridge, _f) = bridge_with_one_function();
        bridge.write(0x10_000 + 0x10, &0xFFFF_FFFFu32.to_le_bytes());
        let mut buf = [0u8; 4];
        bridge.read(0x10_000 + 0x10, &mut buf);
        assert_eq!(u32::from_le_bytes(buf) & 0xFFF, 0);
        assert_eq!(u32::from_le_bytes(buf) & 0xFFFF_F000, 0xFFFF_F000);
    }
}
