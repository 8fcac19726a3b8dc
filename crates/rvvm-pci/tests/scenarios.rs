//! Cross-crate integration scenarios spanning `rvvm-pci`, `rvvm-mem`, and
//! `rvvm-intc`: the ECAM window attached to a real [`PhysicalMap`] and
//! driven through the same `rvvm_mem::mmio` dispatch path a hart's
//! load/store would use, rather than calling the host bridge's `MmioDevice`
//! methods directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rvvm_intc::{DeliveryMode, InterruptTarget, IrqAggregator};
use rvvm_mem::{mmio, MmioDevice, PhysicalMap, Region};
use rvvm_pci::function::{BarRequest, BarShape};
use rvvm_pci::{Function, HostBridge, PciBus};

const ECAM_BASE: u64 = 0x3000_0000;

struct RecordingTarget(AtomicU64);
impl InterruptTarget for RecordingTarget {
    fn raise(&self, bit: u64) {
        self.0.fetch_or(bit, Ordering::SeqCst);
    }
    fn lower(&self, bit: u64) {
        self.0.fetch_and(!bit, Ordering::SeqCst);
    }
}

struct DummyDevice;
impl MmioDevice for DummyDevice {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> bool {
        true
    }
    fn write(&self, _offset: u64, _buf: &[u8]) -> bool {
        true
    }
}

/// Builds a `PhysicalMap` with a single-bus ECAM window attached at
/// [`ECAM_BASE`], one function occupying device 2 with a 4 KiB BAR and
/// INTx pin A, and the aggregator target that will observe its interrupts.
fn harness() -> (Arc<PhysicalMap>, Arc<PciBus>, Arc<RecordingTarget>) {
    let map = Arc::new(PhysicalMap::new());
    let target = Arc::new(RecordingTarget(AtomicU64::new(0)));
    let aggregator = Arc::new(IrqAggregator::new(vec![(
        target.clone() as Arc<dyn InterruptTarget>,
        DeliveryMode::Machine,
    )]));
    let pci = Arc::new(PciBus::new(map.clone(), aggregator.clone()));

    let function = Arc::new(Function::endpoint(
        0x1234,
        0x0001,
        0x06,
        0x00,
        0,
        1,
        1, // INTx pin A
        [
            Some(BarRequest {
                shape: BarShape::Mem32 { size: 0x1000, prefetchable: false },
                device: Arc::new(DummyDevice),
            }),
            None,
            None,
            None,
            None,
            None,
        ],
    ));
    // Device 2, function 0 -> bus-address 0x10.
    pci.attach(0x10, function, 0).unwrap();

    let bridge = Arc::new(HostBridge::new(pci.clone(), 1));
    map.attach(Region::mmio(ECAM_BASE, bridge.ecam_size(), bridge, 1, 4)).unwrap();

    (map, pci, target)
}

/// Scenario 2: reading 4 bytes at ECAM base + 0 returns the synthetic host
/// bridge's vendor id in the low 16 bits; an unattached slot reads all-ones.
#[test]
fn pci_ecam_probe_through_physical_map() {
    let (map, _pci, _target) = harness();

    let host_bridge_word = mmio::read(&map, ECAM_BASE, 4).unwrap();
    assert_eq!(host_bridge_word & 0xFFFF, u64::from(rvvm_pci::ecam::HOST_BRIDGE_VENDOR_ID));

    // Bus-address 1 (bridge's own slot is 0, the function lives at 0x10).
    let unattached = mmio::read(&map, ECAM_BASE + 0x1000, 4).unwrap();
    assert_eq!(unattached, 0xFFFF_FFFF);

    let attached = mmio::read(&map, ECAM_BASE + 0x10_000, 4).unwrap();
    assert_eq!(attached & 0xFFFF, 0x1234);
}

/// Scenario 3: writing `0xFFFFFFFF` to BAR0 of the 4 KiB-sized function and
/// reading back reports the size mask in the low bits.
#[test]
fn bar_sizing_handshake_through_ecam_dispatch() {
    let (map, _pci, _target) = harness();
    let bar0 = ECAM_BASE + 0x10_000 + 0x10;

    mmio::write(&map, bar0, 4, 0xFFFF_FFFF).unwrap();
    let readback = mmio::read(&map, bar0, 4).unwrap();

    assert_eq!(readback & 0xFFF, 0, "BAR base must be size-aligned");
    assert_eq!(readback & 0xFFFF_F000, 0xFFFF_F000);
}

/// Scenario 4: raising the IRQ of the function at device 2 pin A must set
/// the pending bit at aggregator source `(2+1+3) mod 4 = 2`.
#[test]
fn intx_routing_matches_crossing_rotation_formula() {
    let (_map, pci, target) = harness();

    pci.send_irq(0x10, &[]).unwrap();

    assert_ne!(target.0.load(Ordering::SeqCst) & rvvm_intc::MEIP_BIT, 0);
    // device=2, pin(A)=0 zero-indexed; aggregator reserves source 0, so the
    // lane-th allocated source carries id `lane + 1` — which is exactly the
    // literal `(2+1+3) mod 4 = 2` the scenario specifies.
    let lane = rvvm_pci::intx_lane(2, 0);
    assert_eq!(pci.intx_source(lane), 2);
}

/// DMA pointer resolution (used by scenario 6's BMDMA path, modeled here
/// without the out-of-scope ATA device): a function with Bus Master unset
/// gets no DMA pointer; enabling it makes the RAM range resolvable.
#[test]
fn pci_dma_ptr_requires_bus_master() {
    let map = Arc::new(PhysicalMap::new());
    map.attach(Region::ram(0x8000_0000, 0x10000)).unwrap();
    let aggregator = Arc::new(IrqAggregator::new(Vec::new()));
    let pci = PciBus::new(map, aggregator);

    let function = Arc::new(Function::endpoint(
        0xABCD,
        1,
        0x01,
        0x01,
        0,
        1,
        0,
        [None, None, None, None, None, None],
    ));
    pci.attach(0x08, function.clone(), 0).unwrap();

    assert!(pci.pci_dma_ptr(0x08, 0x8000_0010, 16).is_none());
    function.set_command(rvvm_pci::Command::BUS_MASTER);
    assert!(pci.pci_dma_ptr(0x08, 0x8000_0010, 16).is_some());
}
