//! The PCI bus: INTx rotation, guest-visible apertures, and the sparse
//! table of attached functions.

use std::sync::Arc;

use parking_lot::Mutex;
use rvvm_mem::{MemResult, PhysicalMap, Region};
use rvvm_support::{Handle, OpenHashMap};

use crate::error::{PciError, PciResult};
use crate::function::Function;

/// Number of wired INTx lanes on the bus.
pub const INTX_LANES: u32 = 4;

/// Rotation routing: function at device `d`, pin `p` (0-indexed: A=0) maps
/// to physical lane `(d + p + 3) mod 4`.
pub fn intx_lane(device: u32, pin: u32) -> u32 {
    (device + pin + 3) % INTX_LANES
}

struct AttachedFunction {
    function: Arc<Function>,
    bar_handles: Vec<(u8, Handle)>,
}

/// One PCI bus: a sparse table of attached functions plus the shared INTx
/// aggregator lanes they rotate onto.
pub struct PciBus {
    map: Arc<PhysicalMap>,
    attached: Mutex<OpenHashMap<u16, AttachedFunction>>,
    /// One wired-IRQ source per lane, pre-allocated from the interrupt
    /// aggregator at bus construction.
    intx_sources: [u32; INTX_LANES as usize],
    aggregator: Arc<rvvm_intc::IrqAggregator>,
}

impl PciBus {
    pub fn new(map: Arc<PhysicalMap>, aggregator: Arc<rvvm_intc::IrqAggregator>) -> Self {
        let mut intx_sources = [0u32; INTX_LANES as usize];
        for lane in intx_sources.iter_mut() {
            *lane = aggregator.alloc_source();
            aggregator.set_priority(*lane, 1).expect("source just allocated");
        }
        Self {
            map,
            attached: Mutex::new(OpenHashMap::new()),
            intx_sources,
            aggregator,
        }
    }

    pub fn route_intx(&self, hart: usize, device: u32, enabled: bool) -> PciResult<()> {
        for pin in 0..INTX_LANES {
            let lane = intx_lane(device, pin);
            self.aggregator
                .set_enabled(hart, self.intx_sources[lane as usize], enabled)
                .map_err(|_| PciError::NoSuchFunction(0))?;
        }
        Ok(())
    }

    /// The lowest free bus-address at device granularity (function 0 of
    /// each device), walking `0x08, 0x10, 0x18, ...`. Stops before the
    /// PCIe-root-port range reserved at `0x100`.
    pub fn auto_multifunc_slot(&self) -> PciResult<u16> {
        self.scan_slots(0x08, 0x08, 0x100)
    }

    /// The lowest free root-port bus-address, walking `0x100, 0x200, ...`
    /// — one secondary bus per root port, so the step is a full bus
    /// granularity rather than the `0x08` device granularity used for
    /// ordinary multi-function slots.
    pub fn auto_root_port_slot(&self) -> PciResult<u16> {
        self.scan_slots(0x100, 0x100, 0x10000)
    }

    fn scan_slots(&self, start: u16, step: u16, limit: u32) -> PciResult<u16> {
        let attached = self.attached.lock();
        let mut candidate = start as u32;
        while candidate < limit {
            if !attached.contains_key(&(candidate as u16)) {
                return Ok(candidate as u16);
            }
            candidate += step as u32;
        }
        Err(PciError::NoFreeSlot)
    }

    /// Attach `function` at `bus_address`, allocating MMIO addresses for
    /// every non-empty BAR via `zone_auto` and registering them on the
    /// physical map. Wires the function's IRQ pin into the rotation table.
    pub fn attach(&self, bus_address: u16, function: Arc<Function>, hart: usize) -> PciResult<()> {
        let mut attached = self.attached.lock();
        if attached.contains_key(&bus_address) {
            return Err(PciError::SlotOccupied(bus_address));
        }

        let mut bar_handles = Vec::new();
        for (index, device) in &function.bar_devices {
            let Some(size) = function.bar_size(*index) else { continue };
            let base = self.map.zone_auto(0x1000_0000, size)?;
            let handle = attach_bar_region(&self.map, base, size, device.clone(), function.bar_is_io(*index))?;
            function.write_bar_base(*index, base);
            function.record_region_handle(*index, handle);
            bar_handles.push((*index, handle));
        }

        if function.irq_pin != 0 {
            let device = ((bus_address >> 3) & 0x1F) as u32;
            let pin = (function.irq_pin - 1) as u32;
            let lane = intx_lane(device, pin);
            self.aggregator
                .set_enabled(hart, self.intx_sources[lane as usize], true)
                .ok();
        }

        attached.insert(bus_address, AttachedFunction { function, bar_handles });
        Ok(())
    }

    pub fn function(&self, bus_address: u16) -> Option<Arc<Function>> {
        self.attached.lock().get(&bus_address).map(|a| a.function.clone())
    }

    /// The bus-address a previously-attached function is registered under,
    /// found by identity rather than by value (two functions can otherwise
    /// be indistinguishable by their public fields).
    pub fn bus_address_of(&self, function: &Arc<Function>) -> Option<u16> {
        self.attached
            .lock()
            .iter()
            .find(|(_, attached)| Arc::ptr_eq(&attached.function, function))
            .map(|(addr, _)| *addr)
    }

    /// Whether any function other than 0 is populated at the device
    /// addressed by `bus_address`'s bus+device bits — the guest-visible
    /// multi-function header-type bit is derived from this, not stored.
    pub fn is_multifunction(&self, bus_address: u16) -> bool {
        let device_base = bus_address & !0x7;
        let attached = self.attached.lock();
        (1..8).any(|f| attached.contains_key(&(device_base | f)))
    }

    /// Relocate the physical-map region backing BAR `index` of the
    /// function at `bus_address` to `new_base`, per a guest BAR write.
    /// Per the machine's racy-by-design BAR relocation policy (see the
    /// crate's top-level docs), the old region is detached only after the
    /// replacement is attached, so no in-flight access ever dereferences a
    /// freed region.
    pub fn relocate_bar(&self, bus_address: u16, index: u8, new_base: u64) -> PciResult<()> {
        let mut attached = self.attached.lock();
        let entry = attached.get_mut(&bus_address).ok_or(PciError::NoSuchFunction(bus_address))?;
        let Some((_, device)) = entry.function.bar_devices.iter().find(|(i, _)| *i == index) else {
            return Ok(());
        };
        let Some(size) = entry.function.bar_size(index) else { return Ok(()) };
        let is_io = entry.function.bar_is_io(index);
        let new_handle = attach_bar_region(&self.map, new_base, size, device.clone(), is_io)?;
        if let Some(old) = entry.bar_handles.iter_mut().find(|(i, _)| *i == index) {
            let old_handle = old.1;
            old.1 = new_handle;
            self.map.remove(old_handle).ok();
        }
        entry.function.record_region_handle(index, new_handle);
        Ok(())
    }

    /// Generate an interrupt for the function at `bus_address`: an MSI if
    /// the function has MSI enabled, otherwise a wired INTx through the
    /// rotation table (unless INTx is masked via the command register).
    ///
    /// `msi_targets` is the machine's flat table of per-hart interrupt
    /// targets; since the source doesn't define how an MSI's posted
    /// address selects a hart (see the crate's Open Questions in
    /// `DESIGN.md`), this implementation routes by the message address
    /// modulo the target count, matching the convention a platform's MSI
    /// doorbell decoder would apply to a posted-write address.
    pub fn send_irq(
        &self,
        bus_address: u16,
        msi_targets: &[Arc<dyn rvvm_intc::InterruptTarget>],
    ) -> PciResult<()> {
        let function = self.function(bus_address).ok_or(PciError::NoSuchFunction(bus_address))?;
        if function.msi_enabled() {
            if !msi_targets.is_empty() {
                let message = function.msi_message();
                let target = &msi_targets[(message.address as usize) % msi_targets.len()];
                rvvm_intc::msi::deliver(target, message);
            }
            return Ok(());
        }
        if function.intx_disabled() {
            return Ok(());
        }
        let device = ((bus_address >> 3) & 0x1F) as u32;
        let pin = function.irq_pin.saturating_sub(1) as u32;
        let lane = intx_lane(device, pin);
        function.set_intx_status(true);
        self.aggregator.raise(self.intx_sources[lane as usize]).ok();
        Ok(())
    }

    /// A direct host pointer into guest RAM for DMA by the function at
    /// `bus_address`, only when its Bus Master bit is set and the range is
    /// entirely RAM-backed.
    pub fn pci_dma_ptr(&self, bus_address: u16, addr: u64, size: u64) -> Option<rvvm_mem::DmaPtr> {
        let function = self.function(bus_address)?;
        if !function.bus_master_enabled() {
            return None;
        }
        self.map.dma_ptr(addr, size)
    }

    pub fn intx_source(&self, lane: u32) -> u32 {
        self.intx_sources[lane as usize % INTX_LANES as usize]
    }
}

fn attach_bar_region(
    map: &PhysicalMap,
    base: u64,
    size: u64,
    device: Arc<dyn rvvm_mem::MmioDevice>,
    _is_io: bool,
) -> MemResult<Handle> {
    map.attach(Region::mmio(base, size, device, 1, 4))
}
