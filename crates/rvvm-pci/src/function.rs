//! PCI function descriptor: identity fields, BARs, command/status, and the
//! capability list.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use rvvm_mem::MmioDevice;
use rvvm_support::Handle;

bitflags! {
    /// The PCI command register. Only the bits the bridge actually
    /// interprets are modeled; unknown bits round-trip but do nothing.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE      = 1 << 0;
        const MEM_SPACE     = 1 << 1;
        const BUS_MASTER    = 1 << 2;
        const INTX_DISABLE  = 1 << 10;
    }
}

/// Status register bit reported whenever INTx is not disabled and this
/// function has a pending wired interrupt.
pub const STATUS_INTX_ACTIVE: u16 = 1 << 3;

/// The shape of one BAR slot, fixed at function construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarShape {
    Io { size: u32 },
    Mem32 { size: u32, prefetchable: bool },
    /// Occupies this slot and the next one, which reads/writes the high
    /// 32 bits of the same base address.
    Mem64 { size: u64, prefetchable: bool },
}

impl BarShape {
    fn size64(&self) -> u64 {
        match *self {
            BarShape::Io { size } => size as u64,
            BarShape::Mem32 { size, .. } => size as u64,
            BarShape::Mem64 { size, .. } => size,
        }
    }

    fn is_io(&self) -> bool {
        matches!(self, BarShape::Io { .. })
    }
}

enum BarSlot {
    Empty,
    /// The primary slot of a BAR (width 32 or the low half of a 64-bit
    /// BAR). `base` always holds the full address for `Mem64`.
    Primary { shape: BarShape, base: u64, region: Option<Handle> },
    /// The upper half of a 64-bit BAR at `primary`.
    HighHalf { primary: usize },
}

/// A populated PCI function: identity, BARs, command/status, MSI config,
/// and the capability list the configuration-space reader reconstructs
/// from.
pub struct Function {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub irq_pin: u8,
    command: AtomicU16,
    status_extra: AtomicU16,
    bars: Mutex<[BarSlot; 6]>,
    msi: MsiState,
    /// `None` for an ordinary endpoint; `Some` for a class 0x0604
    /// PCI-PCI bridge function, where BARs 2-5 are bridge configuration
    /// rather than MMIO regions.
    bridge_config: Option<Mutex<BridgeConfig>>,
    /// Backing MMIO devices for non-empty BARs, keyed by BAR index, set
    /// once at construction and attached to the physical map on bus
    /// attach.
    pub(crate) bar_devices: Vec<(u8, Arc<dyn MmioDevice>)>,
}

#[derive(Default)]
struct BridgeConfig {
    primary_bus: u8,
    secondary_bus: u8,
    subordinate_bus: u8,
    io_base: u8,
    io_limit: u8,
    mem_base: u16,
    mem_limit: u16,
}

struct MsiState {
    enabled: std::sync::atomic::AtomicBool,
    address: AtomicU32,
    address_hi: AtomicU32,
    data: AtomicU32,
}

impl Default for MsiState {
    fn default() -> Self {
        Self {
            enabled: std::sync::atomic::AtomicBool::new(false),
            address: AtomicU32::new(0),
            address_hi: AtomicU32::new(0),
            data: AtomicU32::new(0),
        }
    }
}

/// A builder-supplied description of one BAR slot before attach.
pub struct BarRequest {
    pub shape: BarShape,
    pub device: Arc<dyn MmioDevice>,
}

impl Function {
    /// Construct an endpoint function. `bars[i]` is `None` for an unused
    /// slot; a `Mem64` request at index `i` must leave `i+1` as `None`.
    pub fn endpoint(
        vendor_id: u16,
        device_id: u16,
        class: u8,
        subclass: u8,
        prog_if: u8,
        revision: u8,
        irq_pin: u8,
        bar_requests: [Option<BarRequest>; 6],
    ) -> Self {
        let mut bars: [BarSlot; 6] = [
            BarSlot::Empty,
            BarSlot::Empty,
            BarSlot::Empty,
            BarSlot::Empty,
            BarSlot::Empty,
            BarSlot::Empty,
        ];
        let mut bar_devices = Vec::new();
        let mut i = 0;
        for req in bar_requests {
            if let Some(req) = req {
                let occupies_two = matches!(req.shape, BarShape::Mem64 { .. });
                bar_devices.push((i as u8, req.device));
                bars[i] = BarSlot::Primary {
                    shape: req.shape,
                    base: 0,
                    region: None,
                };
                if occupies_two {
                    bars[i + 1] = BarSlot::HighHalf { primary: i };
                }
            }
            i += 1;
        }
        Self {
            vendor_id,
            device_id,
            class,
            subclass,
            prog_if,
            revision,
            irq_pin,
            command: AtomicU16::new(0),
            status_extra: AtomicU16::new(0),
            bars: Mutex::new(bars),
            msi: MsiState::default(),
            bridge_config: None,
            bar_devices,
        }
    }

    /// Construct a class 0x0604 PCI-PCI bridge function. BARs 2-5 are not
    /// MMIO windows; they back the bridge's secondary-bus and io/mem
    /// aperture registers instead.
    pub fn pci_bridge(vendor_id: u16, device_id: u16, revision: u8) -> Self {
        Self {
            vendor_id,
            device_id,
            class: 0x06,
            subclass: 0x04,
            prog_if: 0,
            revision,
            irq_pin: 0,
            command: AtomicU16::new(0),
            status_extra: AtomicU16::new(0),
            bars: Mutex::new([
                BarSlot::Empty,
                BarSlot::Empty,
                BarSlot::Empty,
                BarSlot::Empty,
                BarSlot::Empty,
                BarSlot::Empty,
            ]),
            msi: MsiState::default(),
            bridge_config: Some(Mutex::new(BridgeConfig::default())),
            bar_devices: Vec::new(),
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.bridge_config.is_some()
    }

    pub fn command(&self) -> Command {
        Command::from_bits_truncate(self.command.load(Ordering::Relaxed))
    }

    pub fn set_command(&self, command: Command) {
        self.command.store(command.bits(), Ordering::Relaxed);
    }

    pub fn bus_master_enabled(&self) -> bool {
        self.command().contains(Command::BUS_MASTER)
    }

    pub fn intx_disabled(&self) -> bool {
        self.command().contains(Command::INTX_DISABLE)
    }

    /// Mark (or clear) the wired-INTx-pending status bit the status
    /// register reports back.
    pub fn set_intx_status(&self, active: bool) {
        if active {
            self.status_extra.fetch_or(STATUS_INTX_ACTIVE, Ordering::Relaxed);
        } else {
            self.status_extra.fetch_and(!STATUS_INTX_ACTIVE, Ordering::Relaxed);
        }
    }

    pub fn status(&self) -> u16 {
        self.status_extra.load(Ordering::Relaxed)
    }

    pub fn msi_enabled(&self) -> bool {
        self.msi.enabled.load(Ordering::Relaxed)
    }

    pub fn msi_message(&self) -> rvvm_intc::MsiMessage {
        let lo = self.msi.address.load(Ordering::Relaxed) as u64;
        let hi = self.msi.address_hi.load(Ordering::Relaxed) as u64;
        rvvm_intc::MsiMessage {
            address: (hi << 32) | lo,
            data: self.msi.data.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_msi_enabled(&self, enabled: bool) {
        self.msi.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn set_msi_address_lo(&self, value: u32) {
        self.msi.address.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_msi_address_hi(&self, value: u32) {
        self.msi.address_hi.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_msi_data(&self, value: u32) {
        self.msi.data.store(value, Ordering::Relaxed);
    }

    /// Read a BAR register's current raw 32-bit contents.
    pub fn read_bar(&self, index: u8) -> u32 {
        let bars = self.bars.lock();
        read_bar_locked(&bars, index as usize)
    }

    /// Write a BAR register. Returns the resulting base/size so the
    /// caller (the bus) can relocate the backing physical-map region.
    pub fn write_bar(&self, index: u8, value: u32) -> Option<BarWriteEffect> {
        let mut bars = self.bars.lock();
        write_bar_locked(&mut bars, index as usize, value)
    }

    pub(crate) fn record_region_handle(&self, index: u8, handle: Handle) {
        let mut bars = self.bars.lock();
        if let BarSlot::Primary { region, .. } = &mut bars[index as usize] {
            *region = Some(handle);
        }
    }

    pub(crate) fn region_handle(&self, index: u8) -> Option<Handle> {
        let bars = self.bars.lock();
        match &bars[index as usize] {
            BarSlot::Primary { region, .. } => *region,
            _ => None,
        }
    }

    pub(crate) fn bar_base(&self, index: u8) -> Option<u64> {
        let bars = self.bars.lock();
        match &bars[index as usize] {
            BarSlot::Primary { base, .. } => Some(*base),
            _ => None,
        }
    }

    pub(crate) fn bar_size(&self, index: u8) -> Option<u64> {
        let bars = self.bars.lock();
        match &bars[index as usize] {
            BarSlot::Primary { shape, .. } => Some(shape.size64()),
            _ => None,
        }
    }

    pub(crate) fn bar_is_io(&self, index: u8) -> bool {
        let bars = self.bars.lock();
        matches!(&bars[index as usize], BarSlot::Primary { shape, .. } if shape.is_io())
    }

    /// Set a BAR's base address directly (bypassing the guest-visible
    /// masked-write path). Used once, at bus attach time, to place a BAR at
    /// the address `zone_auto` picked.
    pub(crate) fn write_bar_base(&self, index: u8, base: u64) {
        let mut bars = self.bars.lock();
        if let BarSlot::Primary { base: slot, .. } = &mut bars[index as usize] {
            *slot = base;
        }
    }

    /// The function's capability list, reconstructed on every config-space
    /// read from live register state rather than stored as a blob. PCI
    /// Express v2 endpoint, power management, and MSI (64-bit, one vector)
    /// are pre-seeded on every function; the MSI capability's four words
    /// are the only ones a guest write can change.
    pub(crate) fn msi_raw(&self) -> [u32; 4] {
        let enabled = self.msi.enabled.load(Ordering::Relaxed) as u32;
        [
            enabled,
            self.msi.address.load(Ordering::Relaxed),
            self.msi.address_hi.load(Ordering::Relaxed),
            self.msi.data.load(Ordering::Relaxed),
        ]
    }

    pub(crate) fn write_msi_raw(&self, word: usize, value: u32) {
        match word {
            0 => self.set_msi_enabled(value & 1 != 0),
            1 => self.set_msi_address_lo(value),
            2 => self.set_msi_address_hi(value),
            3 => self.set_msi_data(value),
            _ => {}
        }
    }

    /// Read one of the class-0x0604 bridge's secondary-bus-number or
    /// io/mem-window registers at standard config offset `offset`
    /// (`0x18`, `0x1C`, `0x20`). `None` for an ordinary endpoint or an
    /// offset this bridge doesn't back with a register.
    pub(crate) fn read_bridge_word(&self, offset: u16) -> Option<u32> {
        let cfg = self.bridge_config.as_ref()?.lock();
        match offset {
            0x18 => Some(
                u32::from(cfg.primary_bus)
                    | (u32::from(cfg.secondary_bus) << 8)
                    | (u32::from(cfg.subordinate_bus) << 16),
            ),
            0x1C => Some(u32::from(cfg.io_base) | (u32::from(cfg.io_limit) << 8)),
            0x20 => Some(u32::from(cfg.mem_base) | (u32::from(cfg.mem_limit) << 16)),
            _ => None,
        }
    }

    pub(crate) fn write_bridge_word(&self, offset: u16, value: u32) {
        let Some(bridge_config) = self.bridge_config.as_ref() else { return };
        let mut cfg = bridge_config.lock();
        match offset {
            0x18 => {
                cfg.primary_bus = value as u8;
                cfg.secondary_bus = (value >> 8) as u8;
                cfg.subordinate_bus = (value >> 16) as u8;
            }
            0x1C => {
                cfg.io_base = value as u8;
                cfg.io_limit = (value >> 8) as u8;
            }
            0x20 => {
                cfg.mem_base = value as u16;
                cfg.mem_limit = (value >> 16) as u16;
            }
            _ => {}
        }
    }
}

/// What a BAR write changed, so the bus can relocate the live MMIO
/// region if the base moved.
pub struct BarWriteEffect {
    pub index: u8,
    pub new_base: u64,
    pub size: u64,
}

fn read_bar_locked(bars: &[BarSlot; 6], index: usize) -> u32 {
    match &bars[index] {
        BarSlot::Empty => 0,
        BarSlot::HighHalf { primary } => {
            if let BarSlot::Primary { base, .. } = &bars[*primary] {
                (*base >> 32) as u32
            } else {
                0
            }
        }
        BarSlot::Primary { shape, base, .. } => match shape {
            BarShape::Io { size } => {
                let mask = !(*size - 1);
                ((*base as u32) & mask) | 0x1
            }
            BarShape::Mem32 { size, prefetchable } => {
                let mask = !(*size - 1);
                let type_bits = if *prefetchable { 0b1000 } else { 0 };
                ((*base as u32) & mask) | type_bits
            }
            BarShape::Mem64 { prefetchable, .. } => {
                let type_bits = 0b0100 | if *prefetchable { 0b1000 } else { 0 };
                ((*base as u32) & 0xFFFF_FFF0) | type_bits
            }
        },
    }
}

fn write_bar_locked(bars: &mut [BarSlot; 6], index: usize, value: u32) -> Option<BarWriteEffect> {
    match &mut bars[index] {
        BarSlot::Empty => None,
        BarSlot::HighHalf { primary } => {
            let primary = *primary;
            if let BarSlot::Primary { shape, base, .. } = &mut bars[primary] {
                *base = (*base & 0xFFFF_FFFF) | ((value as u64) << 32);
                Some(BarWriteEffect { index: primary as u8, new_base: *base, size: shape.size64() })
            } else {
                None
            }
        }
        BarSlot::Primary { shape, base, .. } => {
            let new_low = match shape {
                BarShape::Io { size } => value & !(*size - 1) & !0x3,
                BarShape::Mem32 { size, .. } => value & !(*size - 1) & !0xF,
                BarShape::Mem64 { size, .. } => {
                    let size32 = (*size).min(u32::MAX as u64) as u32;
                    value & !(size32.wrapping_sub(1)) & !0xF
                }
            };
            *base = (*base & 0xFFFF_FFFF_0000_0000) | new_low as u64;
            Some(BarWriteEffect { index: index as u8, new_base: *base, size: shape.size64() })
        }
    }
}
