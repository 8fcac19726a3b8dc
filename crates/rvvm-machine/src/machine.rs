//! The machine orchestrator (component G): owns every hart and the physical
//! map, drives their lifecycle, and runs the external tick loop devices hang
//! their `update` callbacks off of.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rvvm_cpu::{Hart, HartControl, Interpreter, NoJit};
use rvvm_intc::plic::DeliveryMode;
use rvvm_intc::{InterruptTarget, IrqAggregator, LocalInterruptor, WallClock};
use rvvm_mem::{MmioDevice, PhysicalMap, Region};
use rvvm_pci::{HostBridge, PciBus};
use rvvm_support::Handle;
use tracing::{info, info_span, warn};

use crate::config::MachineConfig;
use crate::dtb;
use crate::error::{MachineError, MachineResult};

/// Guest physical base of the ECAM configuration window, chosen below the
/// RAM base so it never competes with the conventional virt-machine layout
/// `MachineConfig` assumes for RAM/boot PC.
const PCI_ECAM_BASE: u64 = 0x3000_0000;

/// A single-bus topology covers every slot a guest could need (32 devices x
/// 8 functions); a second bus is only worth the ECAM window's 1 MiB when a
/// root port is in play, which this platform doesn't model yet.
const PCI_ECAM_BUSES: u8 = 1;

/// Cadence of the event loop's `update` sweep and wall-clock advance.
const EVENTLOOP_TICK: Duration = Duration::from_millis(1);

/// A hart either sitting un-spawned (owned directly) or moved into its
/// worker thread (owned by the `JoinHandle`, recovered on join).
enum HartSlot {
    Stopped(Hart),
    Running(JoinHandle<Hart>),
    /// Transient placeholder while a transition is in flight; never
    /// observed outside a single `start`/`join_all` call.
    Empty,
}

/// Owns the harts, the physical map, the interrupt aggregator, and (when
/// present) the PCI host bridge; drives their shared lifecycle.
pub struct Machine {
    config: MachineConfig,
    map: Arc<PhysicalMap>,
    clock: Arc<WallClock>,
    plic: Arc<IrqAggregator>,
    pci: Arc<PciBus>,
    controls: Vec<Arc<HartControl>>,
    harts: Vec<Mutex<HartSlot>>,
    running: AtomicBool,
    power_off: Arc<AtomicBool>,
}

impl Machine {
    /// Allocates RAM, constructs every hart in stopped state, wires up the
    /// platform interrupt aggregator and PCI host bridge, and loads the boot
    /// device tree (caller-supplied or a built-in fallback) plus an optional
    /// kernel image at the reset vector.
    pub fn create(config: MachineConfig) -> MachineResult<Self> {
        config.validate()?;

        let map = Arc::new(PhysicalMap::new());
        map.attach(Region::ram(config.memory_base(), config.memory_size))?;

        let clock = Arc::new(WallClock::new());
        let boot_pc = config.boot_pc();
        let dtb_addr = config.dtb_addr();

        let mut harts = Vec::with_capacity(config.hart_count as usize);
        let mut controls = Vec::with_capacity(config.hart_count as usize);
        for id in 0..config.hart_count as u64 {
            let interruptor = Arc::new(LocalInterruptor::new(clock.clone()));
            let hart = Hart::new(id, config.rv32, boot_pc, dtb_addr, map.clone(), interruptor);
            controls.push(hart.control());
            harts.push(Mutex::new(HartSlot::Stopped(hart)));
        }

        let targets: Vec<(Arc<dyn InterruptTarget>, DeliveryMode)> = controls
            .iter()
            .cloned()
            .map(|control| (control as Arc<dyn InterruptTarget>, DeliveryMode::Machine))
            .collect();
        let plic = Arc::new(IrqAggregator::new(targets));

        let pci = Arc::new(PciBus::new(map.clone(), plic.clone()));
        let host_bridge = Arc::new(HostBridge::new(pci.clone(), PCI_ECAM_BUSES));
        let ecam_size = host_bridge.ecam_size();
        map.attach(Region::mmio(
            PCI_ECAM_BASE,
            ecam_size,
            host_bridge as Arc<dyn MmioDevice>,
            1,
            4,
        ))?;

        let machine = Self {
            config,
            map,
            clock,
            plic,
            pci,
            controls,
            harts,
            running: AtomicBool::new(false),
            power_off: Arc::new(AtomicBool::new(false)),
        };
        machine.load_boot_image()?;

        info!(
            harts = machine.config.hart_count,
            memory = machine.config.memory_size,
            ecam_base = format_args!("{:#x}", PCI_ECAM_BASE),
            "machine created"
        );
        Ok(machine)
    }

    fn load_boot_image(&self) -> MachineResult<()> {
        let blob = match &self.config.dtb_path {
            Some(path) => {
                let bytes = read_file(path)?;
                dtb::load_blob(&self.map, self.config.dtb_addr(), &bytes)?;
                bytes
            }
            None => dtb::load_fallback(&self.map, self.config.dtb_addr())?,
        };
        if let Some(dump_path) = &self.config.dumpdtb_path {
            fs::write(dump_path, &blob).map_err(|source| MachineError::FirmwareIo {
                path: dump_path.display().to_string(),
                source,
            })?;
        }

        if let Some(kernel_path) = &self.config.kernel_path {
            let image = read_file(kernel_path)?;
            let dma = self
                .map
                .dma_ptr(self.config.boot_pc(), image.len() as u64)
                .ok_or_else(|| MachineError::ImageTooLarge {
                    path: kernel_path.display().to_string(),
                    len: image.len(),
                })?;
            dma.write_from(&image);
        }
        Ok(())
    }

    pub fn map(&self) -> &Arc<PhysicalMap> {
        &self.map
    }

    pub fn plic(&self) -> &Arc<IrqAggregator> {
        &self.plic
    }

    pub fn pci(&self) -> &Arc<PciBus> {
        &self.pci
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    /// Signals the event loop to return on its next tick. The only supported
    /// way to stop `run_eventloop`; a concrete power-management device
    /// (external to this crate) calls it from its MMIO write handler.
    pub fn request_power_off(&self) {
        self.power_off.store(true, Ordering::Release);
    }

    /// Spawns every stopped hart's worker thread. A hart already running is
    /// left alone, so calling `start` again after `attach_mmio`'s internal
    /// pause/resume is harmless.
    pub fn start(&self) {
        for (id, slot) in self.harts.iter().enumerate() {
            let mut guard = slot.lock();
            let taken = std::mem::replace(&mut *guard, HartSlot::Empty);
            *guard = match taken {
                HartSlot::Stopped(hart) => {
                    let _span = info_span!("hart", id).entered();
                    HartSlot::Running(hart.spawn(Interpreter::default(), NoJit))
                }
                other => other,
            };
        }
        self.running.store(true, Ordering::Release);
    }

    /// Requests quiescence from every hart and blocks until each has
    /// acknowledged it. Idempotent and nestable: returns whether the machine
    /// was running before this call, so a caller that finds it was already
    /// paused knows not to resume it afterward.
    pub fn pause(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        for control in &self.controls {
            control.pause();
        }
        was_running
    }

    /// Clears every hart's pause request. Only meaningful for harts that are
    /// actually spawned; a hart still `Stopped` simply stays that way until
    /// `start` is called.
    pub fn resume(&self) {
        for control in &self.controls {
            control.resume();
        }
        self.running.store(true, Ordering::Release);
    }

    /// Re-initializes every hart's architectural state and resumes them.
    /// When `reload_firmware` is set, the kernel image and device tree are
    /// re-read from their original paths and rewritten into RAM before
    /// resuming, matching a guest-visible power-cycle rather than a warm
    /// reset.
    pub fn reset(&self, reload_firmware: bool) -> MachineResult<()> {
        let was_running = self.pause();
        for control in &self.controls {
            control.request_reset();
        }
        if reload_firmware {
            self.load_boot_image()?;
        }
        if was_running {
            self.resume();
        }
        Ok(())
    }

    /// Attaches a region, pausing every hart for the duration of the
    /// physical-map mutation and resuming them afterward if they were
    /// running beforehand.
    pub fn attach_mmio(&self, region: Region) -> MachineResult<Handle> {
        let was_running = self.pause();
        let result = self.map.attach(region).map_err(MachineError::from);
        if was_running {
            self.resume();
        }
        result
    }

    /// Attaches a host-backed RAM window at `base`/`size` for a device that
    /// wants a DMA-capable span outside the machine's primary RAM region
    /// (e.g. a coherent scratch buffer shared with a bus-mastering device).
    /// Same pause/resume discipline as `attach_mmio`.
    pub fn attach_dma(&self, base: u64, size: u64) -> MachineResult<Handle> {
        self.attach_mmio(Region::ram(base, size))
    }

    /// Detaches a previously-attached region, invoking its `remove` callback
    /// exactly once while every hart is paused.
    pub fn remove_mmio(&self, handle: Handle) -> MachineResult<()> {
        let was_running = self.pause();
        let result = self.map.remove(handle).map_err(MachineError::from);
        if was_running {
            self.resume();
        }
        result
    }

    /// Blocks the caller, advancing the shared wall clock and sweeping every
    /// attached region's `update` callback on a fixed cadence, until
    /// `request_power_off` is called.
    pub fn run_eventloop(&self) {
        while !self.power_off.load(Ordering::Acquire) {
            self.clock.advance(1);
            for region in self.map.snapshot() {
                if let Some(device) = region.device() {
                    device.update();
                }
            }
            std::thread::sleep(EVENTLOOP_TICK);
        }
        info!("machine powering off");
    }

    /// Requests shutdown of every hart and blocks until each worker thread
    /// has joined, returning their final architectural state. Consumes the
    /// machine: after this call nothing may touch its physical map or
    /// interrupt aggregator again.
    pub fn join_all(self) -> Vec<Hart> {
        for control in &self.controls {
            control.request_shutdown();
        }
        let mut joined = Vec::with_capacity(self.harts.len());
        for slot in &self.harts {
            let mut guard = slot.lock();
            let taken = std::mem::replace(&mut *guard, HartSlot::Empty);
            match taken {
                HartSlot::Running(handle) => {
                    joined.push(handle.join().expect("hart worker thread panicked"));
                }
                HartSlot::Stopped(hart) => joined.push(hart),
                HartSlot::Empty => unreachable!("hart slot left empty outside a transition"),
            }
        }
        joined
    }
}

fn read_file(path: &std::path::Path) -> MachineResult<Vec<u8>> {
    fs::read(path).map_err(|source| MachineError::FirmwareIo {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn config(hart_count: u32) -> MachineConfig {
        let mut cfg = MachineConfig::default();
        cfg.hart_count = hart_count;
        cfg.memory_size = 1024 * 1024;
        cfg
    }

    #[test]
    fn create_attaches_ram_dtb_and_ecam() {
        let machine = Machine::create(config(1)).unwrap();
        assert!(machine.map().find(machine.config.memory_base(), 4096).is_some());
        assert!(machine.map().find(PCI_ECAM_BASE, 4096).is_some());
    }

    #[test]
    fn start_pause_reports_previous_running_state() {
        let machine = Machine::create(config(2)).unwrap();
        machine.start();
        std::thread::sleep(Duration::from_millis(5));
        let was_running = machine.pause();
        assert!(was_running);
        let was_running_again = machine.pause();
        assert!(!was_running_again);
        machine.resume();
        let harts = machine.join_all();
        assert_eq!(harts.len(), 2);
    }

    #[test]
    fn attach_mmio_rejects_overlap_with_ram() {
        let machine = Machine::create(config(1)).unwrap();
        let base = machine.config.memory_base();
        let err = machine.attach_mmio(Region::ram(base, 0x1000)).unwrap_err();
        assert!(matches!(err, MachineError::Memory(_)));
    }

    #[test]
    fn run_eventloop_returns_once_powered_off() {
        let machine = Arc::new(Machine::create(config(1)).unwrap());
        let handle = {
            let machine = machine.clone();
            std::thread::spawn(move || machine.run_eventloop())
        };
        std::thread::sleep(Duration::from_millis(5));
        machine.request_power_off();
        handle.join().unwrap();
    }

    #[test]
    fn zero_harts_is_rejected_at_create() {
        let err = Machine::create(config(0)).unwrap_err();
        assert!(matches!(err, MachineError::ZeroHarts));
    }
}
