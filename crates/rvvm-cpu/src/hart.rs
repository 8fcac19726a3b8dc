//! The hart: one virtual CPU's register/CSR/TLB state plus the worker loop
//! that drives an [`ExecutionBackend`] and dispatches traps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rvvm_mem::{mmio, MemError, PhysicalMap};
use tracing::{debug, trace};

use crate::csr::{self, CsrFile};
use crate::exec::{ExecutionBackend, JitBackend, StepOutcome};
use crate::regfile::{FloatRegisters, IntRegisters};
use crate::tlb::{AccessKind, TranslationCache};
use crate::trap::{self, Exception, Interrupt, Privilege, Trap};

/// Sv39 page table depth and per-level shift.
const SV39_LEVELS: u32 = 3;
const PAGE_SHIFT: u32 = 12;
const PTE_SIZE: u64 = 8;

const SATP_MODE_SV39: u64 = 8;

/// Shared control block an external owner (the machine orchestrator) uses
/// to drive a hart's worker thread without owning the hart's register
/// state, which lives entirely inside the thread's stack frame.
pub struct HartControl {
    pub running: AtomicBool,
    pause_requested: AtomicBool,
    reset_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    pending_external: AtomicU64,
    /// Level-style external-interrupt bits (MEIP/SEIP) currently asserted
    /// by the PLIC-equivalent aggregator or an MSI delivery. Mirrored into
    /// `mip` once per worker-loop iteration rather than eagerly, the same
    /// way the timer/IPI bits in [`Hart::run_loop`] are synced.
    external_level: AtomicU64,
    wfi: Mutex<()>,
    wfi_cv: Condvar,
    paused: Mutex<()>,
    paused_cv: Condvar,
}

impl Default for HartControl {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            pending_external: AtomicU64::new(0),
            external_level: AtomicU64::new(0),
            wfi: Mutex::new(()),
            wfi_cv: Condvar::new(),
            paused: Mutex::new(()),
            paused_cv: Condvar::new(),
        }
    }
}

/// Lets the PLIC-equivalent aggregator and MSI delivery raise/lower a
/// hart's external-interrupt bits without reaching into its register file
/// or TLB, which only the owning worker thread touches.
impl rvvm_intc::InterruptTarget for HartControl {
    fn raise(&self, bit: u64) {
        self.external_level.fetch_or(bit, Ordering::Release);
        self.wfi_cv.notify_all();
    }

    fn lower(&self, bit: u64) {
        self.external_level.fetch_and(!bit, Ordering::Release);
    }
}

impl HartControl {
    /// Request quiescence and block until the worker has observed it and
    /// returned from its inner loop. Returns the previous running state so
    /// callers (e.g. the machine pausing every hart) can nest pause/resume.
    pub fn pause(&self) -> bool {
        let was_running = self.running.load(Ordering::Acquire);
        self.pause_requested.store(true, Ordering::Release);
        self.wfi_cv.notify_all();
        let mut guard = self.paused.lock();
        while self.running.load(Ordering::Acquire) {
            self.paused_cv.wait(&mut guard);
        }
        was_running
    }

    /// Asynchronous pause request: returns immediately without waiting for
    /// the worker to acknowledge it.
    pub fn queue_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
        self.wfi_cv.notify_all();
    }

    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::Release);
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.pause_requested.store(true, Ordering::Release);
        self.wfi_cv.notify_all();
    }

    pub fn send_interrupt(&self, bit: u64) {
        self.pending_external.fetch_or(bit, Ordering::Release);
        self.wfi_cv.notify_all();
    }

    fn take_pending_external(&self) -> u64 {
        self.pending_external.swap(0, Ordering::AcqRel)
    }
}

/// One hart's full architectural state.
pub struct Hart {
    pub id: u64,
    pub rv32: bool,
    pub int_regs: IntRegisters,
    pub float_regs: FloatRegisters,
    pub csrs: CsrFile,
    pub privilege: Privilege,
    pub pc: u64,
    pub tlb: TranslationCache,
    pub reservation: Option<u64>,
    pub map: Arc<PhysicalMap>,
    pub local_interruptor: Arc<rvvm_intc::LocalInterruptor>,
    pub control: Arc<HartControl>,
    pub count_instructions: bool,
    /// Set when the guest retires `wfi`; cleared on the next taken
    /// interrupt trap or reset. Checked by `run_loop` to decide whether to
    /// park on the WFI condvar instead of fetching the next instruction.
    pub(crate) wfi_armed: bool,
    inst_counter: rvvm_support::OpenHashMap<&'static str, u64>,
    reset_pc: u64,
    dtb_addr: u64,
}

impl Hart {
    pub fn new(
        id: u64,
        rv32: bool,
        reset_pc: u64,
        dtb_addr: u64,
        map: Arc<PhysicalMap>,
        local_interruptor: Arc<rvvm_intc::LocalInterruptor>,
    ) -> Self {
        let misa_ext = isa_bits(rv32);
        Self {
            id,
            rv32,
            int_regs: IntRegisters::boot(id, dtb_addr),
            float_regs: FloatRegisters::default(),
            csrs: CsrFile::new(id, misa_ext),
            privilege: Privilege::Machine,
            pc: reset_pc,
            tlb: TranslationCache::new(),
            reservation: None,
            map,
            local_interruptor,
            control: Arc::new(HartControl::default()),
            count_instructions: false,
            wfi_armed: false,
            inst_counter: rvvm_support::OpenHashMap::new(),
            reset_pc,
            dtb_addr,
        }
    }

    pub fn control(&self) -> Arc<HartControl> {
        self.control.clone()
    }

    /// Reinitializes architectural state to the post-reset convention.
    /// Callers must ensure the hart is paused first.
    pub fn reset(&mut self) {
        self.int_regs = IntRegisters::boot(self.id, self.dtb_addr);
        self.csrs.reset(self.id);
        self.privilege = Privilege::Machine;
        self.pc = self.reset_pc;
        self.tlb.flush_all();
        self.reservation = None;
        self.wfi_armed = false;
        self.control.reset_requested.store(false, Ordering::Release);
    }

    pub fn count(&mut self, mnemonic: &'static str) {
        if !self.count_instructions {
            return;
        }
        if let Some(count) = self.inst_counter.get_mut(&mnemonic) {
            *count += 1;
        } else {
            self.inst_counter.insert(mnemonic, 1);
        }
    }

    pub fn instruction_counts(&self) -> &rvvm_support::OpenHashMap<&'static str, u64> {
        &self.inst_counter
    }

    /// Spawns the worker thread that drives `backend`/`jit` until a
    /// shutdown is requested, returning the join handle. The hart's state
    /// moves into the thread; external callers only interact with it
    /// through the cloned [`HartControl`].
    pub fn spawn<E, J>(mut self, mut backend: E, mut jit: J) -> JoinHandle<Hart>
    where
        E: ExecutionBackend + 'static,
        J: JitBackend + 'static,
    {
        self.control.running.store(true, Ordering::Release);
        std::thread::Builder::new()
            .name(format!("hart-{}", self.id))
            .spawn(move || {
                self.run_loop(&mut backend, &mut jit);
                self
            })
            .expect("failed to spawn hart worker thread")
    }

    fn run_loop<E: ExecutionBackend, J: JitBackend>(&mut self, backend: &mut E, jit: &mut J) {
        loop {
            if self.control.shutdown_requested.load(Ordering::Acquire) {
                self.acknowledge_pause();
                return;
            }
            if self.control.pause_requested.load(Ordering::Acquire) {
                self.acknowledge_pause();
                self.wait_for_resume();
                continue;
            }

            let external = self.control.take_pending_external();
            if external != 0 {
                self.csrs.set_pending(external);
            }
            let external_level = self.control.external_level.load(Ordering::Acquire);
            for bit in [csr::MEIP_BIT, csr::SEIP_BIT] {
                if external_level & bit != 0 {
                    self.csrs.set_pending(bit);
                } else {
                    self.csrs.clear_pending(bit);
                }
            }
            // Mirrored every iteration, not just after a retired instruction:
            // a hart parked in `sleep_until_interrupt` never reaches the
            // bottom of this loop, so a timer or IPI that becomes due while
            // it's asleep would otherwise never surface as a pending trap.
            if self.local_interruptor.timer_due() {
                self.csrs.set_pending(csr::MTIP_BIT);
            } else {
                self.csrs.clear_pending(csr::MTIP_BIT);
            }
            if self.local_interruptor.ipi_pending() {
                self.csrs.set_pending(csr::MSIP_BIT);
            } else {
                self.csrs.clear_pending(csr::MSIP_BIT);
            }

            if let Some(interrupt) = trap::pending_interrupt(&self.csrs, self.privilege) {
                self.wfi_armed = false;
                self.enter_trap(Trap::Interrupt(interrupt), self.pc);
                continue;
            }

            if self.waiting_for_interrupt() {
                self.sleep_until_interrupt();
                continue;
            }

            let physical_pc = match self.translate(self.pc, AccessKind::Execute) {
                Ok(addr) => addr,
                Err(trap) => {
                    self.enter_trap(trap, self.pc);
                    continue;
                }
            };

            if let Some(result) = jit.try_enter(self, physical_pc) {
                if let Err(trap) = result {
                    self.enter_trap(trap, self.pc);
                }
                continue;
            }

            match backend.step(self) {
                Ok(StepOutcome::Retired) | Ok(StepOutcome::BlockBoundary) => {
                    self.csrs.increment_instret();
                }
                Err(trap) => self.enter_trap(trap, self.pc),
            }
            self.csrs.increment_time();
        }
    }

    fn waiting_for_interrupt(&self) -> bool {
        self.wfi_armed
    }

    fn sleep_until_interrupt(&self) {
        let mut guard = self.control.wfi.lock();
        self.control.wfi_cv.wait_for(&mut guard, Duration::from_millis(1));
    }

    fn acknowledge_pause(&self) {
        self.control.running.store(false, Ordering::Release);
        let _guard = self.control.paused.lock();
        self.control.paused_cv.notify_all();
    }

    fn wait_for_resume(&self) {
        while self.control.pause_requested.load(Ordering::Acquire)
            && !self.control.shutdown_requested.load(Ordering::Acquire)
        {
            std::thread::sleep(Duration::from_micros(200));
        }
        if !self.control.shutdown_requested.load(Ordering::Acquire) {
            self.control.running.store(true, Ordering::Release);
        }
        if self.control.reset_requested.load(Ordering::Acquire) {
            self.reset();
        }
    }

    /// Dispatches a trap per the standard privileged-mode delegation rules:
    /// picks the target privilege (supervisor if delegated and currently at
    /// or below supervisor, machine otherwise), saves the return PC and
    /// cause/tval, stacks the interrupt-enable and previous-privilege bits,
    /// and jumps to the matching vector.
    pub fn enter_trap(&mut self, trap: Trap, trap_value_pc: u64) {
        let delegated = match trap {
            Trap::Exception(e) => trap::exception_delegated(&self.csrs, e),
            Trap::Interrupt(i) => self.csrs.read(csr::MIDELEG) & i.pending_bit() != 0,
        };
        let to_supervisor = delegated && self.privilege != Privilege::Machine;
        let previous_privilege = self.privilege;

        let cause = trap.cause();
        let tval = match trap {
            Trap::Exception(Exception::IllegalInstruction) => 0,
            _ => trap_value_pc,
        };

        if to_supervisor {
            self.csrs.write(csr::SEPC, trap_value_pc);
            self.csrs.write(csr::SCAUSE, cause);
            self.csrs.write(csr::STVAL, tval);
            let sie = self.csrs.read_bits(csr::SSTATUS, trap::XSTATUS_SIE);
            self.csrs.write_bits(csr::SSTATUS, trap::XSTATUS_SPIE, sie);
            self.csrs.write_bits(csr::SSTATUS, trap::XSTATUS_SIE, 0);
            self.csrs
                .write_bits(csr::MSTATUS, csr::MSTATUS_SPP, self.privilege.encode() & 1);
            self.privilege = Privilege::Supervisor;
            let tvec = self.csrs.read(csr::STVEC);
            self.pc = trap_vector_target(tvec, trap);
        } else {
            self.csrs.write(csr::MEPC, trap_value_pc);
            self.csrs.write(csr::MCAUSE, cause);
            self.csrs.write(csr::MTVAL, tval);
            let mie = self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_MIE);
            self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MPIE, mie);
            self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MIE, 0);
            self.csrs
                .write_bits(csr::MSTATUS, csr::MSTATUS_MPP, self.privilege.encode());
            self.privilege = Privilege::Machine;
            let tvec = self.csrs.read(csr::MTVEC);
            self.pc = trap_vector_target(tvec, trap);
        }
        // A privilege change alters which pages are accessible (the U bit
        // permission check depends on it) and, for an M-mode trap, MPRV may
        // start or stop taking effect; a tag cached under the old privilege
        // must not answer a lookup made under the new one.
        if self.privilege != previous_privilege {
            self.tlb.flush_all();
        }
        warn_on_illegal(trap);
    }

    /// Returns from a trap at the given privilege (`mret`/`sret`), restoring
    /// the stacked interrupt-enable bit and previous privilege.
    pub fn trap_return(&mut self, from: Privilege) {
        let previous_privilege = self.privilege;
        match from {
            Privilege::Machine => {
                let mpie = self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_MPIE);
                self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MIE, mpie);
                self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MPIE, 1);
                let mpp = self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_MPP);
                self.privilege = Privilege::from_mpp(mpp);
                self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_MPP, 0);
                self.pc = self.csrs.read(csr::MEPC);
            }
            Privilege::Supervisor => {
                let spie = self.csrs.read_bits(csr::SSTATUS, trap::XSTATUS_SPIE);
                self.csrs.write_bits(csr::SSTATUS, trap::XSTATUS_SIE, spie);
                self.csrs.write_bits(csr::SSTATUS, trap::XSTATUS_SPIE, 1);
                let spp = self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_SPP);
                self.privilege = Privilege::from_mpp(spp);
                self.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_SPP, 0);
                self.pc = self.csrs.read(csr::SEPC);
            }
            Privilege::User => unreachable!("no trap return from user mode"),
        }
        if self.privilege != previous_privilege {
            self.tlb.flush_all();
        }
        trace!(hart = self.id, pc = self.pc, "trap return");
    }

    /// Translates a virtual address for the given access kind, consulting
    /// the TLB first and falling back to a software Sv39 walk on miss. In
    /// Bare mode (`satp.MODE == 0`) or machine mode without MPRV engaged,
    /// translation is the identity function.
    pub fn translate(&self, va: u64, kind: AccessKind) -> Result<u64, Trap> {
        if !self.translation_enabled(kind) {
            return Ok(va);
        }
        if let Some(host) = self.tlb.lookup(va, kind) {
            return Ok(host);
        }
        let pa = self.walk_sv39(va, kind)?;
        let page_base = pa & !0xFFF;
        let va_page = va & !0xFFF;
        self.tlb.insert(va, kind, page_base.wrapping_sub(va_page));
        Ok(pa)
    }

    /// The privilege a translation's permission checks are evaluated under:
    /// the hart's own privilege, except for a data access in machine mode
    /// with `MPRV` set, which borrows the privilege last stacked in `MPP`
    /// (MPRV never applies to instruction fetch).
    fn effective_privilege(&self, kind: AccessKind) -> Privilege {
        if kind != AccessKind::Execute
            && self.privilege == Privilege::Machine
            && self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_MPRV) == 1
        {
            Privilege::from_mpp(self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_MPP))
        } else {
            self.privilege
        }
    }

    fn translation_enabled(&self, kind: AccessKind) -> bool {
        let satp = self.csrs.read(csr::SATP);
        if (satp >> 60) & 0xF != SATP_MODE_SV39 {
            return false;
        }
        self.effective_privilege(kind) != Privilege::Machine
    }

    fn walk_sv39(&self, va: u64, kind: AccessKind) -> Result<u64, Trap> {
        let effective_privilege = self.effective_privilege(kind);
        let sum = self.csrs.read_bits(csr::MSTATUS, csr::MSTATUS_SUM) == 1;
        let satp = self.csrs.read(csr::SATP);
        let mut table_base = (satp & 0x0FFF_FFFF_FFFF) << PAGE_SHIFT;
        let vpn = [
            (va >> 12) & 0x1FF,
            (va >> 21) & 0x1FF,
            (va >> 30) & 0x1FF,
        ];
        let fault = |kind: AccessKind| match kind {
            AccessKind::Execute => Trap::Exception(Exception::InstructionPageFault),
            AccessKind::Read => Trap::Exception(Exception::LoadPageFault),
            AccessKind::Write => Trap::Exception(Exception::StorePageFault),
        };

        let mut level = SV39_LEVELS - 1;
        loop {
            let pte_addr = table_base + vpn[level as usize] * PTE_SIZE;
            let pte = self.read_physical_u64(pte_addr).map_err(|_| fault(kind))?;
            let valid = pte & 1 != 0;
            let readable = pte & 2 != 0;
            let writable = pte & 4 != 0;
            let executable = pte & 8 != 0;
            let user = pte & 16 != 0;
            if !valid || (!readable && writable) {
                return Err(fault(kind));
            }
            let leaf = readable || executable;
            if !leaf {
                if level == 0 {
                    return Err(fault(kind));
                }
                table_base = ((pte >> 10) & 0x0FFF_FFFF_FFFF) << PAGE_SHIFT;
                level -= 1;
                continue;
            }
            // U-mode may never touch a supervisor-only page; S-mode may
            // only touch a user page for data accesses, and only with
            // `mstatus.SUM` set (fetches from a user page are never
            // permitted in S-mode, SUM notwithstanding).
            let privilege_ok = match effective_privilege {
                Privilege::User => user,
                Privilege::Supervisor => !user || (sum && kind != AccessKind::Execute),
                Privilege::Machine => true,
            };
            let permitted = privilege_ok
                && match kind {
                    AccessKind::Read => readable,
                    AccessKind::Write => writable,
                    AccessKind::Execute => executable,
                };
            if !permitted {
                return Err(fault(kind));
            }
            let ppn = (pte >> 10) & 0x0FFF_FFFF_FFFF;
            let page_offset = va & 0xFFF;
            let misaligned_superpage = level > 0 && (ppn & ((1 << (9 * level)) - 1)) != 0;
            if misaligned_superpage {
                return Err(fault(kind));
            }
            let super_mask = (1u64 << (12 + 9 * level)) - 1;
            let pa = ((ppn << 12) & !super_mask) | (va & super_mask & !0xFFFu64) | page_offset;
            return Ok(pa);
        }
    }

    fn read_physical_u64(&self, addr: u64) -> Result<u64, MemError> {
        mmio::read(&self.map, addr, 8)
    }

    pub fn read_mem(&self, va: u64, width: u8) -> Result<u64, Trap> {
        if va % width as u64 != 0 {
            return Err(Trap::Exception(Exception::LoadAddressMisaligned));
        }
        let pa = self.translate(va, AccessKind::Read)?;
        mmio::read(&self.map, pa, width).map_err(|_| Trap::Exception(Exception::LoadAccessFault))
    }

    pub fn write_mem(&self, va: u64, width: u8, value: u64) -> Result<(), Trap> {
        if va % width as u64 != 0 {
            return Err(Trap::Exception(Exception::StoreAddressMisaligned));
        }
        let pa = self.translate(va, AccessKind::Write)?;
        mmio::write(&self.map, pa, width, value).map_err(|_| Trap::Exception(Exception::StoreAccessFault))
    }

    pub fn fetch(&self, va: u64) -> Result<u32, Trap> {
        if va % 2 != 0 {
            return Err(Trap::Exception(Exception::InstructionAddressMisaligned));
        }
        let pa = self.translate(va, AccessKind::Execute)?;
        let word =
            mmio::read(&self.map, pa, 4).map_err(|_| Trap::Exception(Exception::InstructionAccessFault))?;
        Ok(word as u32)
    }
}

fn trap_vector_target(tvec: u64, trap: Trap) -> u64 {
    let base = tvec & !0x3;
    let vectored = tvec & 0x3 == 1;
    if vectored {
        if let Trap::Interrupt(i) = trap {
            return base + 4 * (i.cause() & !(1u64 << 63));
        }
    }
    base
}

fn warn_on_illegal(trap: Trap) {
    if let Trap::Exception(Exception::IllegalInstruction) = trap {
        debug!("illegal instruction trap");
    }
}

/// Standard ISA-extension bits for the MISA CSR: I, M, A, C, S, U, and
/// (conservatively, since the reference interpreter doesn't retire them
/// yet) F/D are left unset.
fn isa_bits(_rv32: bool) -> u64 {
    let mut bits = 0u64;
    for letter in ['I', 'M', 'A', 'C', 'S', 'U'] {
        bits |= 1 << (letter as u8 - b'A');
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvvm_intc::{LocalInterruptor, WallClock};
    use rvvm_mem::{PhysicalMap, Region};

    fn test_hart() -> Hart {
        let map = Arc::new(PhysicalMap::new());
        map.attach(Region::ram(0, 0x10000)).unwrap();
        let interruptor = Arc::new(LocalInterruptor::new(Arc::new(WallClock::new())));
        Hart::new(0, false, 0x1000, 0x2000, map, interruptor)
    }

    #[test]
    fn bare_mode_translation_is_identity() {
        let hart = test_hart();
        assert_eq!(hart.translate(0x4242, AccessKind::Read).unwrap(), 0x4242);
    }

    #[test]
    fn reset_restores_boot_register_convention() {
        let mut hart = test_hart();
        hart.int_regs.write(5, 0xFFFF);
        hart.pc = 0x9999;
        hart.reset();
        assert_eq!(hart.int_regs.read(5), 0);
        assert_eq!(hart.pc, 0x1000);
        assert_eq!(hart.int_regs.read(11), 0x2000);
    }

    #[test]
    fn machine_mode_trap_sets_mcause_and_jumps_to_mtvec() {
        let mut hart = test_hart();
        hart.csrs.write(csr::MTVEC, 0x8000_0000);
        hart.enter_trap(Trap::Exception(Exception::IllegalInstruction), 0x1004);
        assert_eq!(hart.pc, 0x8000_0000);
        assert_eq!(hart.csrs.read(csr::MEPC), 0x1004);
        assert_eq!(hart.csrs.read(csr::MCAUSE), Exception::IllegalInstruction.cause());
    }

    #[test]
    fn mret_restores_previous_privilege_and_pc() {
        let mut hart = test_hart();
        hart.csrs.write(csr::MTVEC, 0x8000_0000);
        hart.privilege = Privilege::User;
        hart.enter_trap(Trap::Exception(Exception::EnvCallFromU), 0x1000);
        hart.trap_return(Privilege::Machine);
        assert_eq!(hart.pc, 0x1000);
        assert_eq!(hart.privilege, Privilege::User);
    }

    /// Installs a single Sv39 gigapage leaf at the root table covering VA
    /// `0..1GiB`, identity-mapped to PA `0..1GiB`, readable/writable/
    /// executable, with the U bit set according to `user`.
    fn install_sv39_identity_root(hart: &mut Hart, user: bool) {
        const ROOT_BASE: u64 = 0x3000;
        let leaf = 0x1 | 0x2 | 0x4 | 0x8 | if user { 0x10 } else { 0 };
        mmio::write(&hart.map, ROOT_BASE, 8, leaf).unwrap();
        let satp = (SATP_MODE_SV39 << 60) | (ROOT_BASE >> 12);
        hart.csrs.write(csr::SATP, satp);
    }

    #[test]
    fn supervisor_may_read_its_own_page_without_sum() {
        let mut hart = test_hart();
        install_sv39_identity_root(&mut hart, false);
        hart.privilege = Privilege::Supervisor;
        assert_eq!(hart.translate(0x4000, AccessKind::Read).unwrap(), 0x4000);
    }

    #[test]
    fn user_mode_faults_on_supervisor_only_page() {
        let mut hart = test_hart();
        install_sv39_identity_root(&mut hart, false);
        hart.privilege = Privilege::User;
        assert!(hart.translate(0x4000, AccessKind::Read).is_err());
    }

    #[test]
    fn supervisor_faults_on_user_page_without_sum() {
        let mut hart = test_hart();
        install_sv39_identity_root(&mut hart, true);
        hart.privilege = Privilege::Supervisor;
        assert!(hart.translate(0x4000, AccessKind::Read).is_err());
    }

    #[test]
    fn supervisor_reads_user_page_with_sum_but_not_fetches() {
        let mut hart = test_hart();
        install_sv39_identity_root(&mut hart, true);
        hart.privilege = Privilege::Supervisor;
        hart.csrs.write_bits(csr::MSTATUS, csr::MSTATUS_SUM, 1);
        assert_eq!(hart.translate(0x4000, AccessKind::Read).unwrap(), 0x4000);
        assert!(hart.translate(0x4000, AccessKind::Execute).is_err());
    }

    #[test]
    fn control_pause_reports_previous_running_state() {
        let hart = test_hart();
        hart.control.running.store(true, Ordering::Release);
        hart.control.pause_requested.store(false, Ordering::Release);
        assert!(hart.control.pending_external.load(Ordering::Relaxed) == 0);
    }
}
