//! Trap causes and the priority/delegation rules for dispatching them.
//!
//! Cause encodings follow the public RISC-V privileged architecture: bit 63
//! set marks an interrupt, clear marks an exception, and the low bits are
//! the standard cause number.

use crate::csr::{self, CsrFile};

const CAUSE_INTERRUPT_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvCallFromU,
    EnvCallFromS,
    EnvCallFromM,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
}

impl Exception {
    pub fn cause(self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EnvCallFromU => 8,
            Exception::EnvCallFromS => 9,
            Exception::EnvCallFromM => 11,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

impl Interrupt {
    pub fn cause(self) -> u64 {
        let bit = match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        };
        bit | CAUSE_INTERRUPT_FLAG
    }

    pub fn pending_bit(self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => csr::SSIP_BIT,
            Interrupt::MachineSoftware => csr::MSIP_BIT,
            Interrupt::SupervisorTimer => csr::STIP_BIT,
            Interrupt::MachineTimer => csr::MTIP_BIT,
            Interrupt::SupervisorExternal => csr::SEIP_BIT,
            Interrupt::MachineExternal => csr::MEIP_BIT,
        }
    }

    /// Highest-to-lowest priority order the privileged spec mandates when
    /// more than one interrupt is pending and enabled simultaneously.
    const PRIORITY: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Trap {
    pub fn cause(self) -> u64 {
        match self {
            Trap::Exception(e) => e.cause(),
            Trap::Interrupt(i) => i.cause(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Supervisor,
    Machine,
}

impl Privilege {
    pub fn encode(self) -> u64 {
        match self {
            Privilege::User => 0,
            Privilege::Supervisor => 1,
            Privilege::Machine => 3,
        }
    }

    pub fn from_mpp(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Privilege::User,
            1 => Privilege::Supervisor,
            _ => Privilege::Machine,
        }
    }
}

/// Find the highest-priority pending-and-enabled interrupt, honoring the
/// current privilege mode's global enable and supervisor/machine
/// delegation, as `mideleg` selects.
pub fn pending_interrupt(csrs: &CsrFile, privilege: Privilege) -> Option<Interrupt> {
    let pending = csrs.pending() & csrs.read(csr::MIE);
    if pending == 0 {
        return None;
    }
    let mstatus = csrs.read(csr::MSTATUS);
    let mie = (mstatus >> 3) & 1 == 1;
    let sie = (mstatus >> 1) & 1 == 1;
    let mideleg = csrs.read(csr::MIDELEG);

    for interrupt in Interrupt::PRIORITY {
        let bit = interrupt.pending_bit();
        if pending & bit == 0 {
            continue;
        }
        let delegated = mideleg & bit != 0;
        let taken = if delegated {
            match privilege {
                Privilege::Supervisor => sie,
                Privilege::User => true,
                Privilege::Machine => false,
            }
        } else {
            match privilege {
                Privilege::Machine => mie,
                Privilege::Supervisor | Privilege::User => true,
            }
        };
        if taken {
            return Some(interrupt);
        }
    }
    None
}

/// Whether an exception with the given cause is delegated to supervisor
/// mode by `medeleg`.
pub fn exception_delegated(csrs: &CsrFile, exception: Exception) -> bool {
    csrs.read(csr::MEDELEG) & (1 << exception.cause()) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_cause_sets_high_bit() {
        assert_eq!(Interrupt::MachineTimer.cause() & (1 << 63), 1 << 63);
    }

    #[test]
    fn no_interrupt_pending_returns_none() {
        let csrs = CsrFile::new(0, 0);
        assert_eq!(pending_interrupt(&csrs, Privilege::Machine), None);
    }

    #[test]
    fn machine_timer_interrupt_taken_when_mie_set() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.set_pending(csr::MTIP_BIT);
        csrs.write(csr::MIE, csr::MTIP_BIT);
        csrs.write(csr::MSTATUS, 1 << 3);
        assert_eq!(pending_interrupt(&csrs, Privilege::Machine), Some(Interrupt::MachineTimer));
    }

    #[test]
    fn machine_mode_ignores_delegated_interrupts() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.write(csr::MIDELEG, csr::STIP_BIT);
        csrs.set_pending(csr::STIP_BIT);
        csrs.write(csr::MIE, csr::STIP_BIT);
        assert_eq!(pending_interrupt(&csrs, Privilege::Machine), None);
    }

    #[test]
    fn supervisor_mode_takes_delegated_interrupt_when_sie_set() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.write(csr::MIDELEG, csr::STIP_BIT);
        csrs.set_pending(csr::STIP_BIT);
        csrs.write(csr::MIE, csr::STIP_BIT);
        csrs.write(csr::MSTATUS, 1 << 1);
        assert_eq!(pending_interrupt(&csrs, Privilege::Supervisor), Some(Interrupt::SupervisorTimer));
    }
}
