//! Reference interpreter: decodes and retires RV32/64 I, M, A, and Zicsr
//! instructions plus the system instructions (`ecall`, `ebreak`, `mret`,
//! `sret`, `wfi`, `fence*`). Compressed (C) and floating-point (F/D)
//! instructions are not decoded — the tracing JIT that normally retires the
//! full ISA is an external collaborator; this backend exists so the hart
//! loop has something to run standalone and so tests can drive real guest
//! code without one.

use crate::csr::{self};
use crate::exec::{ExecutionBackend, StepOutcome};
use crate::hart::Hart;
use crate::trap::{Exception, Privilege, Trap};

#[derive(Default)]
pub struct Interpreter;

fn sign_extend(value: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    ((value << shift) as i64 >> shift) as u64
}

struct Decoded {
    raw: u32,
    opcode: u32,
    rd: u8,
    rs1: u8,
    rs2: u8,
    funct3: u32,
    funct7: u32,
}

fn decode(raw: u32) -> Decoded {
    Decoded {
        raw,
        opcode: raw & 0x7F,
        rd: ((raw >> 7) & 0x1F) as u8,
        rs1: ((raw >> 15) & 0x1F) as u8,
        rs2: ((raw >> 20) & 0x1F) as u8,
        funct3: (raw >> 12) & 0x7,
        funct7: (raw >> 25) & 0x7F,
    }
}

impl Decoded {
    fn imm_i(&self) -> u64 {
        sign_extend((self.raw >> 20) as u64, 12)
    }

    fn imm_s(&self) -> u64 {
        let imm = ((self.raw >> 25) << 5) | ((self.raw >> 7) & 0x1F);
        sign_extend(imm as u64, 12)
    }

    fn imm_b(&self) -> u64 {
        let imm = ((self.raw >> 31) << 12)
            | (((self.raw >> 7) & 1) << 11)
            | (((self.raw >> 25) & 0x3F) << 5)
            | (((self.raw >> 8) & 0xF) << 1);
        sign_extend(imm as u64, 13)
    }

    fn imm_u(&self) -> u64 {
        (self.raw & 0xFFFF_F000) as i32 as i64 as u64
    }

    fn imm_j(&self) -> u64 {
        let imm = ((self.raw >> 31) << 20)
            | (((self.raw >> 12) & 0xFF) << 12)
            | (((self.raw >> 20) & 1) << 11)
            | (((self.raw >> 21) & 0x3FF) << 1);
        sign_extend(imm as u64, 21)
    }

    fn csr_addr(&self) -> csr::CsrAddress {
        ((self.raw >> 20) & 0xFFF) as csr::CsrAddress
    }
}

impl ExecutionBackend for Interpreter {
    fn step(&mut self, hart: &mut Hart) -> Result<StepOutcome, Trap> {
        let pc = hart.pc;
        let raw = hart.fetch(pc)?;
        if raw & 0x3 != 0x3 {
            // A compressed instruction; the reference interpreter only
            // retires the 32-bit encoding space.
            return Err(Trap::Exception(Exception::IllegalInstruction));
        }
        let insn = decode(raw);
        let outcome = execute(hart, &insn, pc)?;
        hart.count(mnemonic_hint(&insn));
        Ok(outcome)
    }
}

fn execute(hart: &mut Hart, insn: &Decoded, pc: u64) -> Result<StepOutcome, Trap> {
    let mut next_pc = pc.wrapping_add(4);
    let mut boundary = false;

    match insn.opcode {
        // LUI
        0x37 => hart.int_regs.write(insn.rd, insn.imm_u()),
        // AUIPC
        0x17 => hart.int_regs.write(insn.rd, pc.wrapping_add(insn.imm_u())),
        // JAL
        0x6F => {
            hart.int_regs.write(insn.rd, next_pc);
            next_pc = pc.wrapping_add(insn.imm_j());
            boundary = true;
        }
        // JALR
        0x67 => {
            let target = hart.int_regs.read(insn.rs1).wrapping_add(insn.imm_i()) & !1;
            hart.int_regs.write(insn.rd, next_pc);
            next_pc = target;
            boundary = true;
        }
        // Branches
        0x63 => {
            let a = hart.int_regs.read(insn.rs1);
            let b = hart.int_regs.read(insn.rs2);
            let taken = match insn.funct3 {
                0x0 => a == b,
                0x1 => a != b,
                0x4 => (a as i64) < (b as i64),
                0x5 => (a as i64) >= (b as i64),
                0x6 => a < b,
                0x7 => a >= b,
                _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
            };
            if taken {
                next_pc = pc.wrapping_add(insn.imm_b());
                boundary = true;
            }
        }
        // Loads
        0x03 => {
            let addr = hart.int_regs.read(insn.rs1).wrapping_add(insn.imm_i());
            let (width, signed) = match insn.funct3 {
                0x0 => (1, true),
                0x1 => (2, true),
                0x2 => (4, true),
                0x3 => (8, false),
                0x4 => (1, false),
                0x5 => (2, false),
                0x6 => (4, false),
                _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
            };
            let raw = hart.read_mem(addr, width)?;
            let value = if signed { sign_extend(raw, width as u32 * 8) } else { raw };
            hart.int_regs.write(insn.rd, value);
        }
        // Stores
        0x23 => {
            let addr = hart.int_regs.read(insn.rs1).wrapping_add(insn.imm_s());
            let value = hart.int_regs.read(insn.rs2);
            let width = match insn.funct3 {
                0x0 => 1,
                0x1 => 2,
                0x2 => 4,
                0x3 => 8,
                _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
            };
            hart.write_mem(addr, width, value)?;
        }
        // OP-IMM (32/64-bit immediate ALU)
        0x13 => op_imm(hart, insn, false)?,
        0x1B => op_imm(hart, insn, true)?,
        // OP (register-register, covers RV32M when funct7 == 1)
        0x33 => op_reg(hart, insn, false)?,
        0x3B => op_reg(hart, insn, true)?,
        // FENCE / FENCE.I: the reference interpreter has no reordering or
        // instruction cache to flush, so both retire as no-ops.
        0x0F => {}
        // AMO (A extension)
        0x2F => amo(hart, insn)?,
        // SYSTEM: ECALL/EBREAK/MRET/SRET/WFI/CSR*
        0x73 => {
            let (outcome, jumped) = system(hart, insn, pc)?;
            if let Some(new_pc) = jumped {
                next_pc = new_pc;
                boundary = true;
            }
            if outcome == StepOutcome::BlockBoundary {
                boundary = true;
            }
        }
        _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
    }

    hart.pc = next_pc;
    Ok(if boundary { StepOutcome::BlockBoundary } else { StepOutcome::Retired })
}

fn op_imm(hart: &mut Hart, insn: &Decoded, word: bool) -> Result<(), Trap> {
    let rs1 = hart.int_regs.read(insn.rs1);
    let rs1 = if word { rs1 as u32 as u64 } else { rs1 };
    let imm = insn.imm_i();
    let shamt = (insn.raw >> 20) & if word { 0x1F } else { 0x3F };
    let result = match insn.funct3 {
        0x0 => rs1.wrapping_add(imm),
        0x1 => rs1 << shamt,
        0x2 => (((rs1 as i64) < (imm as i64)) as u64),
        0x3 => ((rs1 < imm) as u64),
        0x4 => rs1 ^ imm,
        0x5 if insn.funct7 & 0x20 != 0 => {
            if word {
                ((rs1 as i32) >> shamt) as i64 as u64
            } else {
                ((rs1 as i64) >> shamt) as u64
            }
        }
        0x5 => rs1 >> shamt,
        0x6 => rs1 | imm,
        0x7 => rs1 & imm,
        _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
    };
    let result = if word { sign_extend(result & 0xFFFF_FFFF, 32) } else { result };
    hart.int_regs.write(insn.rd, result);
    Ok(())
}

fn op_reg(hart: &mut Hart, insn: &Decoded, word: bool) -> Result<(), Trap> {
    if insn.funct7 == 0x01 {
        return mul_div(hart, insn, word);
    }
    let a = hart.int_regs.read(insn.rs1);
    let b = hart.int_regs.read(insn.rs2);
    let (a, b) = if word { (a as u32 as u64, b as u32 as u64) } else { (a, b) };
    let shamt = (b & if word { 0x1F } else { 0x3F }) as u32;
    let result = match (insn.funct3, insn.funct7) {
        (0x0, 0x00) => a.wrapping_add(b),
        (0x0, 0x20) => a.wrapping_sub(b),
        (0x1, _) => a << shamt,
        (0x2, _) => ((a as i64) < (b as i64)) as u64,
        (0x3, _) => (a < b) as u64,
        (0x4, _) => a ^ b,
        (0x5, 0x00) => a >> shamt,
        (0x5, 0x20) => {
            if word {
                ((a as i32) >> shamt) as i64 as u64
            } else {
                ((a as i64) >> shamt) as u64
            }
        }
        (0x6, _) => a | b,
        (0x7, _) => a & b,
        _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
    };
    let result = if word { sign_extend(result & 0xFFFF_FFFF, 32) } else { result };
    hart.int_regs.write(insn.rd, result);
    Ok(())
}

fn mul_div(hart: &mut Hart, insn: &Decoded, word: bool) -> Result<(), Trap> {
    let a = hart.int_regs.read(insn.rs1);
    let b = hart.int_regs.read(insn.rs2);
    let result = if word {
        let (a, b) = (a as i32, b as i32);
        match insn.funct3 {
            0x0 => a.wrapping_mul(b) as i64 as u64,
            0x4 => {
                if b == 0 {
                    u64::MAX
                } else if a == i32::MIN && b == -1 {
                    a as i64 as u64
                } else {
                    (a.wrapping_div(b)) as i64 as u64
                }
            }
            0x5 => {
                if b == 0 {
                    a as i64 as u64
                } else {
                    ((a as u32).wrapping_div(b as u32)) as i32 as i64 as u64
                }
            }
            0x6 => {
                if b == 0 {
                    a as i64 as u64
                } else if a == i32::MIN && b == -1 {
                    0
                } else {
                    a.wrapping_rem(b) as i64 as u64
                }
            }
            0x7 => {
                if b == 0 {
                    a as i64 as u64
                } else {
                    ((a as u32).wrapping_rem(b as u32)) as i32 as i64 as u64
                }
            }
            _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
        }
    } else {
        let (ai, bi) = (a as i64, b as i64);
        match insn.funct3 {
            0x0 => ai.wrapping_mul(bi) as u64,
            0x1 => ((ai as i128).wrapping_mul(bi as i128) >> 64) as u64,
            0x2 => ((ai as i128).wrapping_mul(b as u128 as i128) >> 64) as u64,
            0x3 => (((a as u128).wrapping_mul(b as u128)) >> 64) as u64,
            0x4 => {
                if bi == 0 {
                    u64::MAX
                } else if ai == i64::MIN && bi == -1 {
                    ai as u64
                } else {
                    ai.wrapping_div(bi) as u64
                }
            }
            0x5 => {
                if b == 0 {
                    u64::MAX
                } else {
                    a.wrapping_div(b)
                }
            }
            0x6 => {
                if bi == 0 {
                    ai as u64
                } else if ai == i64::MIN && bi == -1 {
                    0
                } else {
                    ai.wrapping_rem(bi) as u64
                }
            }
            0x7 => {
                if b == 0 {
                    a
                } else {
                    a.wrapping_rem(b)
                }
            }
            _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
        }
    };
    hart.int_regs.write(insn.rd, result);
    Ok(())
}

/// Atomic memory operations: LR/SC use the hart's single-address reservation;
/// the AMO family (swap/add/and/or/xor/min/max) read-modify-write under the
/// same reservation discipline so a concurrent SC elsewhere is invalidated.
fn amo(hart: &mut Hart, insn: &Decoded) -> Result<(), Trap> {
    let width: u8 = if insn.funct3 == 0x2 { 4 } else { 8 };
    let addr = hart.int_regs.read(insn.rs1);
    let funct5 = insn.funct7 >> 2;

    match funct5 {
        0x02 => {
            // LR
            let value = hart.read_mem(addr, width)?;
            hart.reservation = Some(addr);
            let value = if width == 4 { sign_extend(value, 32) } else { value };
            hart.int_regs.write(insn.rd, value);
        }
        0x03 => {
            // SC
            if hart.reservation == Some(addr) {
                let value = hart.int_regs.read(insn.rs2);
                hart.write_mem(addr, width, value)?;
                hart.int_regs.write(insn.rd, 0);
                hart.reservation = None;
            } else {
                hart.int_regs.write(insn.rd, 1);
            }
        }
        op => {
            let current = hart.read_mem(addr, width)?;
            let current = if width == 4 { sign_extend(current, 32) } else { current };
            let operand = hart.int_regs.read(insn.rs2);
            let result = match op {
                0x01 => operand,
                0x00 => current.wrapping_add(operand),
                0x04 => current ^ operand,
                0x0C => current & operand,
                0x08 => current | operand,
                0x10 => (current as i64).min(operand as i64) as u64,
                0x14 => (current as i64).max(operand as i64) as u64,
                0x18 => current.min(operand),
                0x1C => current.max(operand),
                _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
            };
            let stored = if width == 4 { result & 0xFFFF_FFFF } else { result };
            hart.write_mem(addr, width, stored)?;
            hart.reservation = None;
            hart.int_regs.write(insn.rd, current);
        }
    }
    Ok(())
}

fn system(hart: &mut Hart, insn: &Decoded, pc: u64) -> Result<(StepOutcome, Option<u64>), Trap> {
    if insn.funct3 == 0 {
        return match insn.raw >> 20 {
            0x000 => {
                let cause = match hart.privilege {
                    Privilege::User => Exception::EnvCallFromU,
                    Privilege::Supervisor => Exception::EnvCallFromS,
                    Privilege::Machine => Exception::EnvCallFromM,
                };
                Err(Trap::Exception(cause))
            }
            0x001 => Err(Trap::Exception(Exception::Breakpoint)),
            0x102 => {
                hart.trap_return(Privilege::Supervisor);
                Ok((StepOutcome::BlockBoundary, Some(hart.pc)))
            }
            0x302 => {
                hart.trap_return(Privilege::Machine);
                Ok((StepOutcome::BlockBoundary, Some(hart.pc)))
            }
            0x105 => {
                // WFI retires immediately; it's the hart loop's own sleep
                // path (driven by `wfi_armed`/the WFI condvar) that
                // actually blocks the worker on the next iteration.
                hart.wfi_armed = true;
                Ok((StepOutcome::BlockBoundary, Some(pc.wrapping_add(4))))
            }
            _ if insn.raw >> 25 == 0x09 => {
                // SFENCE.VMA rs1, rs2: rs1 == x0 flushes every mapping;
                // otherwise only the page containing rs1's value is
                // invalidated (rs2, the ASID operand, is ignored since this
                // TLB tags by VPN only, not by address space).
                if insn.rs1 == 0 {
                    hart.tlb.flush_all();
                } else {
                    let va = hart.int_regs.read(insn.rs1);
                    hart.tlb.invalidate_va(va);
                }
                Ok((StepOutcome::Retired, None))
            }
            _ => Err(Trap::Exception(Exception::IllegalInstruction)),
        };
    }

    let addr = insn.csr_addr();
    let is_imm = insn.funct3 & 0x4 != 0;
    let source = if is_imm { insn.rs1 as u64 } else { hart.int_regs.read(insn.rs1) };
    let old = hart.csrs.read(addr);
    let new = match insn.funct3 & 0x3 {
        0x1 => source,
        0x2 => old | source,
        0x3 => old & !source,
        _ => return Err(Trap::Exception(Exception::IllegalInstruction)),
    };
    let write_back = insn.funct3 & 0x3 == 0x1 || insn.rs1 != 0;
    if write_back {
        hart.csrs.write(addr, new);
        // A SATP write retargets the guest's page tables; every cached
        // translation belongs to the address space that was active before
        // this write and must not outlive it.
        if addr == csr::SATP {
            hart.tlb.flush_all();
        }
    }
    hart.int_regs.write(insn.rd, old);
    Ok((StepOutcome::Retired, None))
}

fn mnemonic_hint(insn: &Decoded) -> &'static str {
    match insn.opcode {
        0x37 => "lui",
        0x17 => "auipc",
        0x6F => "jal",
        0x67 => "jalr",
        0x63 => "branch",
        0x03 => "load",
        0x23 => "store",
        0x13 | 0x1B => "op-imm",
        0x33 | 0x3B => "op",
        0x0F => "fence",
        0x2F => "amo",
        0x73 => "system",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::Hart;
    use crate::tlb::AccessKind;
    use rvvm_intc::{LocalInterruptor, WallClock};
    use rvvm_mem::{PhysicalMap, Region};
    use std::sync::Arc;

    fn test_hart() -> Hart {
        let map = Arc::new(PhysicalMap::new());
        map.attach(Region::ram(0, 0x1_0000)).unwrap();
        let interruptor = Arc::new(LocalInterruptor::new(Arc::new(WallClock::new())));
        Hart::new(0, false, 0, 0, map, interruptor)
    }

    fn store_word(hart: &Hart, addr: u64, word: u32) {
        hart.write_mem(addr, 4, word as u64).unwrap();
    }

    #[test]
    fn addi_adds_sign_extended_immediate() {
        let mut hart = test_hart();
        // addi x1, x0, 5
        store_word(&hart, 0, 0x00500093);
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.int_regs.read(1), 5);
        assert_eq!(hart.pc, 4);
    }

    #[test]
    fn jal_sets_link_register_and_jumps() {
        let mut hart = test_hart();
        // jal x1, +8
        store_word(&hart, 0, 0x008000EF);
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.int_regs.read(1), 4);
        assert_eq!(hart.pc, 8);
    }

    #[test]
    fn load_store_round_trip() {
        let mut hart = test_hart();
        // addi x1, x0, 0x2a ; sw x1, 0x100(x0) ; lw x2, 0x100(x0)
        store_word(&hart, 0, 0x02a00093);
        store_word(&hart, 4, 0x10102023);
        store_word(&hart, 8, 0x10002103);
        Interpreter.step(&mut hart).unwrap();
        Interpreter.step(&mut hart).unwrap();
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.int_regs.read(2), 0x2a);
    }

    #[test]
    fn ecall_from_machine_mode_traps() {
        let mut hart = test_hart();
        // ecall
        store_word(&hart, 0, 0x00000073);
        let err = Interpreter.step(&mut hart).unwrap_err();
        assert_eq!(err, Trap::Exception(Exception::EnvCallFromM));
    }

    #[test]
    fn lr_sc_pair_succeeds_when_uninterrupted() {
        let mut hart = test_hart();
        // lr.w x2, (x1) at pc 0 with x1 = 0x200; then sc.w x3, x4, (x1)
        hart.int_regs.write(1, 0x200);
        // lr.w rd=2 rs1=1: funct5=00010, aq=0,rl=0 -> opcode 0101111
        let lr = (0b00010 << 27) | (1 << 15) | (0x2 << 12) | (2 << 7) | 0x2F;
        store_word(&hart, 0, lr);
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.reservation, Some(0x200));
        hart.int_regs.write(4, 0x99);
        // sc.w rd=3 rs1=1 rs2=4: funct5=00011
        let sc = (0b00011 << 27) | (4 << 20) | (1 << 15) | (0x2 << 12) | (3 << 7) | 0x2F;
        store_word(&hart, 4, sc);
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.int_regs.read(3), 0);
        assert_eq!(hart.read_mem(0x200, 4).unwrap(), 0x99);
    }

    #[test]
    fn csrrw_swaps_register_and_csr() {
        let mut hart = test_hart();
        hart.int_regs.write(1, 0x42);
        hart.csrs.write(csr::MSCRATCH, 0x10);
        // csrrw rd=2 rs1=1 csr=mscratch: funct3=1
        let insn = (u32::from(csr::MSCRATCH) << 20) | (1 << 15) | (0x1 << 12) | (2 << 7) | 0x73;
        store_word(&hart, 0, insn);
        Interpreter.step(&mut hart).unwrap();
        assert_eq!(hart.int_regs.read(2), 0x10);
        assert_eq!(hart.csrs.read(csr::MSCRATCH), 0x42);
    }

    #[test]
    fn sfence_vma_flushes_the_tlb() {
        let mut hart = test_hart();
        hart.tlb.insert(0x4000, AccessKind::Read, 0);
        assert!(hart.tlb.lookup(0x4000, AccessKind::Read).is_some());
        // sfence.vma x0, x0: funct7=0x09, rs1=0, rs2=0
        let insn = (0x09 << 25) | 0x73;
        store_word(&hart, 0, insn);
        Interpreter.step(&mut hart).unwrap();
        assert!(hart.tlb.lookup(0x4000, AccessKind::Read).is_none());
    }

    #[test]
    fn satp_write_flushes_the_tlb() {
        let mut hart = test_hart();
        hart.tlb.insert(0x4000, AccessKind::Read, 0);
        // csrrw x0, x1, satp: funct3=1, rd=0
        let insn = (u32::from(csr::SATP) << 20) | (1 << 15) | (0x1 << 12) | 0x73;
        store_word(&hart, 0, insn);
        Interpreter.step(&mut hart).unwrap();
        assert!(hart.tlb.lookup(0x4000, AccessKind::Read).is_none());
    }
}
