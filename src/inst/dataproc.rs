//! Data-processing instructions and the barrel shifter
//!
//! All sixteen opcodes share one executor. The scratch flags are computed
//! unconditionally; [`Cpu::commit_flags`] moves them into the CPSR only when
//! the S bit is set. The compare opcodes with S clear are not compares at
//! all but the ARMv6 wide-move encodings, handled separately.

use super::field;
use crate::cpu::{Cpu, Exception};
use log::{trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// The 4-bit opcode field of a data-processing word
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
enum Opcode {
    And = 0,
    Eor = 1,
    Sub = 2,
    Rsb = 3,
    Add = 4,
    Adc = 5,
    Sbc = 6,
    Rsc = 7,
    Tst = 8,
    Teq = 9,
    Cmp = 10,
    Cmn = 11,
    Orr = 12,
    Mov = 13,
    Bic = 14,
    Mvn = 15,
}

/// Shift types of a register operand-2
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
enum Shift {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

/// Computes operand 2 from the low 12 bits of a word, updating the scratch
/// carry the way the barrel shifter would
///
/// For the immediate form the 8-bit value is rotated right by twice the
/// 4-bit rotate field and the carry is left alone. For the register form the
/// special cases are:
/// - an encoded immediate amount of 0 means 32 for LSR/ASR/ROR;
/// - LSL #0 passes the value through with the carry untouched;
/// - ROR by 32 is RRX: rotate through the committed CPSR carry;
/// - amounts above 32 (only reachable via register-specified shifts) zero
///   or sign-fill the value, with ROR reduced modulo 32;
/// - a register-specified amount of 0 leaves value and carry untouched.
pub(crate) fn operand2(cpu: &mut Cpu, immediate: bool, bits: u32) -> u32 {
    if immediate {
        let value = field(bits, 0, 8);
        let rotate = field(bits, 8, 4);
        return value.rotate_right(2 * rotate);
    }

    let value = cpu.reg(field(bits, 0, 4) as usize);
    let shift = Shift::from_u32(field(bits, 5, 2)).expect("a 2-bit field covers every shift");

    let amount = if bits & (1 << 4) != 0 {
        // Shift amount from the low byte of a register.
        let amount = cpu.reg(field(bits, 8, 4) as usize) & 0xff;
        if amount == 0 {
            return value;
        }
        amount
    } else {
        let amount = field(bits, 7, 5);
        if amount == 0 && shift != Shift::Lsl {
            32
        } else {
            amount
        }
    };

    match shift {
        Shift::Lsl => {
            if amount == 0 {
                value
            } else if amount < 32 {
                cpu.flags.c = value >> (32 - amount) & 1 != 0;
                value << amount
            } else {
                cpu.flags.c = amount == 32 && value & 1 != 0;
                0
            }
        }
        Shift::Lsr => {
            if amount < 32 {
                cpu.flags.c = value >> (amount - 1) & 1 != 0;
                value >> amount
            } else {
                cpu.flags.c = amount == 32 && value >> 31 != 0;
                0
            }
        }
        Shift::Asr => {
            if amount >= 32 {
                let sign = value >> 31 != 0;
                cpu.flags.c = sign;
                if sign {
                    0xffff_ffff
                } else {
                    0
                }
            } else {
                cpu.flags.c = value >> (amount - 1) & 1 != 0;
                ((value as i32) >> amount) as u32
            }
        }
        Shift::Ror => {
            let amount = if amount > 32 {
                ((amount - 1) & 31) + 1
            } else {
                amount
            };
            if amount == 32 {
                // RRX: rotate right through the committed carry.
                let old_c = cpu.cpsr().c();
                cpu.flags.c = value & 1 != 0;
                (value >> 1) | ((old_c as u32) << 31)
            } else {
                cpu.flags.c = value >> (amount - 1) & 1 != 0;
                value.rotate_right(amount)
            }
        }
    }
}

pub(crate) fn data_processing(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let immediate = word & (1 << 25) != 0;
    let opcode = Opcode::from_u32(field(word, 21, 4)).expect("a 4-bit field covers every opcode");
    let set_flags = word & (1 << 20) != 0;
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let bits = field(word, 0, 12);

    // The compare row with S clear is the wide-move space, not a compare.
    if !set_flags && matches!(opcode, Opcode::Tst | Opcode::Teq | Opcode::Cmp | Opcode::Cmn) {
        return wide_move(cpu, opcode, immediate, rn, rd, bits);
    }

    let op1 = cpu.reg(rn);
    let op2 = operand2(cpu, immediate, bits);

    let mut write = true;
    let result = match opcode {
        Opcode::Mov => op2,
        Opcode::Mvn => !op2,
        Opcode::And => op1 & op2,
        Opcode::Tst => {
            write = false;
            op1 & op2
        }
        Opcode::Eor => op1 ^ op2,
        Opcode::Teq => {
            write = false;
            op1 ^ op2
        }
        Opcode::Orr => op1 | op2,
        Opcode::Bic => op1 & !op2,
        Opcode::Add
        | Opcode::Adc
        | Opcode::Cmn
        | Opcode::Sub
        | Opcode::Sbc
        | Opcode::Cmp
        | Opcode::Rsb
        | Opcode::Rsc => {
            write = !matches!(opcode, Opcode::Cmp | Opcode::Cmn);
            arithmetic(cpu, opcode, op1, op2)
        }
    };

    cpu.flags.n = result >> 31 != 0;
    cpu.flags.z = result == 0;

    trace!("{opcode:?} r{rd}, r{rn}, {op2:#x} -> {result:#010x}");

    if write {
        cpu.set_reg(rd, result);
    }
    if set_flags {
        cpu.commit_flags();
    }
    Ok(())
}

/// The add/subtract family, including carry and overflow bookkeeping
///
/// Subtracts negate operand 2 and go through the adder; reverse forms swap
/// the operands first. Carry out of an addition is the 33rd bit of the
/// unsigned sum; for subtraction the (inverted-borrow) rule is
/// `C = result <= op1`.
fn arithmetic(cpu: &mut Cpu, opcode: Opcode, op1: u32, op2: u32) -> u32 {
    let (op1, op2) = if matches!(opcode, Opcode::Rsb | Opcode::Rsc) {
        (op2, op1)
    } else {
        (op1, op2)
    };
    let carry_in = cpu.flags.c as u32;

    match opcode {
        Opcode::Add | Opcode::Adc | Opcode::Cmn => {
            let carry = if opcode == Opcode::Adc { carry_in } else { 0 };
            let wide = u64::from(op1) + u64::from(op2) + u64::from(carry);
            let result = wide as u32;
            cpu.flags.c = wide >> 32 != 0;
            cpu.flags.v = op1 >> 31 == op2 >> 31 && op1 >> 31 != result >> 31;
            result
        }
        Opcode::Sub | Opcode::Sbc | Opcode::Cmp | Opcode::Rsb | Opcode::Rsc => {
            let negated = op2.wrapping_neg();
            let mut result = op1.wrapping_add(negated);
            if matches!(opcode, Opcode::Sbc | Opcode::Rsc) {
                result = result.wrapping_add(carry_in).wrapping_sub(1);
            }
            cpu.flags.c = result <= op1;
            cpu.flags.v = op1 >> 31 == negated >> 31 && op1 >> 31 != result >> 31;
            result
        }
        _ => unreachable!("only the arithmetic opcodes reach here"),
    }
}

/// MOVW and MOVT, which borrow the compare opcodes with S clear
///
/// The 16-bit immediate is `rn:imm12`. The register-form encodings in this
/// space are the status-register transfers, which are privileged and stay
/// undefined here.
fn wide_move(
    cpu: &mut Cpu,
    opcode: Opcode,
    immediate: bool,
    rn: usize,
    rd: usize,
    bits: u32,
) -> Result<(), Exception> {
    if !immediate {
        warn!("status-register transfer encoding {opcode:?}; privileged modes are not modeled");
        return Err(Exception::Undefined);
    }
    let imm16 = ((rn as u32) << 12) | bits;
    match opcode {
        Opcode::Tst => {
            trace!("movw r{rd}, #{imm16:#x}");
            cpu.set_reg(rd, imm16);
            Ok(())
        }
        Opcode::Cmp => {
            trace!("movt r{rd}, #{imm16:#x}");
            let low = cpu.reg(rd) & 0xffff;
            cpu.set_reg(rd, low | (imm16 << 16));
            Ok(())
        }
        _ => {
            warn!("reserved data-processing encoding ({opcode:?} with S clear)");
            Err(Exception::Undefined)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpsr;

    fn cpu() -> Cpu {
        Cpu::new()
    }

    /// Builds the low 12 bits for `rm` shifted by an immediate amount
    fn shifted(rm: u32, shift: Shift, amount: u32) -> u32 {
        (amount << 7) | ((shift as u32) << 5) | rm
    }

    #[test]
    fn immediate_operand_rotates() {
        let mut cpu = cpu();
        // 0xff rotated right by 8 (rotate field 4)
        let value = operand2(&mut cpu, true, (4 << 8) | 0xff);
        assert_eq!(value, 0xff00_0000);
        // No rotation leaves the byte alone
        assert_eq!(operand2(&mut cpu, true, 0x5a), 0x5a);
    }

    #[test]
    fn lsl_zero_preserves_carry() {
        let mut cpu = cpu();
        cpu.set_cpsr(Cpsr::new().with_c(true));
        cpu.flags.c = true;
        let value = operand2(&mut cpu, false, shifted(0, Shift::Lsl, 0));
        assert_eq!(value, cpu.reg(0));
        assert!(cpu.flags.c);
    }

    #[test]
    fn lsl_pulls_carry_from_the_shifted_out_bit() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0x8000_0001);
        let value = operand2(&mut cpu, false, shifted(0, Shift::Lsl, 1));
        assert_eq!(value, 2);
        assert!(cpu.flags.c);
    }

    #[test]
    fn lsr_encoded_zero_means_32() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0x8000_0000);
        let value = operand2(&mut cpu, false, shifted(0, Shift::Lsr, 0));
        assert_eq!(value, 0);
        assert!(cpu.flags.c, "bit 31 is the last bit shifted out");
    }

    #[test]
    fn asr_encoded_zero_fills_with_the_sign() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0x8000_0000);
        let value = operand2(&mut cpu, false, shifted(0, Shift::Asr, 0));
        assert_eq!(value, 0xffff_ffff);
        assert!(cpu.flags.c);

        cpu.set_reg(1, 0x7fff_ffff);
        let value = operand2(&mut cpu, false, shifted(1, Shift::Asr, 0));
        assert_eq!(value, 0);
        assert!(!cpu.flags.c);
    }

    #[test]
    fn ror_encoded_zero_is_rrx() {
        let mut cpu = cpu();
        cpu.set_cpsr(Cpsr::new().with_c(true));
        cpu.set_reg(0, 0x0000_0002);
        let value = operand2(&mut cpu, false, shifted(0, Shift::Ror, 0));
        assert_eq!(value, 0x8000_0001);
        assert!(!cpu.flags.c, "new carry is the old low bit");
    }

    #[test]
    fn register_shift_amount_zero_is_a_no_op() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0xdead_beef);
        cpu.set_reg(1, 0); // amount register
        cpu.flags.c = true;
        // rm=0 shifted LSR by r1 (bit 4 set selects the register form)
        let bits = (1 << 8) | (1 << 4) | ((Shift::Lsr as u32) << 5);
        let value = operand2(&mut cpu, false, bits);
        assert_eq!(value, 0xdead_beef);
        assert!(cpu.flags.c);
    }

    #[test]
    fn register_shift_beyond_32_clears_everything() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0xffff_ffff);
        cpu.set_reg(1, 40);
        let bits = (1 << 8) | (1 << 4) | ((Shift::Lsr as u32) << 5);
        let value = operand2(&mut cpu, false, bits);
        assert_eq!(value, 0);
        assert!(!cpu.flags.c);
    }

    #[test]
    fn register_ror_reduces_modulo_32() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0x0000_00f0);
        cpu.set_reg(1, 36); // 36 mod 32 = 4
        let bits = (1 << 8) | (1 << 4) | ((Shift::Ror as u32) << 5);
        let value = operand2(&mut cpu, false, bits);
        assert_eq!(value, 0x0000_000f);
    }

    /// Executes one data-processing word directly
    fn exec(cpu: &mut Cpu, word: u32) {
        data_processing(cpu, word).unwrap();
    }

    #[test]
    fn add_carry_is_the_33rd_bit_of_the_unsigned_sum() {
        // A sign-difference formulation of carry disagrees with the real
        // thing for patterns like -1 + -1; pin the canonical 33-bit rule
        // over a spread of operands.
        let samples = [
            0u32,
            1,
            2,
            0x7fff_ffff,
            0x8000_0000,
            0x8000_0001,
            0xffff_fffe,
            0xffff_ffff,
            0x1234_5678,
            0xdead_beef,
        ];
        for &a in &samples {
            for &b in &samples {
                let mut cpu = cpu();
                cpu.set_reg(1, a);
                cpu.set_reg(2, b);
                // ADDS r0, r1, r2
                exec(&mut cpu, 0xe091_0002);
                let wide = u64::from(a) + u64::from(b);
                assert_eq!(cpu.reg(0), wide as u32);
                assert_eq!(cpu.cpsr().c(), wide >> 32 != 0, "carry for {a:#x}+{b:#x}");
                let signed = (a as i32).checked_add(b as i32).is_none();
                assert_eq!(cpu.cpsr().v(), signed, "overflow for {a:#x}+{b:#x}");
            }
        }
    }

    #[test]
    fn subs_with_borrow() {
        let mut cpu = cpu();
        cpu.set_reg(1, 0);
        cpu.set_reg(2, 1);
        // SUBS r0, r1, r2
        exec(&mut cpu, 0xe051_0002);
        assert_eq!(cpu.reg(0), 0xffff_ffff);
        assert!(cpu.cpsr().n());
        assert!(!cpu.cpsr().z());
        assert!(!cpu.cpsr().c(), "borrow clears C");
        assert!(!cpu.cpsr().v());
    }

    #[test]
    fn adc_and_sbc_chain_the_carry() {
        // The scratch carry is what executors consume; the loop snapshots it
        // from the CPSR before each instruction.
        {
            let mut cpu = cpu();
            cpu.flags.c = true;
            cpu.set_reg(1, 5);
            cpu.set_reg(2, 7);
            // ADCS r0, r1, r2
            exec(&mut cpu, 0xe0b1_0002);
            assert_eq!(cpu.reg(0), 13);
        }

        let mut cpu = cpu();
        cpu.flags.c = false;
        cpu.set_reg(1, 10);
        cpu.set_reg(2, 3);
        // SBCS r0, r1, r2 with C clear: 10 - 3 - 1
        exec(&mut cpu, 0xe0d1_0002);
        assert_eq!(cpu.reg(0), 6);
        assert!(cpu.cpsr().c());
    }

    #[test]
    fn rsb_swaps_the_operands() {
        let mut cpu = cpu();
        cpu.set_reg(1, 3);
        cpu.set_reg(2, 10);
        // RSBS r0, r1, r2 => r2 - r1
        exec(&mut cpu, 0xe071_0002);
        assert_eq!(cpu.reg(0), 7);
        assert!(cpu.cpsr().c());
    }

    #[test]
    fn compares_do_not_write_the_destination() {
        let mut cpu = cpu();
        cpu.set_reg(0, 0x1111);
        cpu.set_reg(1, 42);
        cpu.set_reg(2, 42);
        // CMP r1, r2
        exec(&mut cpu, 0xe151_0002);
        assert_eq!(cpu.reg(0), 0x1111);
        assert!(cpu.cpsr().z());
        assert!(cpu.cpsr().c());
    }

    #[test]
    fn s_clear_leaves_the_cpsr_alone() {
        let mut cpu = cpu();
        let before = cpu.cpsr();
        cpu.set_reg(1, 0x8000_0000);
        cpu.set_reg(2, 0x8000_0000);
        // ADD r0, r1, r2 (no S)
        exec(&mut cpu, 0xe081_0002);
        assert_eq!(cpu.cpsr(), before);
    }

    #[test]
    fn movw_and_movt_build_a_constant() {
        let mut cpu = cpu();
        // MOVW r0, #0x1234
        exec(&mut cpu, 0xe301_0234);
        assert_eq!(cpu.reg(0), 0x1234);
        // MOVT r0, #0x5678
        exec(&mut cpu, 0xe345_0678);
        assert_eq!(cpu.reg(0), 0x5678_1234);
    }

    #[test]
    fn reserved_wide_move_encodings_are_undefined() {
        let mut cpu = cpu();
        // TEQ with S clear, immediate form (MSR space)
        assert_eq!(
            data_processing(&mut cpu, 0xe321_0000),
            Err(Exception::Undefined)
        );
    }

    #[test]
    fn mvn_and_bic_mask_bits() {
        let mut cpu = cpu();
        cpu.set_reg(1, 0xffff_ffff);
        // MVN r0, #0
        exec(&mut cpu, 0xe3e0_0000);
        assert_eq!(cpu.reg(0), 0xffff_ffff);
        // BIC r0, r1, #0xff
        exec(&mut cpu, 0xe3c1_00ff);
        assert_eq!(cpu.reg(0), 0xffff_ff00);
    }
}
