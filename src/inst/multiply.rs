//! Multiply and multiply-long

use super::field;
use crate::cpu::{Cpu, Exception};
use log::trace;

/// MUL and MLA
///
/// With S set the N and Z flags follow the result; the carry is
/// architecturally meaningless after a multiply and reads as zero here.
pub(crate) fn multiply(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let accumulate = word & (1 << 21) != 0;
    let set_flags = word & (1 << 20) != 0;
    let rd = field(word, 16, 4) as usize;
    let rn = field(word, 12, 4) as usize;
    let rs = field(word, 8, 4) as usize;
    let rm = field(word, 0, 4) as usize;

    let mut result = cpu.reg(rm).wrapping_mul(cpu.reg(rs));
    if accumulate {
        result = result.wrapping_add(cpu.reg(rn));
    }
    cpu.set_reg(rd, result);

    trace!(
        "{} r{rd} <- r{rm} * r{rs} = {result:#010x}",
        if accumulate { "mla" } else { "mul" }
    );

    if set_flags {
        cpu.flags.n = result >> 31 != 0;
        cpu.flags.z = result == 0;
        cpu.flags.c = false;
        cpu.commit_flags();
    }
    Ok(())
}

/// UMULL, UMLAL, SMULL and SMLAL
pub(crate) fn long_multiply(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let signed = word & (1 << 22) != 0;
    let accumulate = word & (1 << 21) != 0;
    let set_flags = word & (1 << 20) != 0;
    let rd_hi = field(word, 16, 4) as usize;
    let rd_lo = field(word, 12, 4) as usize;
    let rs = field(word, 8, 4) as usize;
    let rm = field(word, 0, 4) as usize;

    let product = if signed {
        (i64::from(cpu.reg(rm) as i32) * i64::from(cpu.reg(rs) as i32)) as u64
    } else {
        u64::from(cpu.reg(rm)) * u64::from(cpu.reg(rs))
    };
    let result = if accumulate {
        let acc = (u64::from(cpu.reg(rd_hi)) << 32) | u64::from(cpu.reg(rd_lo));
        product.wrapping_add(acc)
    } else {
        product
    };

    cpu.set_reg(rd_lo, result as u32);
    cpu.set_reg(rd_hi, (result >> 32) as u32);

    trace!(
        "{}mull r{rd_lo}:r{rd_hi} <- r{rm} * r{rs} = {result:#018x}",
        if signed { "s" } else { "u" }
    );

    if set_flags {
        cpu.flags.n = result >> 63 != 0;
        cpu.flags.z = result == 0;
        cpu.flags.c = false;
        cpu.commit_flags();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_and_mla() {
        let mut cpu = Cpu::new();
        cpu.set_reg(1, 7);
        cpu.set_reg(2, 6);
        // MUL r0, r1, r2
        multiply(&mut cpu, 0xe000_0291).unwrap();
        assert_eq!(cpu.reg(0), 42);

        cpu.set_reg(3, 100);
        // MLA r0, r1, r2, r3
        multiply(&mut cpu, 0xe020_3291).unwrap();
        assert_eq!(cpu.reg(0), 142);
    }

    #[test]
    fn muls_sets_n_and_z() {
        let mut cpu = Cpu::new();
        cpu.set_reg(1, 0);
        cpu.set_reg(2, 123);
        // MULS r0, r1, r2
        multiply(&mut cpu, 0xe010_0291).unwrap();
        assert!(cpu.cpsr().z());
        assert!(!cpu.cpsr().n());
    }

    #[test]
    fn umull_widens_unsigned() {
        let mut cpu = Cpu::new();
        cpu.set_reg(2, 0xffff_ffff);
        cpu.set_reg(3, 2);
        // UMULL r0, r1, r2, r3
        long_multiply(&mut cpu, 0xe081_0392).unwrap();
        assert_eq!(cpu.reg(0), 0xffff_fffe);
        assert_eq!(cpu.reg(1), 1);
    }

    #[test]
    fn smull_widens_signed() {
        let mut cpu = Cpu::new();
        cpu.set_reg(2, (-3i32) as u32);
        cpu.set_reg(3, 4);
        // SMULL r0, r1, r2, r3
        long_multiply(&mut cpu, 0xe0c1_0392).unwrap();
        assert_eq!(((u64::from(cpu.reg(1)) << 32) | u64::from(cpu.reg(0))) as i64, -12);
    }

    #[test]
    fn umlal_accumulates() {
        let mut cpu = Cpu::new();
        cpu.set_reg(0, 5); // low accumulator
        cpu.set_reg(1, 0); // high accumulator
        cpu.set_reg(2, 10);
        cpu.set_reg(3, 10);
        // UMLAL r0, r1, r2, r3
        long_multiply(&mut cpu, 0xe0a1_0392).unwrap();
        assert_eq!(cpu.reg(0), 105);
        assert_eq!(cpu.reg(1), 0);
    }
}
