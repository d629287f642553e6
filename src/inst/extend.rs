//! Bit-field extraction and the byte/halfword extension family

use super::{field, mask};
use crate::cpu::{Cpu, Exception, PC};
use log::trace;

/// SBFX/UBFX: pull `widthm1 + 1` bits out of a register at `lsb`
pub(crate) fn bit_field_extract(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let widthm1 = field(word, 16, 5);
    let rd = field(word, 12, 4) as usize;
    let lsb = field(word, 7, 5);
    let rn = field(word, 0, 4) as usize;
    let unsigned = word & (1 << 22) != 0;

    let mut result = field(cpu.reg(rn), lsb, widthm1 + 1);
    if !unsigned && result & (1 << widthm1) != 0 {
        result |= !(mask(widthm1 + 1) >> 1);
    }

    trace!(
        "extract (lsb={lsb}, width={}, {}signed) from {:#010x}: {result:#010x}",
        widthm1 + 1,
        if unsigned { "un" } else { "" },
        cpu.reg(rn),
    );

    cpu.set_reg(rd, result);
    Ok(())
}

fn extend_byte_to_half(byte: u8, unsigned: bool) -> u16 {
    if unsigned {
        u16::from(byte)
    } else {
        byte as i8 as i16 as u16
    }
}

/// The XT/XTA family: SXTB/SXTH/UXTB/UXTH and their accumulating forms,
/// plus the dual-halfword XTAB16 variants
///
/// The source rotates right by `rotate * 8` first; an Rn of r15 means the
/// plain (non-accumulating) form.
pub(crate) fn extend(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let op = field(word, 20, 2);
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let rotate = field(word, 10, 2) * 8;
    let rm = field(word, 0, 4) as usize;
    let unsigned = word & (1 << 22) != 0;

    let rotated = cpu.reg(rm).rotate_right(rotate);
    let op1 = if rn == PC { 0 } else { cpu.reg(rn) };

    let result = match op {
        // XTAB16: byte-to-halfword in each half independently
        0b00 => {
            let low = (op1 as u16).wrapping_add(extend_byte_to_half(rotated as u8, unsigned));
            let high = ((op1 >> 16) as u16)
                .wrapping_add(extend_byte_to_half((rotated >> 16) as u8, unsigned));
            u32::from(low) | (u32::from(high) << 16)
        }
        // XTAB: one byte
        0b10 => {
            let operand = if unsigned {
                rotated & 0xff
            } else {
                rotated as u8 as i8 as i32 as u32
            };
            op1.wrapping_add(operand)
        }
        // XTAH: one halfword
        0b11 => {
            let operand = if unsigned {
                rotated & 0xffff
            } else {
                rotated as u16 as i16 as i32 as u32
            };
            op1.wrapping_add(operand)
        }
        _ => return Err(Exception::Undefined),
    };

    trace!(
        "{}-extend r{rd} = extend(r{rm} ror {rotate}) + {op1:#x} = {result:#010x}",
        if unsigned { "zero" } else { "sign" }
    );

    cpu.set_reg(rd, result);
    Ok(())
}
