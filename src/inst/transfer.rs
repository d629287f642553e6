//! Load/store executors: single, block, halfword, doubleword, swap
//!
//! Every access goes through the permission-checked guest accessors, so a
//! bad address surfaces as a data abort to the fetch loop. Post-indexed
//! forms with the write-back bit set are the privileged LDRT/STRT family
//! and abort.

use super::{dataproc, field};
use crate::cpu::{Cpu, Exception};
use log::{error, trace};

fn index(base: u32, up: bool, offset: u32) -> u32 {
    if up {
        base.wrapping_add(offset)
    } else {
        base.wrapping_sub(offset)
    }
}

/// LDR/STR, word or byte
pub(crate) fn single(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let register_offset = word & (1 << 25) != 0;
    let pre_index = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let byte = word & (1 << 22) != 0;
    let mut write_back = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let bits = field(word, 0, 12);

    let offset = if register_offset {
        dataproc::operand2(cpu, false, bits)
    } else {
        bits
    };

    let base = cpu.reg(rn);
    let mut addr = base;
    if pre_index {
        addr = index(addr, up, offset);
    }

    let name = if load { "ldr" } else { "str" };
    if load {
        let value = if byte {
            u32::from(fault_at(cpu.read_u8(addr), name, addr)?)
        } else {
            fault_at(cpu.read_u32(addr), name, addr)?
        };
        trace!("{name}: r{rd} = {value:#010x} <-- {addr:#010x}");
        cpu.set_reg(rd, value);
    } else {
        let value = cpu.reg(rd);
        trace!("{name}: r{rd} = {value:#010x} --> {addr:#010x}");
        if byte {
            fault_at(cpu.write_u8(addr, value as u8), name, addr)?;
        } else {
            fault_at(cpu.write_u32(addr, value), name, addr)?;
        }
    }

    if !pre_index {
        addr = index(addr, up, offset);
        if write_back {
            // Post-indexed with W set is LDRT/STRT, a privileged form.
            error!("{name}: translated-access form is privileged");
            return Err(Exception::DataAbort);
        }
        write_back = true;
    }
    if write_back {
        cpu.set_reg(rn, addr);
    }
    Ok(())
}

/// LDM/STM over a 16-bit register list
///
/// Registers transfer in ascending order with the lowest register at the
/// lowest address, whatever the direction bit says; the direction only
/// decides where the block sits relative to the base. A faulting slot marks
/// the instruction aborted but the walk continues: stores that can land do,
/// loads stop updating registers.
pub(crate) fn block(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let pre_index = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let user_bank = word & (1 << 22) != 0;
    let write_back = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = field(word, 16, 4) as usize;
    let list = word & 0xffff;

    let name = if load { "ldm" } else { "stm" };

    if user_bank {
        error!("{name}: user-bank transfer is privileged");
        return Err(Exception::DataAbort);
    }

    let base = cpu.reg(rn);
    let total = 4 * list.count_ones();
    let mut addr = match (up, pre_index) {
        (true, false) => base,
        (true, true) => base.wrapping_add(4),
        (false, false) => base.wrapping_sub(total).wrapping_add(4),
        (false, true) => base.wrapping_sub(total),
    };

    trace!("{name} ({}) r{rn}={base:#010x} list={list:#06x}", if up { 'u' } else { 'd' });

    let mut aborted = false;
    for reg in 0..16 {
        if list & (1 << reg) == 0 {
            continue;
        }
        if load {
            match cpu.read_u32(addr) {
                Ok(value) if !aborted => cpu.set_reg(reg, value),
                Ok(_) => {}
                Err(_) => {
                    error!("{name}: unmapped address {addr:#010x}");
                    aborted = true;
                }
            }
        } else if cpu.write_u32(addr, cpu.reg(reg)).is_err() {
            error!("{name}: unmapped address {addr:#010x}");
            aborted = true;
        }
        addr = addr.wrapping_add(4);
    }

    let final_base = if up {
        base.wrapping_add(total)
    } else {
        base.wrapping_sub(total)
    };
    if write_back && (!load || !aborted) {
        cpu.set_reg(rn, final_base);
    }

    if aborted {
        return Err(Exception::DataAbort);
    }
    Ok(())
}

/// LDRH/STRH and the signed loads LDRSB/LDRSH
///
/// The offset is either the split 8-bit immediate `offhi:offlo` or a plain
/// register. Signed stores do not exist; that encoding aborts as undefined.
pub(crate) fn half(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let pre_index = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let immediate = word & (1 << 22) != 0;
    let mut write_back = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let off_hi = field(word, 8, 4);
    let off_lo = field(word, 0, 4);
    let signed = word & (1 << 6) != 0;
    let half = word & (1 << 5) != 0;

    let offset = if immediate {
        (off_hi << 4) | off_lo
    } else {
        cpu.reg(off_lo as usize)
    };

    let base = cpu.reg(rn);
    let mut addr = base;
    if pre_index {
        addr = index(addr, up, offset);
    }

    let name = if load { "ldrh" } else { "strh" };
    if load {
        let value = match (signed, half) {
            (false, false) => u32::from(fault_at(cpu.read_u8(addr), name, addr)?),
            (false, true) => u32::from(fault_at(cpu.read_u16(addr), name, addr)?),
            (true, false) => fault_at(cpu.read_u8(addr), name, addr)? as i8 as i32 as u32,
            (true, true) => fault_at(cpu.read_u16(addr), name, addr)? as i16 as i32 as u32,
        };
        trace!("{name}: r{rd} = {value:#x} <-- {addr:#010x}");
        cpu.set_reg(rd, value);
    } else {
        if signed {
            error!("{name}: there is no sign-extending store");
            return Err(Exception::Undefined);
        }
        let value = cpu.reg(rd);
        trace!("{name}: r{rd} = {value:#x} --> {addr:#010x}");
        if half {
            fault_at(cpu.write_u16(addr, value as u16), name, addr)?;
        } else {
            fault_at(cpu.write_u8(addr, value as u8), name, addr)?;
        }
    }

    if !pre_index {
        addr = index(addr, up, offset);
        if write_back {
            error!("{name}: translated-access form is privileged");
            return Err(Exception::DataAbort);
        }
        write_back = true;
    }
    if write_back {
        cpu.set_reg(rn, addr);
    }
    Ok(())
}

/// LDRD/STRD: two words through an even/odd register pair
pub(crate) fn double(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let pre_index = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let immediate = word & (1 << 22) != 0;
    let mut write_back = word & (1 << 21) != 0;
    let load = word & (1 << 5) == 0;
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let off_hi = field(word, 8, 4);
    let off_lo = field(word, 0, 4);

    let name = if load { "ldrd" } else { "strd" };

    if rd % 2 != 0 {
        error!("{name}: destination register r{rd} is odd");
        return Err(Exception::Undefined);
    }

    let offset = if immediate {
        (off_hi << 4) | off_lo
    } else {
        cpu.reg(off_lo as usize)
    };

    let base = cpu.reg(rn);
    let mut addr = base;
    if pre_index {
        addr = index(addr, up, offset);
    }

    if load {
        let low = fault_at(cpu.read_u32(addr), name, addr)?;
        let high = fault_at(cpu.read_u32(addr.wrapping_add(4)), name, addr)?;
        trace!("{name}: r{rd}:r{} = {high:#010x}:{low:#010x} <-- {addr:#010x}", rd + 1);
        cpu.set_reg(rd, low);
        cpu.set_reg(rd + 1, high);
    } else {
        fault_at(cpu.write_u32(addr, cpu.reg(rd)), name, addr)?;
        fault_at(
            cpu.write_u32(addr.wrapping_add(4), cpu.reg(rd + 1)),
            name,
            addr,
        )?;
        trace!("{name}: r{rd}:r{} --> {addr:#010x}", rd + 1);
    }

    if !pre_index {
        addr = index(addr, up, offset);
        if write_back {
            error!("{name}: translated-access form is privileged");
            return Err(Exception::DataAbort);
        }
        write_back = true;
    }
    if write_back {
        cpu.set_reg(rn, addr);
    }
    Ok(())
}

/// SWP/SWPB: atomic-on-a-real-core exchange of a register with memory
pub(crate) fn swap(cpu: &mut Cpu, word: u32) -> Result<(), Exception> {
    let byte = word & (1 << 22) != 0;
    let rn = field(word, 16, 4) as usize;
    let rd = field(word, 12, 4) as usize;
    let rm = field(word, 0, 4) as usize;

    let addr = cpu.reg(rn);
    let name = if byte { "swpb" } else { "swp" };

    if byte {
        let old = fault_at(cpu.read_u8(addr), name, addr)?;
        fault_at(cpu.write_u8(addr, cpu.reg(rm) as u8), name, addr)?;
        cpu.set_reg(rd, u32::from(old));
    } else {
        let old = fault_at(cpu.read_u32(addr), name, addr)?;
        fault_at(cpu.write_u32(addr, cpu.reg(rm)), name, addr)?;
        cpu.set_reg(rd, old);
    }
    trace!("{name}: r{rd} <-> {addr:#010x}");
    Ok(())
}

/// Logs the faulting address before surfacing a data abort
fn fault_at<T>(result: Result<T, Exception>, name: &str, addr: u32) -> Result<T, Exception> {
    if result.is_err() {
        error!("{name}: forbidden access to {addr:#010x}");
    }
    result
}
