//! The emulated CPU: register file, status flags, and its address space
//!
//! A [`Cpu`] owns everything one guest program touches: the sixteen general
//! registers, the CPSR, the segmented memory map, the hook trap table, the
//! watchpoint set, and the exception vectors. All execution state is behind
//! `&mut self`; there is no interior sharing.

use crate::elf::ElfImage;
use crate::hooks::HookTable;
use crate::memory::{Access, MapError, MemoryMap, Segment, SegmentId, SegmentKind};
use crate::watch::WatchpointSet;
use bitfield_struct::bitfield;
use derive_more::Display;
use num_derive::{FromPrimitive, ToPrimitive};
use std::rc::Rc;

mod exec;
pub use exec::{Condition, Stop};

/// Index of the stack pointer in the register file
pub const SP: usize = 13;
/// Index of the link register
pub const LR: usize = 14;
/// Index of the program counter
pub const PC: usize = 15;

/// First SWI immediate reserved for hook slots
pub const HOOK_BASE: u32 = 0x00c0_0000;
/// Size of the default guest stack
pub const STACK_SIZE: u32 = 64 * 1024;
/// Guest address just past the default stack; also where `_start`'s
/// argument block is laid out
pub const STACK_BOTTOM: u32 = 0xc000_0000;
/// Guest address of the pseudo-page holding the return sentinel
pub const VDSO_BASE: u32 = 0xe000_0000;
/// The word that terminates [`Cpu::run`]: an unconditional `SWI 0xFFFFFF`
///
/// A guest that legitimately issues `SWI 0xFFFFFF` will exit the emulator
/// instead of reaching its own handler; known limitation.
pub const RETURN_SENTINEL: u32 = 0xefff_ffff;

/// The Current Program Status Register
///
/// Only the four condition flags matter to user-space code; the rest of the
/// word is carried around untouched.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Cpsr {
    #[bits(28)]
    __: u32,
    pub v: bool,
    pub c: bool,
    pub z: bool,
    pub n: bool,
}

/// Scratch copies of the condition flags
///
/// Executors compute flags here unconditionally and commit them to the CPSR
/// only when the instruction asked for it (the S bit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

impl Flags {
    pub(crate) fn from_cpsr(cpsr: Cpsr) -> Self {
        Self {
            n: cpsr.n(),
            z: cpsr.z(),
            c: cpsr.c(),
            v: cpsr.v(),
        }
    }
}

/// The architectural register file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registers {
    /// r0–r15; r13 is SP, r14 is LR, r15 is the visible PC
    pub r: [u32; 16],
    pub cpsr: Cpsr,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            r: [0; 16],
            cpsr: Cpsr::new(),
        }
    }
}

/// Guest-visible exceptions, in vector order
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Exception {
    /// Never raised; the slot exists to keep vector numbering architectural
    #[display(fmt = "reset")]
    Reset = 0,
    /// Undefined or unsupported instruction
    #[display(fmt = "undefined instruction")]
    Undefined = 1,
    /// `SWI`/`SVC` outside the hook range
    #[display(fmt = "software interrupt")]
    SoftwareInterrupt = 2,
    /// Instruction fetch from unmapped or non-executable memory
    #[display(fmt = "prefetch abort")]
    PrefetchAbort = 3,
    /// Data access that failed translation or permissions
    #[display(fmt = "data abort")]
    DataAbort = 4,
    /// Architecturally reserved slot
    #[display(fmt = "reserved exception")]
    Reserved = 5,
    /// Hardware interrupt slot; never raised by the emulator itself
    #[display(fmt = "interrupt")]
    Irq = 6,
    /// Fast-interrupt slot; never raised by the emulator itself
    #[display(fmt = "fast interrupt")]
    Fiq = 7,
    /// The guest asked to terminate; the status code is in r0
    #[display(fmt = "guest exit")]
    Exit = 8,
    /// Host-requested trap
    #[display(fmt = "trap")]
    Trap = 9,
}

/// Number of exception vectors
pub const VECTOR_COUNT: usize = 10;

/// An installed exception handler: `(cpu, faulting address, detail word)`
///
/// Returning normally resumes the fetch loop; the handler may redirect it
/// with [`Cpu::jump`] first.
pub type VectorFn = Rc<dyn Fn(&mut Cpu, u32, u32)>;

/// An emulated ARM7 processor and its guest address space
pub struct Cpu {
    pub(crate) regs: Registers,
    pub(crate) mem: MemoryMap,
    pub(crate) flags: Flags,
    pub(crate) next_pc: u32,
    pub(crate) vectors: [Option<VectorFn>; VECTOR_COUNT],
    pub(crate) hooks: HookTable,
    pub(crate) watch: WatchpointSet,
    pub(crate) image: Option<ElfImage>,
    pub(crate) errno_va: Option<u32>,
}

impl Cpu {
    /// Creates a CPU with the default stack and the sentinel page mapped
    #[must_use]
    pub fn new() -> Self {
        let mut cpu = Self {
            regs: Registers::default(),
            mem: MemoryMap::default(),
            flags: Flags::default(),
            next_pc: 0,
            vectors: Default::default(),
            hooks: HookTable::default(),
            watch: WatchpointSet::default(),
            image: None,
            errno_va: None,
        };

        let stack = Segment::anonymous(
            STACK_BOTTOM - STACK_SIZE,
            STACK_SIZE,
            Access::RW,
            SegmentKind::Stack,
        );
        cpu.mem
            .insert(stack)
            .expect("the stack cannot collide in an empty address space");

        let vdso = Segment::new(
            VDSO_BASE,
            RETURN_SENTINEL.to_le_bytes().to_vec(),
            Access::RX,
            SegmentKind::Vdso,
        );
        cpu.mem
            .insert(vdso)
            .expect("the sentinel page cannot collide with the stack");

        cpu.regs.r[SP] = STACK_BOTTOM - 4;
        cpu
    }

    /// Current value of a register; `index` must be below 16
    #[must_use]
    pub fn reg(&self, index: usize) -> u32 {
        self.regs.r[index]
    }

    /// Overwrites a register; `index` must be below 16
    pub fn set_reg(&mut self, index: usize, value: u32) {
        self.regs.r[index] = value;
    }

    /// The stack pointer (r13)
    #[must_use]
    pub fn sp(&self) -> u32 {
        self.regs.r[SP]
    }

    /// The link register (r14)
    #[must_use]
    pub fn lr(&self) -> u32 {
        self.regs.r[LR]
    }

    /// The visible program counter (r15)
    ///
    /// During an executor this reads fetch address + 8, per the ARM
    /// convention; between instructions it holds the last fetch address.
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.regs.r[PC]
    }

    /// Address of the instruction the fetch loop will execute next
    #[must_use]
    pub const fn next_pc(&self) -> u32 {
        self.next_pc
    }

    #[must_use]
    pub const fn cpsr(&self) -> Cpsr {
        self.regs.cpsr
    }

    pub fn set_cpsr(&mut self, cpsr: Cpsr) {
        self.regs.cpsr = cpsr;
    }

    /// Copies the scratch flags into the CPSR (the S-bit commit)
    pub(crate) fn commit_flags(&mut self) {
        let Flags { n, z, c, v } = self.flags;
        self.regs.cpsr = self
            .regs
            .cpsr
            .with_n(n)
            .with_z(z)
            .with_c(c)
            .with_v(v);
    }

    /// Installs or clears the handler for one exception vector
    pub fn set_vector(&mut self, exception: Exception, handler: Option<VectorFn>) {
        self.vectors[exception as usize] = handler;
    }

    /// The guest address map
    #[must_use]
    pub const fn memory(&self) -> &MemoryMap {
        &self.mem
    }

    #[must_use]
    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.mem
    }

    /// Maps a segment into the guest address space
    pub fn add_segment(&mut self, segment: Segment) -> Result<SegmentId, MapError> {
        self.mem.insert(segment)
    }

    /// Unmaps a segment, handing back its backing memory
    pub fn remove_segment(&mut self, id: SegmentId) -> Option<Segment> {
        self.mem.remove(id)
    }

    /// Searches for an unmapped region; see [`MemoryMap::find_free_region`]
    #[must_use]
    pub fn find_free_region(&self, size: u32, align: u32) -> Option<u32> {
        self.mem.find_free_region(size, align)
    }

    /// Copies `data` into a fresh read-write segment, returning its address
    pub fn map_rw_buffer(&mut self, data: &[u8]) -> Result<u32, MapError> {
        self.map_buffer(data, Access::RW)
    }

    /// Copies `data` into a fresh read-only segment, returning its address
    pub fn map_ro_buffer(&mut self, data: &[u8]) -> Result<u32, MapError> {
        self.map_buffer(data, Access::R)
    }

    /// Copies `data` into a fresh executable segment, returning its address
    pub fn map_exec_buffer(&mut self, data: &[u8]) -> Result<u32, MapError> {
        self.map_buffer(data, Access::RX)
    }

    fn map_buffer(&mut self, data: &[u8], access: Access) -> Result<u32, MapError> {
        let va = self
            .mem
            .find_free_region(data.len() as u32, 16)
            .ok_or(MapError::NoSpace)?;
        let segment = Segment::new(va, data.to_vec(), access, SegmentKind::Buffer);
        self.mem.insert(segment)?;
        Ok(va)
    }

    /// Reads `len` guest bytes, requiring read permission
    pub fn read_bytes(&self, va: u32, len: u32) -> Result<&[u8], Exception> {
        self.mem
            .translate(va, len, Access::R)
            .ok_or(Exception::DataAbort)
    }

    /// Writes guest bytes, requiring write permission
    pub fn write_bytes(&mut self, va: u32, data: &[u8]) -> Result<(), Exception> {
        let host = self
            .mem
            .translate_mut(va, data.len() as u32, Access::RW)
            .ok_or(Exception::DataAbort)?;
        host.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, va: u32) -> Result<u8, Exception> {
        Ok(self.read_bytes(va, 1)?[0])
    }

    pub fn read_u16(&self, va: u32) -> Result<u16, Exception> {
        let bytes = self.read_bytes(va, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&self, va: u32) -> Result<u32, Exception> {
        let bytes = self.read_bytes(va, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u8(&mut self, va: u32, value: u8) -> Result<(), Exception> {
        self.write_bytes(va, &[value])
    }

    pub fn write_u16(&mut self, va: u32, value: u16) -> Result<(), Exception> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, va: u32, value: u32) -> Result<(), Exception> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated guest string, NUL excluded
    ///
    /// The terminator must lie within the segment containing `va`.
    pub fn read_cstring(&self, va: u32) -> Result<Vec<u8>, Exception> {
        let id = self.mem.lookup(va).ok_or(Exception::DataAbort)?;
        let segment = self.mem.get(id).ok_or(Exception::DataAbort)?;
        if !segment.access().permits(Access::R) {
            return Err(Exception::DataAbort);
        }
        let offset = (va - segment.virt()) as usize;
        let tail = &segment.bytes()[offset..];
        let len = tail
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(Exception::DataAbort)?;
        Ok(tail[..len].to_vec())
    }

    /// Reads a guest string for diagnostics, replacing invalid UTF-8
    pub fn read_cstring_lossy(&self, va: u32) -> Result<String, Exception> {
        Ok(String::from_utf8_lossy(&self.read_cstring(va)?).into_owned())
    }

    /// Guest address of the emulated `errno` cell, once the stack for
    /// `_start` has been prepared
    #[must_use]
    pub const fn guest_errno_va(&self) -> Option<u32> {
        self.errno_va
    }

    /// Stores a value into the emulated `errno` cell, if one exists
    pub fn set_guest_errno(&mut self, value: u32) {
        if let Some(va) = self.errno_va {
            let _ = self.write_u32(va, value);
        }
    }

    /// The loaded executable, if this CPU came from [`Cpu::new_from_elf`]
    #[must_use]
    pub const fn image(&self) -> Option<&ElfImage> {
        self.image.as_ref()
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cpu_maps_stack_and_sentinel() {
        let cpu = Cpu::new();
        assert_eq!(cpu.sp(), STACK_BOTTOM - 4);
        // The stack is writable...
        assert!(cpu
            .mem
            .translate(STACK_BOTTOM - STACK_SIZE, 4, Access::RW)
            .is_some());
        // ...and the sentinel page is executable but not writable.
        assert_eq!(cpu.mem.read_exec_word(VDSO_BASE), Some(RETURN_SENTINEL));
        assert!(cpu.mem.translate(VDSO_BASE, 4, Access::RW).is_none());
    }

    #[test]
    fn guest_accessors_round_trip() {
        let mut cpu = Cpu::new();
        let va = STACK_BOTTOM - 0x100;
        cpu.write_u32(va, 0x1122_3344).unwrap();
        assert_eq!(cpu.read_u32(va), Ok(0x1122_3344));
        assert_eq!(cpu.read_u16(va), Ok(0x3344));
        assert_eq!(cpu.read_u8(va + 3), Ok(0x11));
        assert_eq!(cpu.read_u32(0x4), Err(Exception::DataAbort));
    }

    #[test]
    fn cstring_stops_at_nul() {
        let mut cpu = Cpu::new();
        let va = STACK_BOTTOM - 0x40;
        cpu.write_bytes(va, b"hello\0world").unwrap();
        assert_eq!(cpu.read_cstring(va).unwrap(), b"hello");
    }

    #[test]
    fn mapped_buffers_avoid_page_zero() {
        let mut cpu = Cpu::new();
        let va = cpu.map_rw_buffer(&[1, 2, 3, 4]).unwrap();
        assert!(va >= 0x1000);
        assert_eq!(cpu.read_u8(va + 2), Ok(3));
    }
}
