//! Loading ELF32 ARM executables into a [`Cpu`]
//!
//! The loader validates the image, copies every `PT_LOAD` range into a
//! segment the CPU owns, locates the dynamic tables so imported symbols can
//! be trapped, and keeps the section-header symbol table around for
//! debug-symbol lookups. The file image itself stays owned by the
//! [`ElfImage`] so symbol names can be resolved long after loading.

use crate::cpu::{Cpu, Exception, SP, STACK_BOTTOM};
use crate::hooks::HookFn;
use crate::memory::{align_up, Access, MapError, Segment, SegmentKind};
use bitfield_struct::bitfield;
use derive_more::Display;
use log::{debug, error, warn};
use std::path::Path;
use std::rc::Rc;

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_ARM: u16 = 40;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: u32 = 0;
const DT_PLTGOT: u32 = 3;
const DT_HASH: u32 = 4;
const DT_STRTAB: u32 = 5;
const DT_SYMTAB: u32 = 6;
const DT_STRSZ: u32 = 10;
const DT_GNU_HASH: u32 = 0x6fff_fef5;

const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

/// Loading failed; the CPU was not created
#[derive(Debug, Display)]
pub enum LoadError {
    #[display(fmt = "i/o error: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "not an ELF image")]
    BadMagic,
    #[display(fmt = "only ELFCLASS32 images are supported")]
    Class,
    #[display(fmt = "only little-endian images are supported")]
    Endianness,
    #[display(fmt = "not an ARM executable")]
    Machine,
    #[display(fmt = "unsupported object type {:#x}", _0)]
    ObjectType(u16),
    #[display(fmt = "malformed program header table")]
    ProgramHeaders,
    #[display(fmt = "truncated image")]
    UnexpectedEof,
    #[display(fmt = "segment with p_memsz below p_filesz")]
    MemSize,
    #[display(fmt = "cannot map segment: {}", _0)]
    Map(MapError),
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            Self::Map(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(inner: std::io::Error) -> Self {
        Self::Io(inner)
    }
}

impl From<MapError> for LoadError {
    fn from(inner: MapError) -> Self {
        Self::Map(inner)
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let chunk = bytes.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([chunk[0], chunk[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// The fields of the ELF header this loader acts on
#[derive(Debug, Clone)]
struct ElfHeader {
    /// Entry point of the executable
    entry: u32,
    /// Offset of the program headers from the start of the image
    phoff: u32,
    /// Offset of the section headers from the start of the image
    shoff: u32,
    /// Size of one program header, in bytes
    phentsize: u16,
    /// Number of program headers
    phnum: u16,
    /// Number of section headers
    shnum: u16,
    /// Section index of the section-name string table
    shstrndx: u16,
}

impl ElfHeader {
    const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

    fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < EHDR_SIZE {
            return Err(LoadError::UnexpectedEof);
        }
        if bytes[..4] != Self::MAGIC {
            return Err(LoadError::BadMagic);
        }
        if bytes[4] != ELFCLASS32 {
            return Err(LoadError::Class);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(LoadError::Endianness);
        }

        let e_type = read_u16(bytes, 16).ok_or(LoadError::UnexpectedEof)?;
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(LoadError::ObjectType(e_type));
        }
        if read_u16(bytes, 18) != Some(EM_ARM) {
            return Err(LoadError::Machine);
        }

        let header = Self {
            entry: read_u32(bytes, 24).ok_or(LoadError::UnexpectedEof)?,
            phoff: read_u32(bytes, 28).ok_or(LoadError::UnexpectedEof)?,
            shoff: read_u32(bytes, 32).ok_or(LoadError::UnexpectedEof)?,
            phentsize: read_u16(bytes, 42).ok_or(LoadError::UnexpectedEof)?,
            phnum: read_u16(bytes, 44).ok_or(LoadError::UnexpectedEof)?,
            shnum: read_u16(bytes, 48).ok_or(LoadError::UnexpectedEof)?,
            shstrndx: read_u16(bytes, 50).ok_or(LoadError::UnexpectedEof)?,
        };

        if usize::from(header.phentsize) != PHDR_SIZE {
            return Err(LoadError::ProgramHeaders);
        }
        let table_end = (header.phoff as usize)
            .checked_add(usize::from(header.phnum) * PHDR_SIZE)
            .ok_or(LoadError::ProgramHeaders)?;
        if table_end > bytes.len() {
            return Err(LoadError::ProgramHeaders);
        }
        Ok(header)
    }
}

/// Permission bits of a program header, PF_X low
#[bitfield(u32)]
struct ProgramHeaderFlags {
    executable: bool,
    writable: bool,
    readable: bool,
    #[bits(29)]
    __: u32,
}

impl ProgramHeaderFlags {
    fn access(self) -> Access {
        Access::new()
            .with_read(self.readable())
            .with_write(self.writable())
            .with_execute(self.executable())
    }
}

/// One program header
#[derive(Debug, Clone)]
struct ProgramHeader {
    p_type: u32,
    /// Offset of the segment's bytes in the image
    offset: u32,
    /// Virtual address the segment maps to
    vaddr: u32,
    /// Bytes present in the image
    filesz: u32,
    /// Bytes occupied in memory; the excess over `filesz` is zero-filled
    memsz: u32,
    flags: ProgramHeaderFlags,
}

impl ProgramHeader {
    fn parse(bytes: &[u8], offset: usize) -> Option<Self> {
        Some(Self {
            p_type: read_u32(bytes, offset)?,
            offset: read_u32(bytes, offset + 4)?,
            vaddr: read_u32(bytes, offset + 8)?,
            filesz: read_u32(bytes, offset + 16)?,
            memsz: read_u32(bytes, offset + 20)?,
            flags: ProgramHeaderFlags::from(read_u32(bytes, offset + 24)?),
        })
    }

    fn file_range_ok(&self, image_len: usize) -> bool {
        (self.offset as usize)
            .checked_add(self.filesz as usize)
            .is_some_and(|end| end <= image_len)
    }
}

/// One section header, as far as symbol capture cares
#[derive(Debug, Clone)]
struct SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_offset: u32,
    sh_size: u32,
    sh_link: u32,
}

impl SectionHeader {
    fn parse(bytes: &[u8], offset: usize) -> Option<Self> {
        Some(Self {
            sh_name: read_u32(bytes, offset)?,
            sh_type: read_u32(bytes, offset + 4)?,
            sh_offset: read_u32(bytes, offset + 16)?,
            sh_size: read_u32(bytes, offset + 20)?,
            sh_link: read_u32(bytes, offset + 24)?,
        })
    }
}

/// A symbol-table entry; only name and value matter here
#[derive(Debug, Clone, Copy)]
struct Symbol {
    st_name: u32,
    st_value: u32,
}

impl Symbol {
    fn parse(bytes: &[u8], offset: usize) -> Option<Self> {
        Some(Self {
            st_name: read_u32(bytes, offset)?,
            st_value: read_u32(bytes, offset + 4)?,
        })
    }
}

/// Resolved dynamic-section tables, all as offsets into the image file
struct DynamicInfo {
    symtab_offset: usize,
    /// Index of the first symbol worth scanning (GNU hash skips a prefix)
    symtab_first: usize,
    /// Total number of dynamic symbols
    symtab_count: usize,
    strtab_offset: usize,
    strtab_size: usize,
}

/// Debug symbols captured from the section headers
struct DebugSymbols {
    symtab_offset: usize,
    count: usize,
    strtab_offset: usize,
    strtab_size: usize,
}

/// An owned ELF image plus everything resolved out of its tables
pub struct ElfImage {
    bytes: Vec<u8>,
    header: ElfHeader,
    phdrs: Vec<ProgramHeader>,
    dynamic: Option<DynamicInfo>,
    debug: Option<DebugSymbols>,
}

impl ElfImage {
    fn parse(bytes: Vec<u8>) -> Result<Self, LoadError> {
        let header = ElfHeader::parse(&bytes)?;
        let mut phdrs = Vec::with_capacity(usize::from(header.phnum));
        for index in 0..usize::from(header.phnum) {
            let offset = header.phoff as usize + index * PHDR_SIZE;
            phdrs.push(ProgramHeader::parse(&bytes, offset).ok_or(LoadError::UnexpectedEof)?);
        }
        Ok(Self {
            bytes,
            header,
            phdrs,
            dynamic: None,
            debug: None,
        })
    }

    /// Entry point recorded in the header
    #[must_use]
    pub fn entry(&self) -> u32 {
        self.header.entry
    }

    /// Maps a virtual address to an offset in the image file, going through
    /// the file-backed portion of the PT_LOAD ranges
    fn translate(&self, va: u32) -> Option<usize> {
        self.phdrs
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .find(|phdr| {
                phdr.vaddr <= va
                    && va.wrapping_sub(phdr.vaddr) < phdr.filesz
                    && phdr.file_range_ok(self.bytes.len())
            })
            .map(|phdr| (va - phdr.vaddr) as usize + phdr.offset as usize)
    }

    /// Walks PT_DYNAMIC and resolves the tables the trap machinery needs
    ///
    /// The symbol table becomes usable ("sane") only when the GOT, symbol
    /// table, string table and its size all resolved, and the last string
    /// byte translates.
    fn locate_dynamic(&mut self) {
        let Some(dynamic) = self
            .phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)
            .cloned()
        else {
            return;
        };
        if !dynamic.file_range_ok(self.bytes.len()) {
            error!("broken PT_DYNAMIC; treating the image as static");
            return;
        }

        let mut got = None;
        let mut symtab = None;
        let mut strtab = None;
        let mut strtab_virt = 0;
        let mut strtab_size = 0usize;
        let mut count = None;
        let mut first = 0usize;

        let entries = (dynamic.filesz / 8) as usize;
        for index in 0..entries {
            let offset = dynamic.offset as usize + index * 8;
            let Some(tag) = read_u32(&self.bytes, offset) else {
                break;
            };
            let Some(value) = read_u32(&self.bytes, offset + 4) else {
                break;
            };
            if tag == DT_NULL {
                break;
            }
            match tag {
                DT_PLTGOT => match self.translate(value) {
                    Some(offset) => got = Some(offset),
                    None => error!("cannot translate DT_PLTGOT address ({value:#010x})"),
                },
                DT_SYMTAB => match self.translate(value) {
                    Some(offset) => symtab = Some(offset),
                    None => error!("cannot translate DT_SYMTAB address ({value:#010x})"),
                },
                DT_STRTAB => match self.translate(value) {
                    Some(offset) => {
                        strtab = Some(offset);
                        strtab_virt = value;
                    }
                    None => error!("cannot translate DT_STRTAB address ({value:#010x})"),
                },
                DT_STRSZ => strtab_size = value as usize,
                DT_HASH => match self.translate(value) {
                    // hash[1] is nchain, which equals the symbol count.
                    Some(offset) => count = read_u32(&self.bytes, offset + 4).map(|n| n as usize),
                    None => error!("cannot translate DT_HASH address ({value:#010x})"),
                },
                DT_GNU_HASH => match self.translate(value) {
                    Some(offset) => {
                        if let Some((symoffset, total)) = self.gnu_hash_extent(offset) {
                            first = symoffset;
                            count = Some(total);
                        }
                    }
                    None => error!("cannot translate DT_GNU_HASH address ({value:#010x})"),
                },
                _ => {}
            }
        }

        let (Some(_got), Some(symtab_offset), Some(strtab_offset), Some(symtab_count)) =
            (got, symtab, strtab, count)
        else {
            return;
        };
        if strtab_size == 0 || symtab_count == 0 {
            return;
        }
        // The last string byte has to be reachable, or name lookups could
        // run off the image.
        let last_byte = strtab_virt.checked_add(strtab_size as u32 - 1);
        if last_byte.and_then(|va| self.translate(va)).is_none() {
            error!("dynamic string table is not fully mapped; ignoring dynamic symbols");
            return;
        }

        debug!("dynamic symbols: {symtab_count} entries, first scanned {first}");
        self.dynamic = Some(DynamicInfo {
            symtab_offset,
            symtab_first: first,
            symtab_count,
            strtab_offset,
            strtab_size,
        });
    }

    /// Derives `(symoffset, symbol count)` from a GNU hash table
    ///
    /// The highest bucket points at the start of the last chain; the chain
    /// runs to the entry with the stop bit. Bloom words are 32-bit in
    /// ELFCLASS32.
    fn gnu_hash_extent(&self, table_offset: usize) -> Option<(usize, usize)> {
        let nbuckets = read_u32(&self.bytes, table_offset)? as usize;
        let symoffset = read_u32(&self.bytes, table_offset + 4)? as usize;
        let bloom_size = read_u32(&self.bytes, table_offset + 8)? as usize;
        let buckets_offset = table_offset + 16 + 4 * bloom_size;

        let mut last = 0usize;
        for index in 0..nbuckets {
            let bucket = read_u32(&self.bytes, buckets_offset + 4 * index)? as usize;
            last = last.max(bucket);
        }
        if last < symoffset {
            // Every bucket is empty.
            return Some((symoffset, symoffset));
        }

        let chains_offset = buckets_offset + 4 * nbuckets;
        loop {
            let entry = read_u32(&self.bytes, chains_offset + 4 * (last - symoffset))?;
            if entry & 1 != 0 {
                return Some((symoffset, last + 1));
            }
            last += 1;
        }
    }

    /// Captures SHT_SYMTAB plus its linked string table for debug lookups
    fn locate_debug_symbols(&mut self) {
        let shnum = usize::from(self.header.shnum);
        if shnum == 0 || usize::from(self.header.shstrndx) >= shnum {
            return;
        }
        match (self.header.shoff as usize).checked_add(shnum * SHDR_SIZE) {
            Some(end) if end <= self.bytes.len() => {}
            _ => return,
        }

        let shdr_at = |index: usize| {
            SectionHeader::parse(&self.bytes, self.header.shoff as usize + index * SHDR_SIZE)
        };
        let Some(name_section) = shdr_at(usize::from(self.header.shstrndx)) else {
            return;
        };
        let max_name = name_section.sh_size;

        for index in 0..shnum {
            let Some(section) = shdr_at(index) else {
                continue;
            };
            if section.sh_name >= max_name || section.sh_type != SHT_SYMTAB {
                continue;
            }
            let section_ok = (section.sh_offset as usize)
                .checked_add(section.sh_size as usize)
                .is_some_and(|end| end <= self.bytes.len());
            if !section_ok {
                continue;
            }
            let link = section.sh_link as usize;
            let Some(strtab) = (link < shnum).then(|| shdr_at(link)).flatten() else {
                continue;
            };
            if strtab.sh_type != SHT_STRTAB {
                continue;
            }
            let strtab_ok = (strtab.sh_offset as usize)
                .checked_add(strtab.sh_size as usize)
                .is_some_and(|end| end <= self.bytes.len());
            if !strtab_ok {
                continue;
            }

            self.debug = Some(DebugSymbols {
                symtab_offset: section.sh_offset as usize,
                count: section.sh_size as usize / SYM_SIZE,
                strtab_offset: strtab.sh_offset as usize,
                strtab_size: strtab.sh_size as usize,
            });
            debug!(
                "debug symbols: {} entries",
                self.debug.as_ref().map_or(0, |d| d.count)
            );
            return;
        }
    }

    /// Reads a NUL-terminated name out of a string table
    fn name_at(&self, table_offset: usize, table_size: usize, name_offset: u32) -> Option<&str> {
        let name_offset = name_offset as usize;
        if name_offset >= table_size {
            return None;
        }
        let start = table_offset + name_offset;
        let end = table_offset + table_size;
        let tail = self.bytes.get(start..end.min(self.bytes.len()))?;
        let len = tail.iter().position(|&byte| byte == 0)?;
        std::str::from_utf8(&tail[..len]).ok()
    }

    /// Looks a function up in the captured debug symbol table
    #[must_use]
    pub fn resolve_debug_symbol(&self, name: &str) -> Option<u32> {
        let debug = self.debug.as_ref()?;
        for index in 0..debug.count {
            let Some(symbol) = Symbol::parse(&self.bytes, debug.symtab_offset + index * SYM_SIZE)
            else {
                continue;
            };
            if self.name_at(debug.strtab_offset, debug.strtab_size, symbol.st_name) == Some(name) {
                return Some(symbol.st_value);
            }
        }
        None
    }

    /// The dynamic symbols eligible for import trapping: `(name, st_value)`
    fn dynamic_symbols(&self) -> Vec<(String, u32)> {
        let Some(dynamic) = self.dynamic.as_ref() else {
            return Vec::new();
        };
        let mut symbols = Vec::new();
        for index in dynamic.symtab_first..dynamic.symtab_count {
            let Some(symbol) = Symbol::parse(&self.bytes, dynamic.symtab_offset + index * SYM_SIZE)
            else {
                continue;
            };
            let Some(name) =
                self.name_at(dynamic.strtab_offset, dynamic.strtab_size, symbol.st_name)
            else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            symbols.push((name.to_owned(), symbol.st_value));
        }
        symbols
    }
}

impl Cpu {
    /// Loads an ELF32 ARM executable and builds a CPU around it
    ///
    /// Every `PT_LOAD` becomes an owned segment (zero-filled past
    /// `p_filesz`), `next_pc` points at the entry, and each dynamic symbol
    /// that resolves to mapped memory is trapped with a stub that raises
    /// [`Exception::Undefined`] carrying the symbol's name. Override the
    /// ones the program actually needs with [`Cpu::override_symbol`].
    pub fn new_from_elf(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        let mut image = ElfImage::parse(bytes)?;

        let mut cpu = Self::new();
        for phdr in image.phdrs.clone() {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            if !phdr.file_range_ok(image.bytes.len()) {
                return Err(LoadError::ProgramHeaders);
            }
            if phdr.memsz < phdr.filesz {
                return Err(LoadError::MemSize);
            }
            if phdr.memsz == 0 {
                continue;
            }

            let mut data = vec![0u8; phdr.memsz as usize];
            let start = phdr.offset as usize;
            let file = &image.bytes[start..start + phdr.filesz as usize];
            data[..file.len()].copy_from_slice(file);

            debug!(
                "load segment {:#010x}..{:#010x} ({}{}{})",
                phdr.vaddr,
                phdr.vaddr.wrapping_add(phdr.memsz),
                if phdr.flags.readable() { "r" } else { "-" },
                if phdr.flags.writable() { "w" } else { "-" },
                if phdr.flags.executable() { "x" } else { "-" },
            );

            cpu.add_segment(Segment::new(
                phdr.vaddr,
                data,
                phdr.flags.access(),
                SegmentKind::Image,
            ))?;
        }

        cpu.jump(image.entry());
        image.locate_dynamic();
        image.locate_debug_symbols();
        cpu.image = Some(image);
        cpu.trap_imports();
        Ok(cpu)
    }

    /// Installs the default undefined-import trap over every dynamic symbol
    /// whose slot address is mapped
    fn trap_imports(&mut self) {
        let symbols = match self.image.as_ref() {
            Some(image) => image.dynamic_symbols(),
            None => return,
        };
        let stub: HookFn = Rc::new(|_cpu, context| {
            error!(
                "undefined function `{}'",
                context.name.as_deref().unwrap_or("<anonymous>")
            );
            Err(Exception::Undefined)
        });
        for (name, value) in symbols {
            if self.memory().read_word_raw(value).is_none() {
                // Typically an import without a local slot; nothing to tag.
                continue;
            }
            if let Err(err) = self.hook_instruction(Some(&name), value, Rc::clone(&stub)) {
                warn!("cannot trap symbol {name}: {err}");
            }
        }
    }

    /// Resolves a name through the debug symbol table, if one was captured
    #[must_use]
    pub fn resolve_debug_symbol(&self, name: &str) -> Option<u32> {
        self.image.as_ref()?.resolve_debug_symbol(name)
    }

    /// Lays out the `_start` context: argc at the top of the stack, argv
    /// pointers, a NUL, the packed argument strings, and the emulated
    /// `errno` cell; SP ends up pointing at argc
    pub fn prepare_main(&mut self, args: &[&str]) -> Result<(), MapError> {
        let argc = args.len();
        let strings_base = 4 * (argc + 2);
        let packed: usize = args.iter().map(|arg| arg.len() + 1).sum();
        let errno_offset = strings_base + 4 * ((packed + 3) / 4);
        let size = align_up((errno_offset + 4) as u32, 4096).ok_or(MapError::AddressWrap)?;

        let mut data = vec![0u8; size as usize];
        data[0..4].copy_from_slice(&(argc as u32).to_le_bytes());

        let mut cursor = 0usize;
        for (index, arg) in args.iter().enumerate() {
            let va = STACK_BOTTOM + (strings_base + cursor) as u32;
            data[4 * (index + 1)..4 * (index + 2)].copy_from_slice(&va.to_le_bytes());
            data[strings_base + cursor..strings_base + cursor + arg.len()]
                .copy_from_slice(arg.as_bytes());
            // The NUL is already there.
            cursor += arg.len() + 1;
            debug!("argument {index} at {va:#010x}: \"{arg}\"");
        }
        // argv[argc] stays zero.

        self.add_segment(Segment::new(
            STACK_BOTTOM,
            data,
            Access::RW,
            SegmentKind::Stack,
        ))?;
        self.errno_va = Some(STACK_BOTTOM + errno_offset as u32);
        self.regs.r[SP] = STACK_BOTTOM;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_validation_rejects_foreign_images() {
        let mut bytes = vec![0u8; EHDR_SIZE];
        assert!(matches!(
            ElfHeader::parse(&bytes),
            Err(LoadError::BadMagic)
        ));

        bytes[..4].copy_from_slice(&ElfHeader::MAGIC);
        bytes[4] = 2; // ELFCLASS64
        assert!(matches!(ElfHeader::parse(&bytes), Err(LoadError::Class)));

        bytes[4] = ELFCLASS32;
        bytes[5] = 2; // big-endian
        assert!(matches!(
            ElfHeader::parse(&bytes),
            Err(LoadError::Endianness)
        ));

        bytes[5] = ELFDATA2LSB;
        bytes[16] = ET_EXEC as u8;
        bytes[18] = 3; // EM_386
        assert!(matches!(ElfHeader::parse(&bytes), Err(LoadError::Machine)));

        bytes[18] = EM_ARM as u8;
        bytes[42] = PHDR_SIZE as u8;
        assert!(ElfHeader::parse(&bytes).is_ok());
    }

    #[test]
    fn phdr_table_must_fit_the_image() {
        let mut bytes = vec![0u8; EHDR_SIZE];
        bytes[..4].copy_from_slice(&ElfHeader::MAGIC);
        bytes[4] = ELFCLASS32;
        bytes[5] = ELFDATA2LSB;
        bytes[16] = ET_EXEC as u8;
        bytes[18] = EM_ARM as u8;
        bytes[42] = PHDR_SIZE as u8;
        bytes[44] = 2; // phnum = 2, but no bytes for them
        assert!(matches!(
            ElfHeader::parse(&bytes),
            Err(LoadError::ProgramHeaders)
        ));
    }

    #[test]
    fn gnu_hash_extent_walks_the_last_chain() {
        // nbuckets=2, symoffset=1, bloom_size=1, bloom, buckets=[0, 2],
        // chains for symbols 1.. : [h(1), h(2) (stop bit clear), h(3)|1]
        let mut image_bytes = Vec::new();
        let words = [
            2u32, // nbuckets
            1,    // symoffset
            1,    // bloom_size
            0,    // bloom_shift
            0,    // bloom[0]
            0,    // bucket[0]: empty
            2,    // bucket[1]: chain starts at symbol 2
            0x10, // chain word for symbol 1
            0x20, // chain word for symbol 2
            0x31, // chain word for symbol 3: stop bit
        ];
        for word in words {
            image_bytes.extend_from_slice(&word.to_le_bytes());
        }
        let image = ElfImage {
            bytes: image_bytes,
            header: ElfHeader {
                entry: 0,
                phoff: 0,
                shoff: 0,
                phentsize: PHDR_SIZE as u16,
                phnum: 0,
                shnum: 0,
                shstrndx: 0,
            },
            phdrs: Vec::new(),
            dynamic: None,
            debug: None,
        };
        assert_eq!(image.gnu_hash_extent(0), Some((1, 4)));
    }

    #[test]
    fn prepare_main_builds_the_argument_block() {
        let mut cpu = Cpu::new();
        cpu.prepare_main(&["prog", "hello"]).unwrap();

        assert_eq!(cpu.sp(), STACK_BOTTOM);
        assert_eq!(cpu.read_u32(STACK_BOTTOM), Ok(2));

        let argv0 = cpu.read_u32(STACK_BOTTOM + 4).unwrap();
        assert_eq!(cpu.read_cstring(argv0).unwrap(), b"prog");
        let argv1 = cpu.read_u32(STACK_BOTTOM + 8).unwrap();
        assert_eq!(cpu.read_cstring(argv1).unwrap(), b"hello");
        assert_eq!(cpu.read_u32(STACK_BOTTOM + 12), Ok(0), "argv ends in NULL");

        let errno_va = cpu.guest_errno_va().unwrap();
        assert_eq!(cpu.read_u32(errno_va), Ok(0));
    }
}
