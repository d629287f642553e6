//! The guest address space: permissioned segments over host-owned memory
//!
//! Guest addresses are 32 bits. Every mapped range is a [`Segment`] backed by
//! a contiguous host buffer the segment owns. Segments never resize, never
//! overlap, and are looked up in insertion order.

use bitfield_struct::bitfield;
use derive_more::Display;
use log::trace;

/// Access rights of a segment, and equally the shape of an access request
///
/// A request is satisfied when it is a subset of the segment's rights.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Access {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(5)]
    __: u8,
}

impl Access {
    /// Read-only data
    pub const R: Self = Self::new().with_read(true);
    /// Readable and writable data
    pub const RW: Self = Self::new().with_read(true).with_write(true);
    /// Readable, executable text
    pub const RX: Self = Self::new().with_read(true).with_execute(true);

    /// Whether every right in `request` is also present in `self`
    #[must_use]
    pub fn permits(self, request: Self) -> bool {
        let held = u8::from(self);
        (held | u8::from(request)) == held
    }
}

/// Why a segment exists, so bookkeeping code can tell them apart
///
/// The heap tag in particular lets the `free` hook recognize blocks that
/// `malloc` carved out of the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    /// The default guest stack
    Stack,
    /// The pseudo-page holding the return sentinel
    Vdso,
    /// A PT_LOAD range of the loaded executable
    Image,
    /// A block allocated by the guest through the heap hooks
    Heap,
    /// A host buffer mapped through the public API
    Buffer,
}

/// A half-open guest range `[virt, virt + len)` backed by host memory
pub struct Segment {
    virt: u32,
    access: Access,
    kind: SegmentKind,
    data: Vec<u8>,
}

impl Segment {
    /// Creates a segment over an existing host buffer
    #[must_use]
    pub fn new(virt: u32, data: Vec<u8>, access: Access, kind: SegmentKind) -> Self {
        Self {
            virt,
            access,
            kind,
            data,
        }
    }

    /// Creates a zero-filled segment of `size` bytes
    #[must_use]
    pub fn anonymous(virt: u32, size: u32, access: Access, kind: SegmentKind) -> Self {
        Self::new(virt, vec![0; size as usize], access, kind)
    }

    /// First guest address of the segment
    #[must_use]
    pub const fn virt(&self) -> u32 {
        self.virt
    }

    /// Length of the segment in bytes
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// One past the last guest address of the segment
    #[must_use]
    pub fn end(&self) -> u32 {
        self.virt.wrapping_add(self.size())
    }

    /// Whether `va` falls inside the segment
    #[must_use]
    pub fn contains(&self, va: u32) -> bool {
        self.virt <= va && va.wrapping_sub(self.virt) < self.size()
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub const fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// The host bytes backing the segment
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn offset_of(&self, va: u32) -> usize {
        (va - self.virt) as usize
    }
}

/// Stable handle to a mapped segment
///
/// Handles index the slot a segment was inserted into; removing a segment
/// blanks its slot, so surviving handles stay valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(usize);

/// A mapping attempt failed
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum MapError {
    /// The new segment intersects an existing one
    #[display(fmt = "segment overlaps an existing mapping")]
    Overlap,
    /// `virt + size` does not fit in the 32-bit address space
    #[display(fmt = "segment range wraps the address space")]
    AddressWrap,
    /// No gap large enough was found
    #[display(fmt = "no free region large enough")]
    NoSpace,
}

impl std::error::Error for MapError {}

/// The set of live segments of one CPU
///
/// Lookup is a linear first-match scan; fine for the handful of segments a
/// loaded executable produces. An interval tree would be the upgrade path if
/// that assumption breaks.
#[derive(Default)]
pub struct MemoryMap {
    slots: Vec<Option<Segment>>,
}

impl MemoryMap {
    /// Adds a segment, rejecting any overlap with live segments
    pub fn insert(&mut self, segment: Segment) -> Result<SegmentId, MapError> {
        if segment.virt().checked_add(segment.size()).is_none() {
            return Err(MapError::AddressWrap);
        }
        if self
            .segments()
            .any(|(_, live)| intersects(live, segment.virt(), segment.size()))
        {
            return Err(MapError::Overlap);
        }

        trace!(
            "map {:#010x}..{:#010x} ({:?})",
            segment.virt(),
            segment.end(),
            segment.kind()
        );

        // Reuse a blanked slot if one exists so ids stay dense.
        let slot = self.slots.iter().position(Option::is_none);
        match slot {
            Some(index) => {
                self.slots[index] = Some(segment);
                Ok(SegmentId(index))
            }
            None => {
                self.slots.push(Some(segment));
                Ok(SegmentId(self.slots.len() - 1))
            }
        }
    }

    /// Removes a segment, returning its backing so callers can reclaim data
    pub fn remove(&mut self, id: SegmentId) -> Option<Segment> {
        self.slots.get_mut(id.0)?.take()
    }

    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Live segments in slot order
    pub fn segments(&self) -> impl Iterator<Item = (SegmentId, &Segment)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|segment| (SegmentId(index), segment)))
    }

    /// First live segment containing `va`
    #[must_use]
    pub fn lookup(&self, va: u32) -> Option<SegmentId> {
        self.segments()
            .find(|(_, segment)| segment.contains(va))
            .map(|(id, _)| id)
    }

    /// Searches for an unmapped, aligned region of `size` bytes
    ///
    /// The cursor starts at `0x1000` (page zero reads as a null pointer to
    /// most programs) and skips past every segment it collides with. `align`
    /// must be a power of two.
    #[must_use]
    pub fn find_free_region(&self, size: u32, align: u32) -> Option<u32> {
        debug_assert!(align.is_power_of_two());
        let size = align_up(size.max(1), align)?;
        let mut guess: u32 = 0x1000;

        'candidate: loop {
            guess.checked_add(size)?;
            for (_, segment) in self.segments() {
                if intersects(segment, guess, size) {
                    let next = align_up(segment.end(), align)?;
                    if next < guess {
                        return None;
                    }
                    guess = next;
                    continue 'candidate;
                }
            }
            return Some(guess);
        }
    }

    /// Resolves a sized access, checking containment and permissions
    ///
    /// Returns the host bytes for `[va, va + len)` iff a single segment
    /// contains the whole range and grants every requested right.
    #[must_use]
    pub fn translate(&self, va: u32, len: u32, access: Access) -> Option<&[u8]> {
        let segment = self.get(self.lookup(va)?)?;
        if !segment.access().permits(access) {
            return None;
        }
        let end = va.checked_add(len)?;
        if end > segment.end() {
            return None;
        }
        let offset = segment.offset_of(va);
        Some(&segment.bytes()[offset..offset + len as usize])
    }

    /// Mutable counterpart of [`translate`](Self::translate)
    #[must_use]
    pub fn translate_mut(&mut self, va: u32, len: u32, access: Access) -> Option<&mut [u8]> {
        let id = self.lookup(va)?;
        let segment = self.slots[id.0].as_mut()?;
        if !segment.access().permits(access) {
            return None;
        }
        let end = va.checked_add(len)?;
        if end > segment.end() {
            return None;
        }
        let offset = segment.offset_of(va);
        Some(&mut segment.bytes_mut()[offset..offset + len as usize])
    }

    /// Fetches the instruction word at `va` (requires read and execute)
    #[must_use]
    pub fn read_exec_word(&self, va: u32) -> Option<u32> {
        let bytes = self.translate(va, 4, Access::RX)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a word regardless of segment permissions
    ///
    /// Instruction patching works on text segments that are deliberately not
    /// guest-writable, so the hook machinery goes through this door.
    #[must_use]
    pub fn read_word_raw(&self, va: u32) -> Option<u32> {
        let segment = self.get(self.lookup(va)?)?;
        if va.checked_add(4)? > segment.end() {
            return None;
        }
        let offset = segment.offset_of(va);
        let bytes = &segment.bytes()[offset..offset + 4];
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Writes a word regardless of segment permissions
    #[must_use]
    pub fn write_word_raw(&mut self, va: u32, word: u32) -> Option<()> {
        let id = self.lookup(va)?;
        let segment = self.slots[id.0].as_mut()?;
        if va.checked_add(4)? > segment.end() {
            return None;
        }
        let offset = segment.offset_of(va);
        segment.bytes_mut()[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
        Some(())
    }
}

fn intersects(segment: &Segment, virt: u32, size: u32) -> bool {
    let end = virt.wrapping_add(size);
    virt < segment.end() && segment.virt() < end
}

/// Rounds `value` up to a multiple of the power-of-two `align`
pub(crate) fn align_up(value: u32, align: u32) -> Option<u32> {
    let mask = align - 1;
    Some(value.checked_add(mask)? & !mask)
}
