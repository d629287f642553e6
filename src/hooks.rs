//! The trap table: intercepting guest functions with tagged SWIs
//!
//! ARM's SWI instruction carries a 24-bit immediate, and the emulator owns
//! the range starting at [`HOOK_BASE`](crate::cpu::HOOK_BASE). Hooking a
//! guest address saves the word that lives there and overwrites it with an
//! unconditional SWI whose immediate encodes the table slot. When the fetch
//! loop executes that word, the SWI routes back here and the host callback
//! runs with the CPU at its disposal.
//!
//! Slot numbers are allocated in insertion order; they are the only stable
//! identity a hook has.

use crate::cpu::{Cpu, Exception, HOOK_BASE};
use derive_more::Display;
use log::debug;
use std::rc::Rc;

/// What a hook callback learns about its trap site
pub struct HookContext {
    /// Symbol name the hook was installed for, if any
    pub name: Option<String>,
    /// The instruction word the trap replaced
    pub saved: u32,
    /// Guest address of the trap
    pub va: u32,
}

/// A host callback invoked in place of a guest instruction
///
/// The callback owns the calling convention: read arguments from r0–r3 and
/// the stack, leave the result in r0, and issue the simulated return with
/// [`Cpu::ret`]. Returning an `Err` raises that exception in the fetch loop.
pub type HookFn = Rc<dyn Fn(&mut Cpu, &HookContext) -> Result<(), Exception>>;

struct HookEntry {
    name: Option<String>,
    va: u32,
    saved: u32,
    callback: HookFn,
}

/// The ordered collection of installed hooks
#[derive(Default)]
pub struct HookTable {
    entries: Vec<HookEntry>,
}

impl HookTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name.as_deref() == Some(name))
    }

    fn push(&mut self, name: Option<&str>, va: u32, saved: u32, callback: HookFn) -> usize {
        self.entries.push(HookEntry {
            name: name.map(str::to_owned),
            va,
            saved,
            callback,
        });
        self.entries.len() - 1
    }

    /// Clones out what a dispatch needs so the callback can borrow the CPU
    pub(crate) fn dispatch(&self, slot: usize) -> Option<(HookFn, HookContext)> {
        let entry = self.entries.get(slot)?;
        let context = HookContext {
            name: entry.name.clone(),
            saved: entry.saved,
            va: entry.va,
        };
        Some((Rc::clone(&entry.callback), context))
    }
}

/// A hook operation failed
#[derive(Debug, Display)]
pub enum HookError {
    /// No hook is installed under that name
    #[display(fmt = "symbol is not hooked: {}", _0)]
    UnknownSymbol(String),
    /// The target address does not resolve to mapped memory
    #[display(fmt = "address {:#010x} is not mapped", _0)]
    Unmapped(u32),
}

impl std::error::Error for HookError {}

impl Cpu {
    /// Replaces the guest word at `va` with a tagged SWI trap
    ///
    /// Returns the slot index. The write bypasses segment permissions: text
    /// is deliberately not guest-writable, yet this is exactly where traps
    /// go.
    pub fn hook_instruction(
        &mut self,
        name: Option<&str>,
        va: u32,
        callback: HookFn,
    ) -> Result<usize, HookError> {
        let saved = self.mem.read_word_raw(va).ok_or(HookError::Unmapped(va))?;
        let slot = self.hooks.push(name, va, saved, callback);
        let trap = 0xef00_0000 | ((HOOK_BASE + slot as u32) & 0x00ff_ffff);
        self.mem
            .write_word_raw(va, trap)
            .expect("the address translated a moment ago");
        debug!(
            "hook #{slot} {} at {va:#010x} (saved {saved:#010x})",
            name.unwrap_or("<anonymous>")
        );
        Ok(slot)
    }

    /// Points an already-trapped symbol at a new callback
    ///
    /// The trap word stays in place; only the callback changes. Unknown
    /// names are an error: only symbols the loader tagged can be overridden
    /// by name.
    pub fn override_symbol(&mut self, name: &str, callback: HookFn) -> Result<(), HookError> {
        let slot = self
            .hooks
            .find_by_name(name)
            .ok_or_else(|| HookError::UnknownSymbol(name.to_owned()))?;
        self.hooks.entries[slot].callback = callback;
        Ok(())
    }

    /// Writes the saved original word back over a symbol's trap
    ///
    /// The hook entry survives, so a later [`Cpu::override_symbol`] keeps
    /// working; until then, fetches at the site execute the original
    /// instruction.
    pub fn restore_symbol(&mut self, name: &str) -> Result<(), HookError> {
        let slot = self
            .hooks
            .find_by_name(name)
            .ok_or_else(|| HookError::UnknownSymbol(name.to_owned()))?;
        let (va, saved) = {
            let entry = &self.hooks.entries[slot];
            (entry.va, entry.saved)
        };
        self.mem
            .write_word_raw(va, saved)
            .ok_or(HookError::Unmapped(va))?;
        Ok(())
    }

    /// Installs a hook over a function found in the debug symbol table
    pub fn override_debug_symbol(
        &mut self,
        name: &str,
        callback: HookFn,
    ) -> Result<(), HookError> {
        if self.hooks.find_by_name(name).is_some() {
            return self.override_symbol(name, callback);
        }
        let va = self
            .resolve_debug_symbol(name)
            .ok_or_else(|| HookError::UnknownSymbol(name.to_owned()))?;
        self.hook_instruction(Some(name), va, callback)?;
        Ok(())
    }
}
