//! Watchpoints: predicates evaluated around every executed instruction
//!
//! A watchpoint pairs a predicate with a phase (before execution, after, or
//! both) and optionally a callback. Hitting a watchpoint without a callback
//! halts [`Cpu::run`]; with one, the callback decides (a truthy return
//! halts). Register watchpoints work off a snapshot of the interesting
//! registers taken before each instruction, so the post phase can see what
//! changed.

use crate::cpu::Cpu;
use crate::memory::{Access, SegmentId};
use log::warn;
use std::rc::Rc;

/// Phases at which a watchpoint fires
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum When {
    Pre,
    Post,
    Both,
}

impl When {
    fn pre(self) -> bool {
        matches!(self, Self::Pre | Self::Both)
    }

    fn post(self) -> bool {
        matches!(self, Self::Post | Self::Both)
    }
}

/// Stable handle to a watchpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchId(usize);

/// A watchpoint callback: return `true` to halt execution
pub type WatchFn = Rc<dyn Fn(&mut Cpu, WatchId) -> bool>;

/// What a watchpoint tests
#[derive(Clone, Copy, Debug)]
pub(crate) enum Predicate {
    /// Any register in the mask changed since the pre-instruction snapshot
    Registers { mask: u16 },
    /// The watched guest word changed value
    Memory {
        addr: u32,
        cached: Option<(SegmentId, usize)>,
        previous: u32,
    },
    /// Every instruction
    Step,
    /// The executed word matches `pattern` under `mask`
    Instruction { pattern: u32, mask: u32 },
    /// The instruction moved the program counter
    Branch,
}

/// One installed watchpoint
pub struct Watchpoint {
    name: String,
    predicate: Predicate,
    when: When,
    enabled: bool,
    callback: Option<WatchFn>,
    /// For register watchpoints: which registers changed on the last hit
    affected: u16,
}

impl Watchpoint {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Registers that changed on the most recent register-watch hit
    #[must_use]
    pub const fn affected(&self) -> u16 {
        self.affected
    }
}

/// All watchpoints of one CPU
#[derive(Default)]
pub struct WatchpointSet {
    slots: Vec<Option<Watchpoint>>,
    /// OR of every register watchpoint's mask
    regmask: u16,
    /// Snapshot of the interesting registers, taken pre-instruction
    saved: [u32; 16],
}

impl WatchpointSet {
    fn insert(&mut self, watchpoint: Watchpoint) -> WatchId {
        if let Predicate::Registers { mask } = watchpoint.predicate {
            self.regmask |= mask;
        }
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(watchpoint);
                WatchId(index)
            }
            None => {
                self.slots.push(Some(watchpoint));
                WatchId(self.slots.len() - 1)
            }
        }
    }

    fn recalc_regmask(&mut self) {
        self.regmask = self
            .slots
            .iter()
            .flatten()
            .filter_map(|wp| match wp.predicate {
                Predicate::Registers { mask } => Some(mask),
                _ => None,
            })
            .fold(0, |acc, mask| acc | mask);
    }
}

impl Cpu {
    fn add_watchpoint(
        &mut self,
        name: &str,
        predicate: Predicate,
        when: When,
        callback: Option<WatchFn>,
    ) -> WatchId {
        self.watch.insert(Watchpoint {
            name: name.to_owned(),
            predicate,
            when,
            enabled: true,
            callback,
            affected: 0,
        })
    }

    /// Watches a single register for changes
    pub fn watch_reg(
        &mut self,
        name: &str,
        reg: usize,
        when: When,
        callback: Option<WatchFn>,
    ) -> WatchId {
        self.watch_regs(name, 1 << reg, when, callback)
    }

    /// Watches every register in a 16-bit mask for changes
    pub fn watch_regs(
        &mut self,
        name: &str,
        mask: u16,
        when: When,
        callback: Option<WatchFn>,
    ) -> WatchId {
        self.add_watchpoint(name, Predicate::Registers { mask }, when, callback)
    }

    /// Watches the guest word at `addr` for changes
    pub fn watch_memory(
        &mut self,
        name: &str,
        addr: u32,
        when: When,
        callback: Option<WatchFn>,
    ) -> WatchId {
        self.add_watchpoint(
            name,
            Predicate::Memory {
                addr,
                cached: None,
                previous: 0,
            },
            when,
            callback,
        )
    }

    /// Fires on every executed instruction
    pub fn watch_step(&mut self, name: &str, when: When, callback: Option<WatchFn>) -> WatchId {
        self.add_watchpoint(name, Predicate::Step, when, callback)
    }

    /// Fires when the executed word matches `pattern` under `mask`
    pub fn watch_inst(
        &mut self,
        name: &str,
        pattern: u32,
        mask: u32,
        when: When,
        callback: Option<WatchFn>,
    ) -> WatchId {
        self.add_watchpoint(name, Predicate::Instruction { pattern, mask }, when, callback)
    }

    /// Fires when an instruction redirects control flow
    pub fn watch_branch(&mut self, name: &str, when: When, callback: Option<WatchFn>) -> WatchId {
        self.add_watchpoint(name, Predicate::Branch, when, callback)
    }

    pub fn watch_enable(&mut self, id: WatchId) {
        if let Some(wp) = self.watch.slots.get_mut(id.0).and_then(Option::as_mut) {
            wp.enabled = true;
        }
    }

    pub fn watch_disable(&mut self, id: WatchId) {
        if let Some(wp) = self.watch.slots.get_mut(id.0).and_then(Option::as_mut) {
            wp.enabled = false;
        }
    }

    /// Removes a watchpoint; register-interest bookkeeping shrinks with it
    pub fn watch_delete(&mut self, id: WatchId) {
        if let Some(slot) = self.watch.slots.get_mut(id.0) {
            let was_registers =
                matches!(slot.as_ref().map(|wp| &wp.predicate), Some(Predicate::Registers { .. }));
            *slot = None;
            if was_registers {
                self.watch.recalc_regmask();
            }
        }
    }

    /// Read access to a watchpoint, e.g. from inside its own callback
    #[must_use]
    pub fn watchpoint(&self, id: WatchId) -> Option<&Watchpoint> {
        self.watch.slots.get(id.0)?.as_ref()
    }

    /// The pre-execution phase: snapshot registers, refresh memory cells,
    /// evaluate `Pre` predicates. Returns `true` to halt.
    pub(crate) fn watch_pre(&mut self, word: u32) -> bool {
        let regmask = self.watch.regmask;
        if regmask != 0 {
            for reg in 0..16 {
                if regmask & (1 << reg) != 0 {
                    self.watch.saved[reg] = self.regs.r[reg];
                }
            }
        }

        for index in 0..self.watch.slots.len() {
            let (enabled, is_memory) = match self.watch.slots[index].as_ref() {
                Some(wp) => (wp.enabled, matches!(wp.predicate, Predicate::Memory { .. })),
                None => continue,
            };
            if !enabled {
                continue;
            }
            if is_memory {
                self.refresh_memory_watch(index);
            }

            let eligible = self
                .watch
                .slots[index]
                .as_ref()
                .map_or(false, |wp| wp.enabled && wp.when.pre());
            if eligible && self.evaluate(index, word, false) && self.notify(index, "pre") {
                return true;
            }
        }
        false
    }

    /// The post-execution phase; `branched` comes from the fetch loop's
    /// PC comparison. Returns `true` to halt.
    pub(crate) fn watch_post(&mut self, word: u32, branched: bool) -> bool {
        for index in 0..self.watch.slots.len() {
            let eligible = self
                .watch
                .slots[index]
                .as_ref()
                .map_or(false, |wp| wp.enabled && wp.when.post());
            if eligible && self.evaluate(index, word, branched) && self.notify(index, "post") {
                return true;
            }
        }
        false
    }

    /// Runs a hit watchpoint's callback; no callback means halt
    fn notify(&mut self, index: usize, phase: &str) -> bool {
        let (name, callback) = match self.watch.slots[index].as_ref() {
            Some(wp) => (wp.name.clone(), wp.callback.clone()),
            None => return false,
        };
        match callback {
            None => {
                warn!("watchpoint #{index} (\"{name}\") triggered, stopping execution ({phase})");
                true
            }
            Some(callback) => callback(self, WatchId(index)),
        }
    }

    /// Resolves and snapshots a memory watchpoint's cell
    ///
    /// An unresolvable address disables the watchpoint, loudly; so does a
    /// cell whose segment has since been unmapped.
    fn refresh_memory_watch(&mut self, index: usize) {
        let (addr, cached) = match self.watch.slots[index].as_ref().map(|wp| wp.predicate) {
            Some(Predicate::Memory { addr, cached, .. }) => (addr, cached),
            _ => return,
        };

        let location = match cached {
            Some(location) => Some(location),
            None => self.mem.lookup(addr).and_then(|id| {
                let segment = self.mem.get(id)?;
                if !segment.access().permits(Access::R) {
                    return None;
                }
                if addr.checked_add(4)? > segment.end() {
                    return None;
                }
                Some((id, (addr - segment.virt()) as usize))
            }),
        };
        let value = location.and_then(|location| self.cell_value(location));

        let Some(wp) = self.watch.slots[index].as_mut() else {
            return;
        };
        match (location, value) {
            (Some(location), Some(value)) => {
                if let Predicate::Memory {
                    cached, previous, ..
                } = &mut wp.predicate
                {
                    *cached = Some(location);
                    *previous = value;
                }
            }
            (None, _) => {
                warn!(
                    "watchpoint \"{}\": cannot translate address {addr:#010x}, watchpoint disabled",
                    wp.name
                );
                wp.enabled = false;
            }
            (Some(_), None) => {
                warn!(
                    "watchpoint \"{}\": watched segment vanished, watchpoint disabled",
                    wp.name
                );
                wp.enabled = false;
            }
        }
    }

    fn cell_value(&self, (id, offset): (SegmentId, usize)) -> Option<u32> {
        let bytes = self.mem.get(id)?.bytes().get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Evaluates a watchpoint's predicate against current CPU state
    fn evaluate(&mut self, index: usize, word: u32, branched: bool) -> bool {
        let predicate = match self.watch.slots[index].as_ref() {
            Some(wp) => wp.predicate,
            None => return false,
        };
        match predicate {
            Predicate::Registers { mask } => {
                let mut affected = 0u16;
                for reg in 0..16 {
                    if mask & (1 << reg) != 0 && self.regs.r[reg] != self.watch.saved[reg] {
                        affected |= 1 << reg;
                    }
                }
                if let Some(wp) = self.watch.slots[index].as_mut() {
                    wp.affected = affected;
                }
                affected != 0
            }
            Predicate::Memory {
                cached, previous, ..
            } => cached
                .and_then(|loc| self.cell_value(loc))
                .is_some_and(|value| value != previous),
            Predicate::Step => true,
            Predicate::Instruction { pattern, mask } => word & mask == pattern & mask,
            Predicate::Branch => branched,
        }
    }
}
