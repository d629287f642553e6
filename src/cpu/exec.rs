//! The fetch/decode/execute loop
//!
//! `next_pc` is the canonical program counter: every control-flow decision
//! goes through it. r15 only takes the architectural "fetch + 8" value for
//! the duration of an executor, so guest code that reads the PC sees what a
//! real core would have shown it.

use super::{Cpu, Exception, Flags, HOOK_BASE, LR, PC, RETURN_SENTINEL, VDSO_BASE};
use crate::inst;
use log::{debug, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Why [`Cpu::run`] stopped without a fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// The return sentinel was fetched; the guest finished cleanly
    Sentinel,
    /// A watchpoint asked to halt execution
    Watchpoint,
}

/// The sixteen ARM condition codes, from the top nibble of every instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Condition {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
    Nv = 15,
}

impl Condition {
    /// Evaluates the condition against the committed CPSR flags
    #[must_use]
    pub fn holds(self, cpsr: crate::cpu::Cpsr) -> bool {
        let (n, z, c, v) = (cpsr.n(), cpsr.z(), cpsr.c(), cpsr.v());
        match self {
            Self::Eq => z,
            Self::Ne => !z,
            Self::Hs => c,
            Self::Lo => !c,
            Self::Mi => n,
            Self::Pl => !n,
            Self::Vs => v,
            Self::Vc => !v,
            Self::Hi => c && !z,
            Self::Ls => !c || z,
            Self::Ge => n == v,
            Self::Lt => n != v,
            Self::Gt => n == v && !z,
            Self::Le => n != v || z,
            Self::Al => true,
            Self::Nv => false,
        }
    }
}

impl Cpu {
    /// Redirects the fetch loop to `addr`
    pub fn jump(&mut self, addr: u32) {
        self.next_pc = addr;
    }

    /// Issues a simulated function return (`next_pc = LR`)
    ///
    /// Hook callbacks call this after writing their result to r0.
    pub fn ret(&mut self) {
        self.next_pc = self.regs.r[LR];
    }

    /// Calls a guest procedure and runs until it returns
    ///
    /// The link register is pointed at the sentinel page, so the callee's
    /// `BX lr` fetches the return sentinel and the loop stops with
    /// [`Stop::Sentinel`]; `next_pc` reads [`VDSO_BASE`] afterwards.
    pub fn callproc(&mut self, addr: u32) -> Result<Stop, Exception> {
        self.jump(addr);
        self.regs.r[LR] = VDSO_BASE;
        self.run()
    }

    /// Runs the fetch/execute loop until the sentinel, a watchpoint halt, or
    /// an unhandled exception
    pub fn run(&mut self) -> Result<Stop, Exception> {
        loop {
            let pc = self.next_pc;
            self.regs.r[PC] = pc;

            let word = match self.mem.read_exec_word(pc) {
                Some(word) => word,
                None => {
                    warn!("prefetch abort: no executable mapping at {pc:#010x}");
                    // Skip the bad slot so a vector that merely logs makes
                    // progress instead of spinning on the same fetch.
                    self.next_pc = pc.wrapping_add(4);
                    self.dispatch_exception(Exception::PrefetchAbort, pc, 0)?;
                    continue;
                }
            };

            if word == RETURN_SENTINEL {
                // next_pc still names the sentinel word here.
                return Ok(Stop::Sentinel);
            }
            self.next_pc = pc.wrapping_add(4);

            let Some(kind) = inst::decode(word) else {
                debug!("undecodable word {word:#010x} at {pc:#010x}");
                self.dispatch_exception(Exception::Undefined, pc, word)?;
                continue;
            };

            self.flags = Flags::from_cpsr(self.regs.cpsr);
            self.regs.r[PC] = pc.wrapping_add(8);

            let condition =
                Condition::from_u32(word >> 28).expect("a 4-bit field covers every condition");
            if !condition.holds(self.regs.cpsr) {
                trace!("skip {word:#010x} at {pc:#010x} ({condition:?} fails)");
                self.regs.r[PC] = pc;
                continue;
            }

            if self.watch_pre(word) {
                // The instruction never ran; drop r15 back to the fetch
                // address so diagnostics name the halting instruction.
                self.regs.r[PC] = pc;
                return Ok(Stop::Watchpoint);
            }

            let outcome = inst::execute(self, kind, word);

            // An executor that moved r15 performed a branch; adopt the new
            // target. Otherwise drop r15 back to the fetch address.
            let branched =
                self.regs.r[PC].wrapping_sub(8) != self.next_pc.wrapping_sub(4);
            if branched {
                self.next_pc = self.regs.r[PC];
            } else {
                self.regs.r[PC] = pc;
            }

            if self.watch_post(word, branched) {
                return Ok(Stop::Watchpoint);
            }

            match outcome {
                Ok(()) => {}
                Err(Exception::SoftwareInterrupt) => {
                    if let Err(exception) = self.dispatch_swi(word & 0x00ff_ffff) {
                        self.dispatch_exception(exception, self.regs.r[PC], word)?;
                    }
                }
                Err(exception) => {
                    self.dispatch_exception(exception, self.regs.r[PC], 0)?;
                }
            }
        }
    }

    /// Routes a software interrupt: hook slots dispatch to their callback,
    /// anything else surfaces as a plain [`Exception::SoftwareInterrupt`]
    fn dispatch_swi(&mut self, immediate: u32) -> Result<(), Exception> {
        let slot = match immediate.checked_sub(HOOK_BASE) {
            Some(slot) if (slot as usize) < self.hooks.len() => slot as usize,
            _ => return Err(Exception::SoftwareInterrupt),
        };
        let (callback, context) = self.hooks.dispatch(slot).ok_or(Exception::Undefined)?;
        trace!(
            "hook #{slot}: {}",
            context.name.as_deref().unwrap_or("<anonymous>")
        );
        callback(self, &context)
    }

    /// Hands an exception to its vector, or propagates it if none is set
    pub(crate) fn dispatch_exception(
        &mut self,
        exception: Exception,
        addr: u32,
        code: u32,
    ) -> Result<(), Exception> {
        match self.vectors[exception as usize].clone() {
            Some(handler) => {
                handler(self, addr, code);
                Ok(())
            }
            None => Err(exception),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpsr;

    fn cpsr(n: bool, z: bool, c: bool, v: bool) -> Cpsr {
        Cpsr::new().with_n(n).with_z(z).with_c(c).with_v(v)
    }

    #[test]
    fn conditions_follow_the_flag_table() {
        let clear = cpsr(false, false, false, false);
        assert!(!Condition::Eq.holds(clear));
        assert!(Condition::Ne.holds(clear));
        assert!(Condition::Pl.holds(clear));
        assert!(!Condition::Hi.holds(cpsr(false, true, true, false)));
        assert!(Condition::Hi.holds(cpsr(false, false, true, false)));
        assert!(Condition::Ls.holds(cpsr(false, true, true, false)));
        assert!(Condition::Ge.holds(cpsr(true, false, false, true)));
        assert!(Condition::Lt.holds(cpsr(true, false, false, false)));
        assert!(Condition::Gt.holds(cpsr(false, false, false, false)));
        assert!(Condition::Le.holds(cpsr(false, true, false, false)));
        assert!(Condition::Al.holds(clear));
        assert!(!Condition::Nv.holds(cpsr(true, true, true, true)));
    }
}
