//! armulet: a user-space emulator for 32-bit little-endian ARM executables
//!
//! The crate models an ARMv5-era core with a handful of v6/v7 instructions,
//! a segmented guest address space, and an ELF loader that rewires imported
//! library calls into host closures through tagged software interrupts. It
//! runs guest code in-process on any host architecture.
//!
//! The shortest useful program:
//!
//! ```no_run
//! use armulet::{stdlib, Cpu, Exception};
//!
//! let mut cpu = Cpu::new_from_elf("guest.elf").unwrap();
//! stdlib::install_stdlib_hooks(&mut cpu);
//! cpu.prepare_main(&["guest"]).unwrap();
//! match cpu.run() {
//!     Err(Exception::Exit) => println!("guest exited with {}", cpu.reg(0)),
//!     other => println!("stopped: {other:?}"),
//! }
//! ```

pub mod cpu;
pub mod elf;
pub mod hooks;
pub mod inst;
pub mod memory;
pub mod stdlib;
pub mod watch;

pub use cpu::{Condition, Cpu, Exception, Stop};
pub use elf::LoadError;
pub use hooks::{HookContext, HookError, HookFn};
pub use memory::{Access, MapError, MemoryMap, Segment, SegmentId, SegmentKind};
pub use watch::{WatchFn, WatchId, Watchpoint, When};
