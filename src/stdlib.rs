//! Host re-implementations of common libc entry points
//!
//! [`install_stdlib_hooks`] overrides the dynamic symbols a typical
//! ARM/Linux executable imports, so small programs run without any guest
//! libc at all. The pack is illustrative rather than exhaustive: enough of
//! the C library to get `_start`-to-`exit` programs doing real work, every
//! guest pointer checked through the memory map before the host touches it.
//!
//! The `printf`-family interpreter understands the conversion characters
//! (`%s %d %i %u %x %X %o %p %c`), not width or precision modifiers, and
//! soft-float arguments are printed as their raw register words.

use crate::cpu::{Cpu, Exception};
use crate::hooks::{HookContext, HookFn};
use crate::memory::{Access, Segment, SegmentId, SegmentKind};
use log::{debug, error, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::rc::Rc;

// Guest errno values (ARM EABI Linux).
const ENOENT: u32 = 2;
const EIO: u32 = 5;
const EBADF: u32 = 9;
const ENOMEM: u32 = 12;
const EACCES: u32 = 13;
const EFAULT: u32 = 14;

// open(2) flag bits the fd table honors.
const O_ACCMODE: u32 = 3;
const O_WRONLY: u32 = 1;
const O_RDWR: u32 = 2;
const O_CREAT: u32 = 0o100;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

/// Host files opened on the guest's behalf, keyed by guest fd
struct HostFiles {
    next_fd: i32,
    open: HashMap<i32, File>,
}

impl HostFiles {
    fn new() -> Self {
        Self {
            next_fd: 3,
            open: HashMap::new(),
        }
    }
}

fn io_errno(error: &std::io::Error) -> u32 {
    match error.kind() {
        std::io::ErrorKind::NotFound => ENOENT,
        std::io::ErrorKind::PermissionDenied => EACCES,
        _ => EIO,
    }
}

/// Fetches a varargs-style argument: r0–r3, then the stack
fn vararg(cpu: &Cpu, index: usize) -> Result<u32, Exception> {
    if index < 4 {
        Ok(cpu.reg(index))
    } else {
        cpu.read_u32(cpu.sp().wrapping_add(((index - 4) * 4) as u32))
    }
}

/// Interprets a guest format string, pulling arguments from `first_arg` on
fn format_stream(
    cpu: &Cpu,
    fmt_va: u32,
    first_arg: usize,
    out: &mut dyn Write,
) -> Result<(), Exception> {
    const CONVERSIONS: &[u8] = b"%sdiufgxXopc";

    let fmt = cpu.read_cstring(fmt_va)?;
    let mut arg = first_arg;
    let mut i = 0;
    while i < fmt.len() {
        if fmt[i] != b'%' {
            let _ = out.write_all(&fmt[i..=i]);
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < fmt.len() && !CONVERSIONS.contains(&fmt[j]) {
            j += 1;
        }
        let Some(&conversion) = fmt.get(j) else {
            let _ = out.write_all(&fmt[i..]);
            break;
        };
        match conversion {
            b'%' => {
                let _ = out.write_all(b"%");
            }
            b's' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let text = cpu.read_cstring(value)?;
                let _ = out.write_all(&text);
            }
            b'c' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{}", (value as u8) as char);
            }
            b'd' | b'i' => {
                let value = vararg(cpu, arg)? as i32;
                arg += 1;
                let _ = write!(out, "{value}");
            }
            b'x' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{value:x}");
            }
            b'X' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{value:X}");
            }
            b'o' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{value:o}");
            }
            b'p' => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{value:#x}");
            }
            // 'u', and the float conversions we render as raw words
            _ => {
                let value = vararg(cpu, arg)?;
                arg += 1;
                let _ = write!(out, "{value}");
            }
        }
        i = j + 1;
    }
    let _ = out.flush();
    Ok(())
}

fn hook(f: impl Fn(&mut Cpu, &HookContext) -> Result<(), Exception> + 'static) -> HookFn {
    Rc::new(f)
}

/// Finds the heap segment starting exactly at `addr`
fn heap_segment_at(cpu: &Cpu, addr: u32) -> Option<SegmentId> {
    cpu.memory()
        .segments()
        .find(|(_, segment)| segment.virt() == addr && segment.kind() == SegmentKind::Heap)
        .map(|(id, _)| id)
}

/// Overrides every libc symbol the pack covers
///
/// Symbols the executable does not import are skipped silently, so the pack
/// can be installed unconditionally after [`Cpu::new_from_elf`].
pub fn install_stdlib_hooks(cpu: &mut Cpu) {
    let files = Rc::new(RefCell::new(HostFiles::new()));

    let mut install = |name: &str, callback: HookFn| {
        if cpu.override_symbol(name, callback).is_ok() {
            trace!("stdlib hook installed: {name}");
        }
    };

    install(
        "memcpy",
        hook(|cpu, _| {
            let len = cpu.reg(2);
            let data = cpu.read_bytes(cpu.reg(1), len)?.to_vec();
            cpu.write_bytes(cpu.reg(0), &data)?;
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "memmove",
        hook(|cpu, _| {
            // The intermediate copy makes overlap a non-issue.
            let len = cpu.reg(2);
            let data = cpu.read_bytes(cpu.reg(1), len)?.to_vec();
            cpu.write_bytes(cpu.reg(0), &data)?;
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "memset",
        hook(|cpu, _| {
            let fill = cpu.reg(1) as u8;
            let len = cpu.reg(2);
            let dst = cpu.reg(0);
            let host = cpu
                .memory_mut()
                .translate_mut(dst, len, Access::RW)
                .ok_or(Exception::DataAbort)?;
            host.fill(fill);
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "strncmp",
        hook(|cpu, _| {
            let a = cpu.read_cstring(cpu.reg(0))?;
            let b = cpu.read_cstring(cpu.reg(1))?;
            let n = cpu.reg(2) as usize;
            let mut result = 0i32;
            for i in 0..n {
                let ca = a.get(i).copied().unwrap_or(0);
                let cb = b.get(i).copied().unwrap_or(0);
                if ca != cb {
                    result = i32::from(ca) - i32::from(cb);
                    break;
                }
                if ca == 0 {
                    break;
                }
            }
            cpu.set_reg(0, result as u32);
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "strrchr",
        hook(|cpu, _| {
            let base = cpu.reg(0);
            let haystack = cpu.read_cstring(base)?;
            let needle = cpu.reg(1) as u8;
            let found = if needle == 0 {
                Some(haystack.len())
            } else {
                haystack.iter().rposition(|&byte| byte == needle)
            };
            cpu.set_reg(0, found.map_or(0, |index| base + index as u32));
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "strlen",
        hook(|cpu, _| {
            let len = cpu.read_cstring(cpu.reg(0))?.len() as u32;
            cpu.set_reg(0, len);
            cpu.ret();
            Ok(())
        }),
    );

    install(
        "malloc",
        hook(|cpu, _| {
            let size = cpu.reg(0);
            let allocated = cpu.find_free_region(size, 16).and_then(|va| {
                let segment = Segment::anonymous(va, size.max(1), Access::RW, SegmentKind::Heap);
                cpu.add_segment(segment).ok().map(|_| va)
            });
            match allocated {
                Some(va) => {
                    debug!("malloc: {size} bytes at {va:#010x}");
                    cpu.set_reg(0, va);
                }
                None => {
                    debug!("malloc: address space exhausted");
                    cpu.set_guest_errno(ENOMEM);
                    cpu.set_reg(0, 0);
                }
            }
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "free",
        hook(|cpu, _| {
            let addr = cpu.reg(0);
            if addr == 0 {
                cpu.ret();
                return Ok(());
            }
            match heap_segment_at(cpu, addr) {
                Some(id) => {
                    cpu.remove_segment(id);
                    cpu.ret();
                    Ok(())
                }
                None => {
                    error!("free: {addr:#010x} is not an allocated block");
                    Err(Exception::DataAbort)
                }
            }
        }),
    );

    let open_files = Rc::clone(&files);
    install(
        "open64",
        hook(move |cpu, _| {
            let path = cpu.read_cstring_lossy(cpu.reg(0))?;
            let flags = cpu.reg(1);
            debug!("open64: \"{path}\" flags {flags:#o}");

            let mut options = OpenOptions::new();
            let accmode = flags & O_ACCMODE;
            options
                .read(accmode != O_WRONLY)
                .write(accmode == O_WRONLY || accmode == O_RDWR)
                .create(flags & O_CREAT != 0)
                .truncate(flags & O_TRUNC != 0)
                .append(flags & O_APPEND != 0);

            match options.open(&path) {
                Ok(file) => {
                    let mut table = open_files.borrow_mut();
                    let fd = table.next_fd;
                    table.next_fd += 1;
                    table.open.insert(fd, file);
                    cpu.set_reg(0, fd as u32);
                }
                Err(err) => {
                    cpu.set_guest_errno(io_errno(&err));
                    cpu.set_reg(0, -1i32 as u32);
                }
            }
            cpu.ret();
            Ok(())
        }),
    );

    let read_files = Rc::clone(&files);
    install(
        "read",
        hook(move |cpu, _| {
            let fd = cpu.reg(0) as i32;
            let buf_va = cpu.reg(1);
            let len = cpu.reg(2);
            // The destination has to be writable before the host reads a
            // single byte.
            if cpu.memory().translate(buf_va, len, Access::RW).is_none() {
                cpu.set_guest_errno(EFAULT);
                cpu.set_reg(0, -1i32 as u32);
                cpu.ret();
                return Ok(());
            }
            let mut buffer = vec![0u8; len as usize];
            let result = match fd {
                0 => std::io::stdin().read(&mut buffer),
                _ => match read_files.borrow_mut().open.get_mut(&fd) {
                    Some(file) => file.read(&mut buffer),
                    None => {
                        cpu.set_guest_errno(EBADF);
                        cpu.set_reg(0, -1i32 as u32);
                        cpu.ret();
                        return Ok(());
                    }
                },
            };
            match result {
                Ok(count) => {
                    cpu.write_bytes(buf_va, &buffer[..count])?;
                    cpu.set_reg(0, count as u32);
                }
                Err(err) => {
                    cpu.set_guest_errno(io_errno(&err));
                    cpu.set_reg(0, -1i32 as u32);
                }
            }
            cpu.ret();
            Ok(())
        }),
    );

    let write_files = Rc::clone(&files);
    install(
        "write",
        hook(move |cpu, _| {
            let fd = cpu.reg(0) as i32;
            let len = cpu.reg(2);
            let Ok(data) = cpu.read_bytes(cpu.reg(1), len) else {
                cpu.set_guest_errno(EFAULT);
                cpu.set_reg(0, -1i32 as u32);
                cpu.ret();
                return Ok(());
            };
            let data = data.to_vec();
            let result = match fd {
                1 => std::io::stdout().write(&data),
                2 => std::io::stderr().write(&data),
                _ => match write_files.borrow_mut().open.get_mut(&fd) {
                    Some(file) => file.write(&data),
                    None => {
                        cpu.set_guest_errno(EBADF);
                        cpu.set_reg(0, -1i32 as u32);
                        cpu.ret();
                        return Ok(());
                    }
                },
            };
            match result {
                Ok(count) => cpu.set_reg(0, count as u32),
                Err(err) => {
                    cpu.set_guest_errno(io_errno(&err));
                    cpu.set_reg(0, -1i32 as u32);
                }
            }
            cpu.ret();
            Ok(())
        }),
    );

    let close_files = Rc::clone(&files);
    install(
        "close",
        hook(move |cpu, _| {
            let fd = cpu.reg(0) as i32;
            let removed = close_files.borrow_mut().open.remove(&fd).is_some();
            if removed || (0..=2).contains(&fd) {
                cpu.set_reg(0, 0);
            } else {
                cpu.set_guest_errno(EBADF);
                cpu.set_reg(0, -1i32 as u32);
            }
            cpu.ret();
            Ok(())
        }),
    );

    install(
        "fputs_unlocked",
        hook(|cpu, _| {
            let text = cpu.read_cstring(cpu.reg(0))?;
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&text);
            let _ = stdout.flush();
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "fwrite",
        hook(|cpu, _| {
            let size = cpu.reg(1);
            let count = cpu.reg(2);
            let total = size.checked_mul(count).ok_or(Exception::DataAbort)?;
            let data = cpu.read_bytes(cpu.reg(0), total)?.to_vec();
            // The guest FILE* in r3 is opaque to the host; the stream is
            // assumed to be stdout.
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&data);
            let _ = stdout.flush();
            cpu.set_reg(0, count);
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "__printf_chk",
        hook(|cpu, _| {
            // (flag, format, ...): varargs start at r2.
            format_stream(cpu, cpu.reg(1), 2, &mut std::io::stdout())?;
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "__fprintf_chk",
        hook(|cpu, _| {
            // (stream, flag, format, ...): the guest stream is opaque, so
            // output lands on stdout.
            format_stream(cpu, cpu.reg(2), 3, &mut std::io::stdout())?;
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "error",
        hook(|cpu, _| {
            // (status, errnum, format, ...): varargs start at r3. The
            // trailing message renders the emulated errno cell.
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "error: ");
            format_stream(cpu, cpu.reg(2), 3, &mut stderr)?;
            let errno = cpu
                .guest_errno_va()
                .and_then(|va| cpu.read_u32(va).ok())
                .unwrap_or(0);
            let _ = writeln!(
                stderr,
                ": {}",
                std::io::Error::from_raw_os_error(errno as i32)
            );
            let _ = stderr.flush();
            if cpu.reg(0) != 0 {
                // A nonzero status terminates the program, as exit would.
                return Err(Exception::Exit);
            }
            cpu.ret();
            Ok(())
        }),
    );

    install(
        "exit",
        hook(|cpu, _| {
            debug!("guest exit with status {}", cpu.reg(0));
            Err(Exception::Exit)
        }),
    );
    install(
        "__libc_start_main",
        hook(|cpu, _| {
            // (main, argc, argv, ...): tail-jump into main with its
            // arguments in place; no simulated return.
            debug!(
                "__libc_start_main: main={:#010x} argc={}",
                cpu.reg(0),
                cpu.reg(1)
            );
            let main = cpu.reg(0);
            cpu.set_reg(0, cpu.reg(1));
            cpu.set_reg(1, cpu.reg(2));
            cpu.jump(main);
            Ok(())
        }),
    );
    install(
        "__cxa_atexit",
        hook(|cpu, _| {
            debug!("__cxa_atexit: handler {:#010x} recorded nowhere", cpu.reg(0));
            cpu.set_reg(0, 0);
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "__errno_location",
        hook(|cpu, _| {
            cpu.set_reg(0, cpu.guest_errno_va().unwrap_or(0));
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "getpagesize",
        hook(|cpu, _| {
            cpu.set_reg(0, 4096);
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "posix_fadvise64",
        hook(|cpu, _| {
            // Access-pattern advice has nothing to act on here.
            debug!(
                "posix_fadvise64: fd {} offset {:#x} len {} advice {}",
                cpu.reg(0),
                cpu.reg(1),
                cpu.reg(2),
                cpu.reg(3),
            );
            cpu.set_reg(0, 0);
            cpu.ret();
            Ok(())
        }),
    );

    let last_locale = Rc::new(RefCell::new(0u32));
    install(
        "setlocale",
        hook(move |cpu, _| {
            let requested = cpu.reg(1);
            if requested == 0 {
                cpu.set_reg(0, *last_locale.borrow());
            } else {
                let locale = cpu.read_cstring_lossy(requested)?;
                debug!("setlocale: category {} to \"{locale}\"", cpu.reg(0));
                *last_locale.borrow_mut() = requested;
                cpu.set_reg(0, requested);
            }
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "textdomain",
        hook(|cpu, _| {
            let domain = cpu.read_cstring_lossy(cpu.reg(0))?;
            debug!("textdomain: \"{domain}\"");
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "bindtextdomain",
        hook(|cpu, _| {
            let domain = cpu.read_cstring_lossy(cpu.reg(0))?;
            let dir = cpu.read_cstring_lossy(cpu.reg(1))?;
            debug!("bindtextdomain: \"{domain}\" under \"{dir}\"");
            cpu.ret();
            Ok(())
        }),
    );
    install(
        "dcgettext",
        hook(|cpu, _| {
            // Translation is the identity; hand the msgid pointer back.
            cpu.set_reg(0, cpu.reg(1));
            cpu.ret();
            Ok(())
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vararg_spills_to_the_stack() {
        let mut cpu = Cpu::new();
        for index in 0..4 {
            cpu.set_reg(index, 10 + index as u32);
        }
        let sp = cpu.sp() - 8;
        cpu.set_reg(crate::cpu::SP, sp);
        cpu.write_u32(sp, 0xaa).unwrap();
        cpu.write_u32(sp + 4, 0xbb).unwrap();

        assert_eq!(vararg(&cpu, 0), Ok(10));
        assert_eq!(vararg(&cpu, 3), Ok(13));
        assert_eq!(vararg(&cpu, 4), Ok(0xaa));
        assert_eq!(vararg(&cpu, 5), Ok(0xbb));
    }

    #[test]
    fn format_stream_interpolates_guest_strings() {
        let mut cpu = Cpu::new();
        let text_va = cpu.map_ro_buffer(b"world\0").unwrap();
        let fmt_va = cpu.map_ro_buffer(b"hello %s: %d/%x%%\0").unwrap();
        cpu.set_reg(2, text_va);
        cpu.set_reg(3, -5i32 as u32);
        let sp = cpu.sp() - 4;
        cpu.set_reg(crate::cpu::SP, sp);
        cpu.write_u32(sp, 0xbeef).unwrap();

        let mut out = Vec::new();
        format_stream(&cpu, fmt_va, 2, &mut out).unwrap();
        assert_eq!(out, b"hello world: -5/beef%");
    }

    #[test]
    fn format_stream_reports_bad_pointers() {
        let cpu = Cpu::new();
        assert_eq!(
            format_stream(&cpu, 0x10, 2, &mut Vec::new()),
            Err(Exception::DataAbort)
        );
    }
}
