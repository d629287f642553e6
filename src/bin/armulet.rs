//! Command-line runner: load an ARM ELF, hook libc, run it

use armulet::{stdlib, Cpu, Exception, Stop, When};
use clap::Parser;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "armulet", about = "Run 32-bit ARM executables in user space")]
struct Args {
    /// The ARM ELF executable to load
    elf: PathBuf,

    /// Arguments handed to the guest program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    guest_args: Vec<String>,

    /// Raise verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the address of every executed instruction
    #[arg(long)]
    trace_steps: bool,

    /// Call this debug symbol via the sentinel page instead of running
    /// from the entry point
    #[arg(long, value_name = "SYMBOL")]
    call: Option<String>,
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let tag = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn ",
            Level::Info => "info ",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        eprintln!("[{tag}] {}", record.args());
    }

    fn flush(&self) {}
}

fn print_segment_map(cpu: &Cpu) {
    for (index, (_, segment)) in cpu.memory().segments().enumerate() {
        log::info!(
            "{}. {:#010x}-{:#010x} {:?}",
            index + 1,
            segment.virt(),
            segment.end(),
            segment.kind(),
        );
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    log::set_logger(&LOGGER).expect("no other logger is installed");
    log::set_max_level(match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    let mut cpu = match Cpu::new_from_elf(&args.elf) {
        Ok(cpu) => cpu,
        Err(err) => {
            eprintln!("armulet: cannot load {}: {err}", args.elf.display());
            return ExitCode::FAILURE;
        }
    };

    stdlib::install_stdlib_hooks(&mut cpu);

    let program = args.elf.display().to_string();
    let mut argv: Vec<&str> = vec![&program];
    argv.extend(args.guest_args.iter().map(String::as_str));
    if let Err(err) = cpu.prepare_main(&argv) {
        eprintln!("armulet: cannot prepare the guest stack: {err}");
        return ExitCode::FAILURE;
    }

    print_segment_map(&cpu);

    if args.trace_steps {
        cpu.watch_step(
            "trace",
            When::Pre,
            Some(Rc::new(|cpu: &mut Cpu, _| {
                // r15 carries fetch + 8 while the instruction runs.
                eprintln!("{:#010x}", cpu.pc().wrapping_sub(8));
                false
            })),
        );
    }

    let outcome = match &args.call {
        Some(symbol) => match cpu.resolve_debug_symbol(symbol) {
            Some(addr) => cpu.callproc(addr),
            None => {
                eprintln!("armulet: no debug symbol named {symbol}");
                return ExitCode::FAILURE;
            }
        },
        None => cpu.run(),
    };

    match outcome {
        Ok(Stop::Sentinel) => {
            log::info!("guest returned {:#x}", cpu.reg(0));
            ExitCode::SUCCESS
        }
        Ok(Stop::Watchpoint) => {
            eprintln!("armulet: halted by a watchpoint at {:#010x}", cpu.pc());
            ExitCode::SUCCESS
        }
        Err(Exception::Exit) => ExitCode::from(cpu.reg(0) as u8),
        Err(exception) => {
            eprintln!(
                "armulet: {exception} at {:#010x} (next {:#010x})",
                cpu.pc(),
                cpu.next_pc(),
            );
            ExitCode::FAILURE
        }
    }
}
