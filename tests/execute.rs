//! End-to-end tests driving the fetch/execute loop through the public API

use armulet::cpu::{LR, SP, VDSO_BASE};
use armulet::{Access, Cpu, Exception, Segment, SegmentKind, Stop, When};
use std::cell::Cell;
use std::rc::Rc;

const SENTINEL: u32 = 0xefff_ffff;

/// Maps `words` as executable code at `base`
fn load_words(cpu: &mut Cpu, base: u32, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    cpu.add_segment(Segment::new(base, bytes, Access::RX, SegmentKind::Buffer))
        .unwrap();
}

/// Maps `words` (with a sentinel appended) at 0x1000 and points the CPU there
fn cpu_with_program(words: &[u32]) -> Cpu {
    let mut cpu = Cpu::new();
    let mut program = words.to_vec();
    program.push(SENTINEL);
    load_words(&mut cpu, 0x1000, &program);
    cpu.jump(0x1000);
    cpu
}

#[test]
fn mov_writes_the_register_and_advances() {
    // MOV r0, #5 from 0x1000
    let mut cpu = cpu_with_program(&[0xe3a0_0005]);
    let flags_before = cpu.cpsr();

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 5);
    assert_eq!(cpu.cpsr(), flags_before);
    assert_eq!(cpu.next_pc(), 0x1004, "stopped on the sentinel word");
}

#[test]
fn failed_condition_skips_the_instruction() {
    // MOVNE r0, #1 with Z set
    let mut cpu = cpu_with_program(&[0x13a0_0001]);
    cpu.set_cpsr(cpu.cpsr().with_z(true));

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 0);
}

#[test]
fn compare_then_conditional_moves() {
    // CMP r1, #5; MOVEQ r0, #1; MOVNE r0, #2
    let mut cpu = cpu_with_program(&[0xe351_0005, 0x03a0_0001, 0x13a0_0002]);
    cpu.set_reg(1, 5);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 1);

    let mut cpu = cpu_with_program(&[0xe351_0005, 0x03a0_0001, 0x13a0_0002]);
    cpu.set_reg(1, 6);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 2);
}

#[test]
fn visible_pc_reads_fetch_plus_eight() {
    // MOV r0, pc at 0x1000
    let mut cpu = cpu_with_program(&[0xe1a0_000f]);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 0x1008);
}

#[test]
fn pc_relative_load_reaches_the_literal_pool() {
    // LDR r0, [pc, #4]: address = 0x1008 + 4 = 0x100c
    let mut cpu = cpu_with_program(&[
        0xe59f_0004, // LDR r0, [pc, #4]
        SENTINEL,    // execution stops here
        0,           // padding
        0x1234_5678, // the literal at 0x100c
    ]);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 0x1234_5678);
    assert_eq!(cpu.next_pc(), 0x1004);
}

#[test]
fn push_then_pop_restores_values_and_stack() {
    let mut cpu = cpu_with_program(&[
        0xe92d_000f, // STMDB sp!, {r0-r3}
        0xe8bd_00f0, // LDMIA sp!, {r4-r7}
    ]);
    cpu.add_segment(Segment::anonymous(
        0x4000,
        0x100,
        Access::RW,
        SegmentKind::Buffer,
    ))
    .unwrap();
    cpu.set_reg(SP, 0x4010);
    for (reg, value) in (0..4).zip(1u32..) {
        cpu.set_reg(reg, value);
    }

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(SP), 0x4010);
    assert_eq!(
        (cpu.reg(4), cpu.reg(5), cpu.reg(6), cpu.reg(7)),
        (1, 2, 3, 4)
    );
}

#[test]
fn branch_link_and_exchange_round_trip() {
    let mut cpu = Cpu::new();
    load_words(
        &mut cpu,
        0x1000,
        &[
            0xeb00_0000, // 0x1000: BL 0x1008
            SENTINEL,    // 0x1004: where BX lr lands
            0xe12f_ff1e, // 0x1008: BX lr
        ],
    );
    cpu.jump(0x1000);

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(LR), 0x1004);
    assert_eq!(cpu.next_pc(), 0x1004);
}

#[test]
fn callproc_exits_through_the_sentinel_page() {
    // A function that immediately returns
    let mut cpu = Cpu::new();
    load_words(&mut cpu, 0x2000, &[0xe12f_ff1e]); // BX lr

    assert_eq!(cpu.callproc(0x2000), Ok(Stop::Sentinel));
    assert_eq!(cpu.next_pc(), VDSO_BASE);
}

#[test]
fn callproc_passes_arguments_and_returns_r0() {
    // add(a, b): ADD r0, r0, r1; BX lr
    let mut cpu = Cpu::new();
    load_words(&mut cpu, 0x2000, &[0xe080_0001, 0xe12f_ff1e]);
    cpu.set_reg(0, 30);
    cpu.set_reg(1, 12);

    assert_eq!(cpu.callproc(0x2000), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 42);
}

#[test]
fn store_to_unmapped_memory_is_a_data_abort() {
    // STR r0, [r1] with r1 unmapped
    let mut cpu = cpu_with_program(&[0xe581_0000]);
    cpu.set_reg(1, 0x9999_0000);
    assert_eq!(cpu.run(), Err(Exception::DataAbort));
}

#[test]
fn an_installed_vector_swallows_the_abort() {
    let mut cpu = cpu_with_program(&[0xe581_0000]); // faulting STR, then sentinel
    cpu.set_reg(1, 0x9999_0000);
    let hits = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&hits);
    cpu.set_vector(
        Exception::DataAbort,
        Some(Rc::new(move |_cpu, _addr, _code| {
            observed.set(observed.get() + 1);
        })),
    );

    // The vector absorbs the fault and the loop carries on to the sentinel.
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(hits.get(), 1);
}

#[test]
fn fetch_from_unmapped_memory_is_a_prefetch_abort() {
    let mut cpu = Cpu::new();
    cpu.jump(0x5000_0000);
    assert_eq!(cpu.run(), Err(Exception::PrefetchAbort));
}

#[test]
fn swi_outside_the_hook_range_surfaces() {
    let mut cpu = cpu_with_program(&[0xef00_0001]); // SWI #1
    assert_eq!(cpu.run(), Err(Exception::SoftwareInterrupt));
}

#[test]
fn undefined_words_raise_undefined() {
    // A coprocessor op with no coprocessor behind it
    let mut cpu = cpu_with_program(&[0xee00_0000]);
    assert_eq!(cpu.run(), Err(Exception::Undefined));
}

#[test]
fn long_multiply_through_the_loop() {
    // UMULL r0, r1, r2, r3
    let mut cpu = cpu_with_program(&[0xe081_0392]);
    cpu.set_reg(2, 0x8000_0000);
    cpu.set_reg(3, 4);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!((cpu.reg(0), cpu.reg(1)), (0, 2));
}

#[test]
fn movw_movt_pair_through_the_loop() {
    // MOVW r0, #0xbeef; MOVT r0, #0xdead
    let mut cpu = cpu_with_program(&[0xe30b_0eef, 0xe34d_0ead]);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), 0xdead_beef);
}

#[test]
fn step_watchpoint_without_callback_halts() {
    let mut cpu = cpu_with_program(&[0xe3a0_0005]);
    cpu.watch_step("halt", When::Pre, None);
    assert_eq!(cpu.run(), Ok(Stop::Watchpoint));
    // The halt happened before the MOV executed, and the reported PC is
    // the halting instruction itself, not the visible fetch + 8.
    assert_eq!(cpu.reg(0), 0);
    assert_eq!(cpu.pc(), 0x1000);
}

#[test]
fn branch_watchpoint_counts_only_branches() {
    let mut cpu = cpu_with_program(&[
        0xe3a0_0001, // MOV r0, #1
        0xeaff_ffff, // B to the next instruction
        0xe3a0_0002, // MOV r0, #2
    ]);
    let branches = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&branches);
    cpu.watch_branch(
        "branches",
        When::Post,
        Some(Rc::new(move |_cpu, _id| {
            observed.set(observed.get() + 1);
            false
        })),
    );

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(branches.get(), 1);
    assert_eq!(cpu.reg(0), 2);
}

#[test]
fn register_watchpoint_sees_the_write() {
    let mut cpu = cpu_with_program(&[
        0xe3a0_1000, // MOV r1, #0 (outside the mask)
        0xe3a0_0007, // MOV r0, #7
    ]);
    let hits = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&hits);
    let id = cpu.watch_reg(
        "r0",
        0,
        When::Post,
        Some(Rc::new(move |cpu: &mut Cpu, id| {
            observed.set(observed.get() + 1);
            assert_eq!(cpu.watchpoint(id).unwrap().affected(), 1);
            false
        })),
    );

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(hits.get(), 1);
    cpu.watch_delete(id);
}

#[test]
fn memory_watchpoint_sees_the_store() {
    let mut cpu = cpu_with_program(&[
        0xe3a0_0063, // MOV r0, #99
        0xe581_0000, // STR r0, [r1]
    ]);
    cpu.add_segment(Segment::anonymous(
        0x4000,
        0x100,
        Access::RW,
        SegmentKind::Buffer,
    ))
    .unwrap();
    cpu.set_reg(1, 0x4000);

    let hits = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&hits);
    cpu.watch_memory(
        "cell",
        0x4000,
        When::Post,
        Some(Rc::new(move |_cpu, _id| {
            observed.set(observed.get() + 1);
            false
        })),
    );

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(hits.get(), 1, "only the store changed the cell");
}

#[test]
fn instruction_watchpoint_matches_under_mask() {
    let mut cpu = cpu_with_program(&[
        0xe3a0_0001, // MOV r0, #1
        0xe080_0000, // ADD r0, r0, r0
    ]);
    let hits = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&hits);
    // Match any ADD-register encoding.
    cpu.watch_inst(
        "adds",
        0xe080_0000,
        0x0ff0_0000,
        When::Pre,
        Some(Rc::new(move |_cpu, _id| {
            observed.set(observed.get() + 1);
            false
        })),
    );

    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(hits.get(), 1);
}

#[test]
fn guest_can_read_but_not_write_text() {
    let mut cpu = cpu_with_program(&[
        0xe51f_0004, // LDR r0, [pc, #-4] -> reads the sentinel word
    ]);
    assert_eq!(cpu.run(), Ok(Stop::Sentinel));
    assert_eq!(cpu.reg(0), SENTINEL, "text is readable");

    // Storing over text must abort: STR r0, [r1] with r1 -> text
    let mut cpu = cpu_with_program(&[0xe581_0000]);
    cpu.set_reg(1, 0x1000);
    assert_eq!(cpu.run(), Err(Exception::DataAbort));
}
