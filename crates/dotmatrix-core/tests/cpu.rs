//! CPU-level behavior driven through whole-machine programs.

mod common;

use common::{build_rom, build_rom_sections, cycles_of_next, machine_with, machine_with_rom, run};
use dotmatrix_core::machine::CrashReason;

#[test]
fn post_boot_register_file() {
    let m = machine_with_rom(build_rom(&[0x76]));
    assert_eq!(m.cpu.af(), 0x01B0);
    assert_eq!(m.cpu.bc(), 0x0013);
    assert_eq!(m.cpu.de(), 0x00D8);
    assert_eq!(m.cpu.hl(), 0x014D);
    assert_eq!(m.cpu.sp, 0xFFFE);
    assert_eq!(m.cpu.pc, 0x0100);
}

#[test]
fn flag_low_nibble_always_zero() {
    // A spread of ALU/flag traffic, including POP AF with a dirty stack.
    let mut m = machine_with(&[
        0x3E, 0x0F, // LD A,0F
        0xC6, 0x01, // ADD A,01 (half carry)
        0xC6, 0xF0, // ADD A,F0 (carry)
        0xF5, // PUSH AF
        0xC1, // POP BC
        0x0E, 0xFF, // LD C,FF
        0xC5, // PUSH BC
        0xF1, // POP AF  <- F loaded from 0xFF on the stack
        0x27, // DAA
        0x37, // SCF
        0x3F, // CCF
        0x2F, // CPL
        0x76, // HALT
    ]);
    for _ in 0..64 {
        m.step();
        assert_eq!(m.cpu.f & 0x0F, 0, "low F bits must stay clear");
    }
}

#[test]
fn instruction_cycle_counts() {
    // (program, instructions to skip, expected T-cycles of the next one)
    let cases: &[(&[u8], usize, u64)] = &[
        (&[0x00], 0, 4),                                   // NOP
        (&[0x3E, 0x11], 0, 8),                             // LD A,d8
        (&[0x01, 0x34, 0x12], 0, 12),                      // LD BC,d16
        (&[0x21, 0x00, 0xC0, 0x77], 1, 8),                 // LD (HL),A
        (&[0x21, 0x00, 0xC0, 0x34], 1, 12),                // INC (HL)
        (&[0x03], 0, 8),                                   // INC BC
        (&[0x09], 0, 8),                                   // ADD HL,BC
        (&[0xC3, 0x00, 0x02], 0, 16),                      // JP a16
        (&[0xE9], 0, 4),                                   // JP HL
        (&[0x18, 0x00], 0, 12),                            // JR (taken)
        (&[0xAF, 0x28, 0x00], 1, 12),                      // JR Z, taken after XOR A
        (&[0xAF, 0x20, 0x00], 1, 8),                       // JR NZ, not taken
        (&[0xCD, 0x00, 0x02], 0, 24),                      // CALL
        (&[0xC5], 0, 16),                                  // PUSH BC
        (&[0xC5, 0xC1], 1, 12),                            // POP BC
        (&[0xC5, 0xC9], 1, 16),                            // RET (to pushed BC)
        (&[0xAF, 0xC8], 1, 20),                            // RET Z taken
        (&[0xAF, 0xC0], 1, 8),                             // RET NZ not taken
        (&[0xC7], 0, 16),                                  // RST 00
        (&[0xE0, 0x80], 0, 12),                            // LDH (a8),A
        (&[0xF0, 0x80], 0, 12),                            // LDH A,(a8)
        (&[0xE2], 0, 8),                                   // LD (FF00+C),A
        (&[0xEA, 0x00, 0xC0], 0, 16),                      // LD (a16),A
        (&[0xFA, 0x00, 0xC0], 0, 16),                      // LD A,(a16)
        (&[0x08, 0x00, 0xC0], 0, 20),                      // LD (a16),SP
        (&[0xE8, 0x01], 0, 16),                            // ADD SP,i8
        (&[0xF8, 0x01], 0, 12),                            // LD HL,SP+i8
        (&[0xF9], 0, 8),                                   // LD SP,HL
        (&[0xCB, 0x11], 0, 8),                             // RL C
        (&[0x21, 0x00, 0xC0, 0xCB, 0x46], 1, 12),          // BIT 0,(HL)
        (&[0x21, 0x00, 0xC0, 0xCB, 0xC6], 1, 16),          // SET 0,(HL)
        (&[0x10, 0x00], 0, 8),                             // STOP
        (&[0xFB], 0, 4),                                   // EI
        (&[0xF3], 0, 4),                                   // DI
    ];
    for &(program, skip, expected) in cases {
        let mut m = machine_with(program);
        for _ in 0..skip {
            m.step();
        }
        let got = cycles_of_next(&mut m);
        assert_eq!(
            got, expected,
            "instruction {skip} of {program:02X?} took {got} T, want {expected}"
        );
    }
}

#[test]
fn daa_after_bcd_addition() {
    // 0x19 + 0x28 = BCD 47.
    let mut m = machine_with(&[
        0x3E, 0x19, // LD A,19
        0xC6, 0x28, // ADD A,28
        0x27, // DAA
        0x76,
    ]);
    run(&mut m, 8);
    assert_eq!(m.cpu.a, 0x47);
    assert_eq!(m.cpu.f & 0x40, 0, "N clear after additive DAA");
}

#[test]
fn daa_after_bcd_subtraction() {
    // BCD 41 - 13 = 28.
    let mut m = machine_with(&[
        0x3E, 0x41, // LD A,41
        0xD6, 0x13, // SUB 13
        0x27, // DAA
        0x76,
    ]);
    run(&mut m, 8);
    assert_eq!(m.cpu.a, 0x28);
}

#[test]
fn daa_zero_result_sets_z_only_with_carry() {
    // 0x99 + 0x01 -> BCD 00 with carry: A=0, F = Z|C.
    let mut m = machine_with(&[
        0x3E, 0x99, // LD A,99
        0xC6, 0x01, // ADD A,01
        0x27, // DAA
        0x76,
    ]);
    run(&mut m, 8);
    assert_eq!(m.cpu.a, 0x00);
    assert_eq!(m.cpu.f, 0x90, "Z and C after BCD wrap");
}

#[test]
fn add_hl_keeps_z_sets_hc_from_bits_11_15() {
    let mut m = machine_with(&[
        0xAF, // XOR A (Z set)
        0x21, 0xFF, 0x0F, // LD HL,0FFF
        0x01, 0x01, 0x00, // LD BC,0001
        0x09, // ADD HL,BC -> H from bit 11
        0x76,
    ]);
    run(&mut m, 8);
    assert_eq!(m.cpu.hl(), 0x1000);
    assert_eq!(m.cpu.f & 0x80, 0x80, "Z untouched");
    assert_eq!(m.cpu.f & 0x20, 0x20, "H from bit-11 carry");
    assert_eq!(m.cpu.f & 0x10, 0, "no bit-15 carry");
}

#[test]
fn add_sp_i8_flags_from_low_byte() {
    let mut m = machine_with(&[
        0x31, 0xFF, 0x00, // LD SP,00FF
        0xE8, 0x01, // ADD SP,1
        0x76,
    ]);
    run(&mut m, 8);
    assert_eq!(m.cpu.sp, 0x0100);
    assert_eq!(m.cpu.f, 0x30, "H and C from the low-byte add, Z always clear");
}

#[test]
fn ei_takes_effect_after_next_instruction() {
    // IF and IE both request VBLANK before EI; the interrupt must not fire
    // until one instruction after EI.
    let mut m = machine_with(&[
        0x3E, 0x01, // LD A,01
        0xE0, 0xFF, // LDH (FFFF),A  IE=VBLANK
        0xE0, 0x0F, // LDH (FF0F),A  IF=VBLANK
        0xFB, // EI
        0x04, // INC B   <- boundary where IME lands
        0x05, // DEC B   <- never reached before dispatch
        0x76,
    ]);
    run(&mut m, 4); // through EI
    assert!(!m.cpu.ime);
    m.step(); // INC B executes, IME turns on, dispatch happens at its boundary
    assert_eq!(m.cpu.b, 0x01);
    assert_eq!(m.cpu.pc, 0x0040, "jumped to the VBLANK vector");
    assert!(!m.cpu.ime, "IME cleared by dispatch");
}

#[test]
fn ei_di_leaves_interrupts_disabled() {
    let mut m = machine_with(&[
        0x3E, 0x04, // LD A,04
        0xE0, 0xFF, // IE = TIMER
        0xE0, 0x0F, // IF = TIMER
        0xFB, // EI
        0xF3, // DI cancels the pending enable
        0x00, // NOP
        0x3E, 0x01, // LD A,01
        0xEA, 0x00, 0xC0, // LD (C000),A
        0xAF, // XOR A
        0xE0, 0x0F, // clear IF
        0x76, // HALT
    ]);
    run(&mut m, 64);
    assert_eq!(m.bus.wram[0], 0x01, "main line ran to completion");
    assert!(!m.cpu.ime);
    assert_ne!(m.cpu.pc, 0x0050, "timer vector never entered");
}

#[test]
fn halt_resumes_on_interrupt_and_services_it() {
    let isr = [
        0x3E, 0x01, // LD A,01
        0xE0, 0x80, // LDH (FF80),A
        0xD9, // RETI
    ];
    let main = [
        0x3E, 0x05, // LD A,05
        0xE0, 0x07, // TAC: enabled, 16 T/tick
        0xAF, // XOR A
        0xE0, 0x06, // TMA=0
        0xE0, 0x0F, // IF=0
        0x3E, 0x04, // LD A,04
        0xE0, 0xFF, // IE=TIMER
        0xFB, // EI
        0x76, // HALT until TIMA overflow
        0xF3, // DI
        0xAF, // XOR A
        0xE0, 0x07, // TAC off
        0xE0, 0xFF, // IE=0
        0xE0, 0x0F, // IF=0
        0x76, // final HALT
    ];
    let rom = build_rom_sections(0x00, 0x00, 0x00, &[(0x0150, &main), (0x0050, &isr)]);
    let mut m = machine_with_rom(rom);
    run(&mut m, 50_000);
    assert!(m.cpu.halted);
    assert_eq!(m.bus.hram[0], 0x01, "timer ISR ran");
}

#[test]
fn halt_bug_duplicates_following_byte() {
    let mut m = machine_with(&[
        0x3E, 0x04, // LD A,04
        0xE0, 0x0F, // IF = TIMER
        0xE0, 0xFF, // IE = TIMER (IME off -> bug armed)
        0xAF, // XOR A
        0x76, // HALT
        0x3C, // INC A  <- fetched twice
        0xEA, 0x00, 0xC0, // LD (C000),A
        0xAF, // XOR A
        0xE0, 0x0F, // clear IF
        0x76, // clean HALT
    ]);
    run(&mut m, 64);
    assert_eq!(m.bus.wram[0], 0x02, "INC A must run twice");
    assert!(m.cpu.halted);
}

#[test]
fn stop_is_two_byte_nop_that_resets_div() {
    let mut m = machine_with(&[
        0x10, 0x00, // STOP
        0xF0, 0x04, // LDH A,(FF04)
        0xEA, 0x00, 0xC0, // LD (C000),A
        0x76,
    ]);
    run(&mut m, 8);
    assert!(m.cpu.halted, "execution continued past STOP");
    assert_eq!(m.bus.wram[0], 0, "DIV read right after STOP is 0");
}

#[test]
fn illegal_opcode_locks_the_machine() {
    let mut m = machine_with(&[0x00, 0xD3]);
    m.step();
    assert!(m.crash_reason().is_none());
    m.step();
    assert_eq!(
        m.crash_reason(),
        Some(CrashReason::IllegalOpcode {
            opcode: 0xD3,
            pc: 0x0151
        })
    );
    // State stays inspectable and frozen.
    let pc = m.cpu.pc;
    let cycles = m.bus.t_cycles;
    m.step();
    assert_eq!(m.cpu.pc, pc);
    assert_eq!(m.bus.t_cycles, cycles);
    // run_frame returns instead of hanging.
    let _ = m.run_frame();
}

#[test]
fn interrupt_dispatch_costs_five_m_cycles() {
    let mut m = machine_with(&[
        0x3E, 0x01, // LD A,01
        0xE0, 0xFF, // IE=VBLANK
        0xE0, 0x0F, // IF=VBLANK
        0xFB, // EI
        0x00, // NOP (IME lands after this)
        0x00,
    ]);
    run(&mut m, 4);
    let before = m.bus.t_cycles;
    m.step(); // NOP (4 T) + dispatch (20 T)
    assert_eq!(m.bus.t_cycles - before, 24);
    assert_eq!(m.cpu.pc, 0x0040);
}
