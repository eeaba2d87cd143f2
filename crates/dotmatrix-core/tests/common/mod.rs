//! Shared helpers: in-memory ROM assembly and run loops.
//!
//! Test programs are hand-assembled SM83 byte sequences placed at $0150 of a
//! synthesized cartridge image (the 4-byte entry point jumps there, as on
//! real carts), so no ROM binaries need to be checked in or downloaded.

use dotmatrix_core::machine::Machine;

const BANK_SIZE: usize = 0x4000;

const NINTENDO_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D,
    0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99,
    0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];

/// Build a valid ROM image with `sections` of code spliced at absolute
/// offsets. Each bank's first byte is stamped with its index so banking
/// tests can tell banks apart.
pub fn build_rom_sections(
    cart_type: u8,
    rom_code: u8,
    ram_code: u8,
    sections: &[(usize, &[u8])],
) -> Vec<u8> {
    let banks = 2usize << rom_code;
    let mut rom = vec![0u8; banks * BANK_SIZE];
    for bank in 0..banks {
        rom[bank * BANK_SIZE] = bank as u8;
    }
    rom[0x0104..0x0134].copy_from_slice(&NINTENDO_LOGO);
    rom[0x0134..0x013B].copy_from_slice(b"HARNESS");
    rom[0x0147] = cart_type;
    rom[0x0148] = rom_code;
    rom[0x0149] = ram_code;
    // Entry point: NOP; JP $0150. The logo sits right behind it, so code
    // cannot live at $0100.
    rom[0x0100..0x0104].copy_from_slice(&[0x00, 0xC3, 0x50, 0x01]);
    for &(offset, bytes) in sections {
        rom[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    rom
}

/// 32 KiB ROM-only image with `code` at $0150.
pub fn build_rom(code: &[u8]) -> Vec<u8> {
    build_rom_sections(0x00, 0x00, 0x00, &[(0x0150, code)])
}

/// Machine with `code` at $0150, already stepped past the entry stub so the
/// next instruction executed is the first byte of `code`.
pub fn machine_with(code: &[u8]) -> Machine {
    let mut machine = machine_with_rom(build_rom(code));
    machine.step(); // NOP
    machine.step(); // JP 0150
    machine
}

pub fn machine_with_rom(rom: Vec<u8>) -> Machine {
    let mut machine = Machine::new();
    machine.load_rom(rom).expect("test rom must load");
    machine
}

/// Step `steps` instructions (halted machine cycles count as one step).
/// Well-formed test programs end in a clean HALT with interrupts quiesced,
/// so running past their end is harmless.
pub fn run(machine: &mut Machine, steps: u32) {
    for _ in 0..steps {
        if machine.crash_reason().is_some() {
            return;
        }
        machine.step();
    }
}

/// T-cycles consumed by the next single instruction.
#[allow(dead_code)]
pub fn cycles_of_next(machine: &mut Machine) -> u64 {
    let before = machine.bus.t_cycles;
    machine.step();
    machine.bus.t_cycles - before
}
