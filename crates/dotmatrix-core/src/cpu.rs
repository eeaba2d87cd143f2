use crate::bus::Bus;
use crate::interrupts::Interrupts;

// Flag bits in F (gbdev.io/pandocs/CPU_Registers_and_Flags.html).
const FLAG_Z: u8 = 0x80;
const FLAG_N: u8 = 0x40;
const FLAG_H: u8 = 0x20;
const FLAG_C: u8 = 0x10;

// Post-boot register file (gbdev.io/pandocs/Power_Up_Sequence.html, DMG).
const BOOT_AF: u16 = 0x01B0;
const BOOT_BC: u16 = 0x0013;
const BOOT_DE: u16 = 0x00D8;
const BOOT_HL: u16 = 0x014D;
const BOOT_SP: u16 = 0xFFFE;
const BOOT_PC: u16 = 0x0100;

/// Encodings with no assigned instruction. Fetching one wedges the CPU.
pub const ILLEGAL_OPCODES: [u8; 11] = [
    0xD3, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD,
];

/// SM83 interpreter. Every memory access and internal delay goes through the
/// one-M-cycle helpers, so the bus (and through it the timer/PPU/APU) sees
/// traffic at the same machine cycle it happens on hardware.
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub ime: bool,
    pub halted: bool,
    /// Set when an illegal opcode was fetched; no further progress happens.
    pub locked: bool,
    /// PC frozen by the HALT bug: the next fetch does not increment PC.
    halt_bug: bool,
    /// EI takes effect one instruction late; 2 = armed, 1 = enable after this
    /// instruction.
    ime_delay: u8,
    /// Opcode that wedged the CPU, for crash reporting.
    pub locked_opcode: u8,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: (BOOT_AF >> 8) as u8,
            f: BOOT_AF as u8,
            b: (BOOT_BC >> 8) as u8,
            c: BOOT_BC as u8,
            d: (BOOT_DE >> 8) as u8,
            e: BOOT_DE as u8,
            h: (BOOT_HL >> 8) as u8,
            l: BOOT_HL as u8,
            pc: BOOT_PC,
            sp: BOOT_SP,
            ime: false,
            halted: false,
            locked: false,
            halt_bug: false,
            ime_delay: 0,
            locked_opcode: 0,
        }
    }

    pub fn bc(&self) -> u16 {
        u16::from(self.b) << 8 | u16::from(self.c)
    }

    pub fn de(&self) -> u16 {
        u16::from(self.d) << 8 | u16::from(self.e)
    }

    pub fn hl(&self) -> u16 {
        u16::from(self.h) << 8 | u16::from(self.l)
    }

    pub fn af(&self) -> u16 {
        u16::from(self.a) << 8 | u16::from(self.f)
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    // One-M-cycle primitives. Peripherals run first, then the access (§ bus
    // contract), so e.g. a DIV write lands on the edge after the tick.

    #[inline(always)]
    fn idle(&mut self, bus: &mut Bus) {
        bus.tick_m_cycle();
    }

    #[inline(always)]
    fn read8(&mut self, bus: &mut Bus, addr: u16) -> u8 {
        bus.tick_m_cycle();
        bus.read_byte(addr)
    }

    #[inline(always)]
    fn write8(&mut self, bus: &mut Bus, addr: u16, val: u8) {
        bus.tick_m_cycle();
        bus.write_byte(addr, val);
    }

    #[inline(always)]
    fn fetch8(&mut self, bus: &mut Bus) -> u8 {
        let val = self.read8(bus, self.pc);
        if self.halt_bug {
            // One-time duplicate fetch: PC stays put.
            self.halt_bug = false;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, bus: &mut Bus) -> u16 {
        let lo = u16::from(self.fetch8(bus));
        let hi = u16::from(self.fetch8(bus));
        hi << 8 | lo
    }

    fn push16(&mut self, bus: &mut Bus, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, val as u8);
    }

    fn pop16(&mut self, bus: &mut Bus) -> u16 {
        let lo = u16::from(self.read8(bus, self.sp));
        self.sp = self.sp.wrapping_add(1);
        let hi = u16::from(self.read8(bus, self.sp));
        self.sp = self.sp.wrapping_add(1);
        hi << 8 | lo
    }

    // r8 operand encoding: 0=B 1=C 2=D 3=E 4=H 5=L 6=(HL) 7=A.

    fn read_r8(&mut self, bus: &mut Bus, idx: u8) -> u8 {
        match idx {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(bus, self.hl()),
            _ => self.a,
        }
    }

    fn write_r8(&mut self, bus: &mut Bus, idx: u8, val: u8) {
        match idx {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.hl();
                self.write8(bus, addr, val);
            }
            _ => self.a = val,
        }
    }

    fn set_flags(&mut self, z: bool, n: bool, h: bool, c: bool) {
        self.f = if z { FLAG_Z } else { 0 }
            | if n { FLAG_N } else { 0 }
            | if h { FLAG_H } else { 0 }
            | if c { FLAG_C } else { 0 };
    }

    fn flag(&self, mask: u8) -> bool {
        self.f & mask != 0
    }

    // 8-bit ALU. H is carry out of bit 3, C out of bit 7.

    fn alu_add(&mut self, val: u8, carry_in: bool) {
        let cin = u8::from(carry_in && self.flag(FLAG_C));
        let res = u16::from(self.a) + u16::from(val) + u16::from(cin);
        let half = (self.a & 0x0F) + (val & 0x0F) + cin > 0x0F;
        self.set_flags(res as u8 == 0, false, half, res > 0xFF);
        self.a = res as u8;
    }

    fn alu_sub(&mut self, val: u8, carry_in: bool, keep_result: bool) {
        let cin = u8::from(carry_in && self.flag(FLAG_C));
        let res = i16::from(self.a) - i16::from(val) - i16::from(cin);
        let half = (self.a & 0x0F) < (val & 0x0F) + cin;
        self.set_flags(res as u8 == 0, true, half, res < 0);
        if keep_result {
            self.a = res as u8;
        }
    }

    fn alu_and(&mut self, val: u8) {
        self.a &= val;
        self.set_flags(self.a == 0, false, true, false);
    }

    fn alu_xor(&mut self, val: u8) {
        self.a ^= val;
        self.set_flags(self.a == 0, false, false, false);
    }

    fn alu_or(&mut self, val: u8) {
        self.a |= val;
        self.set_flags(self.a == 0, false, false, false);
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    /// ADD HL,rr: Z untouched, H/C from bits 11/15, one internal cycle.
    fn add_hl(&mut self, bus: &mut Bus, val: u16) {
        let hl = self.hl();
        let res = hl.wrapping_add(val);
        self.f = (self.f & FLAG_Z)
            | if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF {
                FLAG_H
            } else {
                0
            }
            | if u32::from(hl) + u32::from(val) > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(res);
        self.idle(bus);
    }

    /// SP + signed immediate, shared by ADD SP,i8 and LD HL,SP+i8. Flags
    /// come from the unsigned low-byte add.
    fn sp_plus_i8(&mut self, bus: &mut Bus) -> u16 {
        let off = self.fetch8(bus) as i8 as i16 as u16;
        let sp = self.sp;
        self.set_flags(
            false,
            false,
            (sp & 0x000F) + (off & 0x000F) > 0x000F,
            (sp & 0x00FF) + (off & 0x00FF) > 0x00FF,
        );
        sp.wrapping_add(off)
    }

    fn jr(&mut self, bus: &mut Bus, cond: bool) {
        let off = self.fetch8(bus) as i8;
        if cond {
            self.pc = self.pc.wrapping_add(off as u16);
            self.idle(bus);
        }
    }

    fn jp(&mut self, bus: &mut Bus, cond: bool) {
        let addr = self.fetch16(bus);
        if cond {
            self.pc = addr;
            self.idle(bus);
        }
    }

    fn call(&mut self, bus: &mut Bus, cond: bool) {
        let addr = self.fetch16(bus);
        if cond {
            self.idle(bus);
            self.push16(bus, self.pc);
            self.pc = addr;
        }
    }

    fn ret_cond(&mut self, bus: &mut Bus, cond: bool) {
        self.idle(bus);
        if cond {
            self.pc = self.pop16(bus);
            self.idle(bus);
        }
    }

    fn rst(&mut self, bus: &mut Bus, target: u16) {
        self.idle(bus);
        self.push16(bus, self.pc);
        self.pc = target;
    }

    fn daa(&mut self) {
        let mut correction = 0u8;
        let mut carry = self.flag(FLAG_C);
        if self.flag(FLAG_H) || (!self.flag(FLAG_N) && self.a & 0x0F > 0x09) {
            correction |= 0x06;
        }
        if self.flag(FLAG_C) || (!self.flag(FLAG_N) && self.a > 0x99) {
            correction |= 0x60;
            carry = true;
        }
        self.a = if self.flag(FLAG_N) {
            self.a.wrapping_sub(correction)
        } else {
            self.a.wrapping_add(correction)
        };
        self.f = (self.f & FLAG_N)
            | if self.a == 0 { FLAG_Z } else { 0 }
            | if carry { FLAG_C } else { 0 };
    }

    /// Interrupt dispatch, sampled on instruction boundaries.
    ///
    /// The high-byte push can overwrite IE ($FFFF); hardware re-samples
    /// IE&IF between the two pushes, which can redirect the dispatch or
    /// cancel it to vector $0000 (mooneye ie_push).
    fn service_interrupts(&mut self, bus: &mut Bus) {
        let pending = bus.ints.pending();
        if pending == 0 {
            return;
        }
        if !self.ime {
            self.halted = false;
            return;
        }

        self.halted = false;
        self.ime = false;
        self.ime_delay = 0;
        let return_pc = self.pc;

        self.idle(bus);
        self.idle(bus);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, (return_pc >> 8) as u8);

        let queue = bus.ints.pending();
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, return_pc as u8);

        if queue == 0 {
            self.pc = 0x0000;
            self.idle(bus);
            return;
        }

        let bit = Interrupts::highest_priority(queue);
        bus.ints.flags &= !bit;
        self.pc = Interrupts::vector_for(bit);
        self.idle(bus);
    }

    /// Execute one instruction (or one halted/locked machine cycle), then
    /// sample interrupts.
    pub fn step(&mut self, bus: &mut Bus) {
        if self.locked {
            return;
        }

        if self.halted {
            self.idle(bus);
            self.service_interrupts(bus);
            return;
        }

        let enable_ime_after = self.ime_delay == 1;
        let opcode = self.fetch8(bus);
        self.execute(bus, opcode);

        if enable_ime_after && self.ime_delay > 0 {
            self.ime = true;
        }
        if self.ime_delay > 0 {
            self.ime_delay -= 1;
        }
        self.service_interrupts(bus);
    }

    fn execute(&mut self, bus: &mut Bus, opcode: u8) {
        match opcode {
            0x00 => {}
            0x01 => {
                let val = self.fetch16(bus);
                self.set_bc(val);
            }
            0x02 => self.write8(bus, self.bc(), self.a),
            0x03 => {
                self.set_bc(self.bc().wrapping_add(1));
                self.idle(bus);
            }
            0x04 => self.b = self.inc8(self.b),
            0x05 => self.b = self.dec8(self.b),
            0x06 => self.b = self.fetch8(bus),
            0x07 => {
                let carry = self.a & 0x80 != 0;
                self.a = self.a.rotate_left(1);
                self.set_flags(false, false, false, carry);
            }
            0x08 => {
                let addr = self.fetch16(bus);
                self.write8(bus, addr, self.sp as u8);
                self.write8(bus, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 => self.add_hl(bus, self.bc()),
            0x0A => self.a = self.read8(bus, self.bc()),
            0x0B => {
                self.set_bc(self.bc().wrapping_sub(1));
                self.idle(bus);
            }
            0x0C => self.c = self.inc8(self.c),
            0x0D => self.c = self.dec8(self.c),
            0x0E => self.c = self.fetch8(bus),
            0x0F => {
                let carry = self.a & 0x01 != 0;
                self.a = self.a.rotate_right(1);
                self.set_flags(false, false, false, carry);
            }
            0x10 => {
                // STOP. No speed switching on DMG: two-byte NOP that resets
                // the divider.
                let _ = self.fetch8(bus);
                bus.reset_div();
            }
            0x11 => {
                let val = self.fetch16(bus);
                self.set_de(val);
            }
            0x12 => self.write8(bus, self.de(), self.a),
            0x13 => {
                self.set_de(self.de().wrapping_add(1));
                self.idle(bus);
            }
            0x14 => self.d = self.inc8(self.d),
            0x15 => self.d = self.dec8(self.d),
            0x16 => self.d = self.fetch8(bus),
            0x17 => {
                let carry = self.a & 0x80 != 0;
                self.a = self.a << 1 | u8::from(self.flag(FLAG_C));
                self.set_flags(false, false, false, carry);
            }
            0x18 => self.jr(bus, true),
            0x19 => self.add_hl(bus, self.de()),
            0x1A => self.a = self.read8(bus, self.de()),
            0x1B => {
                self.set_de(self.de().wrapping_sub(1));
                self.idle(bus);
            }
            0x1C => self.e = self.inc8(self.e),
            0x1D => self.e = self.dec8(self.e),
            0x1E => self.e = self.fetch8(bus),
            0x1F => {
                let carry = self.a & 0x01 != 0;
                self.a = self.a >> 1 | u8::from(self.flag(FLAG_C)) << 7;
                self.set_flags(false, false, false, carry);
            }
            0x20 => self.jr(bus, !self.flag(FLAG_Z)),
            0x21 => {
                let val = self.fetch16(bus);
                self.set_hl(val);
            }
            0x22 => {
                let addr = self.hl();
                self.write8(bus, addr, self.a);
                self.set_hl(addr.wrapping_add(1));
            }
            0x23 => {
                self.set_hl(self.hl().wrapping_add(1));
                self.idle(bus);
            }
            0x24 => self.h = self.inc8(self.h),
            0x25 => self.h = self.dec8(self.h),
            0x26 => self.h = self.fetch8(bus),
            0x27 => self.daa(),
            0x28 => self.jr(bus, self.flag(FLAG_Z)),
            0x29 => self.add_hl(bus, self.hl()),
            0x2A => {
                let addr = self.hl();
                self.a = self.read8(bus, addr);
                self.set_hl(addr.wrapping_add(1));
            }
            0x2B => {
                self.set_hl(self.hl().wrapping_sub(1));
                self.idle(bus);
            }
            0x2C => self.l = self.inc8(self.l),
            0x2D => self.l = self.dec8(self.l),
            0x2E => self.l = self.fetch8(bus),
            0x2F => {
                self.a = !self.a;
                self.f |= FLAG_N | FLAG_H;
            }
            0x30 => self.jr(bus, !self.flag(FLAG_C)),
            0x31 => self.sp = self.fetch16(bus),
            0x32 => {
                let addr = self.hl();
                self.write8(bus, addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x33 => {
                self.sp = self.sp.wrapping_add(1);
                self.idle(bus);
            }
            0x34 => {
                let addr = self.hl();
                let val = self.read8(bus, addr);
                let res = self.inc8(val);
                self.write8(bus, addr, res);
            }
            0x35 => {
                let addr = self.hl();
                let val = self.read8(bus, addr);
                let res = self.dec8(val);
                self.write8(bus, addr, res);
            }
            0x36 => {
                let val = self.fetch8(bus);
                self.write8(bus, self.hl(), val);
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x38 => self.jr(bus, self.flag(FLAG_C)),
            0x39 => self.add_hl(bus, self.sp),
            0x3A => {
                let addr = self.hl();
                self.a = self.read8(bus, addr);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x3B => {
                self.sp = self.sp.wrapping_sub(1);
                self.idle(bus);
            }
            0x3C => self.a = self.inc8(self.a),
            0x3D => self.a = self.dec8(self.a),
            0x3E => self.a = self.fetch8(bus),
            0x3F => {
                self.f = (self.f & FLAG_Z) | (self.f & FLAG_C) ^ FLAG_C;
            }
            0x76 => {
                let pending = bus.ints.pending();
                if !self.ime && pending != 0 {
                    // HALT bug: do not halt; the next fetch repeats this PC.
                    self.halt_bug = true;
                } else {
                    self.halted = true;
                }
            }
            0x40..=0x7F => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.write_r8(bus, opcode >> 3 & 0x07, val);
            }
            0x80..=0x87 => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_add(val, false);
            }
            0x88..=0x8F => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_add(val, true);
            }
            0x90..=0x97 => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_sub(val, false, true);
            }
            0x98..=0x9F => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_sub(val, true, true);
            }
            0xA0..=0xA7 => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_and(val);
            }
            0xA8..=0xAF => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_xor(val);
            }
            0xB0..=0xB7 => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_or(val);
            }
            0xB8..=0xBF => {
                let val = self.read_r8(bus, opcode & 0x07);
                self.alu_sub(val, false, false);
            }
            0xC0 => self.ret_cond(bus, !self.flag(FLAG_Z)),
            0xC1 => {
                let val = self.pop16(bus);
                self.set_bc(val);
            }
            0xC2 => self.jp(bus, !self.flag(FLAG_Z)),
            0xC3 => self.jp(bus, true),
            0xC4 => self.call(bus, !self.flag(FLAG_Z)),
            0xC5 => {
                self.idle(bus);
                self.push16(bus, self.bc());
            }
            0xC6 => {
                let val = self.fetch8(bus);
                self.alu_add(val, false);
            }
            0xC7 => self.rst(bus, 0x00),
            0xC8 => self.ret_cond(bus, self.flag(FLAG_Z)),
            0xC9 => {
                self.pc = self.pop16(bus);
                self.idle(bus);
            }
            0xCA => self.jp(bus, self.flag(FLAG_Z)),
            0xCB => {
                let op = self.fetch8(bus);
                self.execute_cb(bus, op);
            }
            0xCC => self.call(bus, self.flag(FLAG_Z)),
            0xCD => self.call(bus, true),
            0xCE => {
                let val = self.fetch8(bus);
                self.alu_add(val, true);
            }
            0xCF => self.rst(bus, 0x08),
            0xD0 => self.ret_cond(bus, !self.flag(FLAG_C)),
            0xD1 => {
                let val = self.pop16(bus);
                self.set_de(val);
            }
            0xD2 => self.jp(bus, !self.flag(FLAG_C)),
            0xD4 => self.call(bus, !self.flag(FLAG_C)),
            0xD5 => {
                self.idle(bus);
                self.push16(bus, self.de());
            }
            0xD6 => {
                let val = self.fetch8(bus);
                self.alu_sub(val, false, true);
            }
            0xD7 => self.rst(bus, 0x10),
            0xD8 => self.ret_cond(bus, self.flag(FLAG_C)),
            0xD9 => {
                // RETI: IME is restored immediately, no EI-style delay.
                self.pc = self.pop16(bus);
                self.ime = true;
                self.idle(bus);
            }
            0xDA => self.jp(bus, self.flag(FLAG_C)),
            0xDC => self.call(bus, self.flag(FLAG_C)),
            0xDE => {
                let val = self.fetch8(bus);
                self.alu_sub(val, true, true);
            }
            0xDF => self.rst(bus, 0x18),
            0xE0 => {
                let off = self.fetch8(bus);
                self.write8(bus, 0xFF00 | u16::from(off), self.a);
            }
            0xE1 => {
                let val = self.pop16(bus);
                self.set_hl(val);
            }
            0xE2 => self.write8(bus, 0xFF00 | u16::from(self.c), self.a),
            0xE5 => {
                self.idle(bus);
                self.push16(bus, self.hl());
            }
            0xE6 => {
                let val = self.fetch8(bus);
                self.alu_and(val);
            }
            0xE7 => self.rst(bus, 0x20),
            0xE8 => {
                self.sp = self.sp_plus_i8(bus);
                self.idle(bus);
                self.idle(bus);
            }
            0xE9 => self.pc = self.hl(),
            0xEA => {
                let addr = self.fetch16(bus);
                self.write8(bus, addr, self.a);
            }
            0xEE => {
                let val = self.fetch8(bus);
                self.alu_xor(val);
            }
            0xEF => self.rst(bus, 0x28),
            0xF0 => {
                let off = self.fetch8(bus);
                self.a = self.read8(bus, 0xFF00 | u16::from(off));
            }
            0xF1 => {
                let val = self.pop16(bus);
                self.a = (val >> 8) as u8;
                // Low nibble of F does not exist in silicon.
                self.f = val as u8 & 0xF0;
            }
            0xF2 => self.a = self.read8(bus, 0xFF00 | u16::from(self.c)),
            0xF3 => {
                self.ime = false;
                self.ime_delay = 0;
            }
            0xF5 => {
                self.idle(bus);
                self.push16(bus, self.af() & 0xFFF0);
            }
            0xF6 => {
                let val = self.fetch8(bus);
                self.alu_or(val);
            }
            0xF7 => self.rst(bus, 0x30),
            0xF8 => {
                let res = self.sp_plus_i8(bus);
                self.set_hl(res);
                self.idle(bus);
            }
            0xF9 => {
                self.sp = self.hl();
                self.idle(bus);
            }
            0xFA => {
                let addr = self.fetch16(bus);
                self.a = self.read8(bus, addr);
            }
            0xFB => self.ime_delay = 2,
            0xFE => {
                let val = self.fetch8(bus);
                self.alu_sub(val, false, false);
            }
            _ => {
                core_warn!(target: "cpu", "illegal opcode {opcode:02X} at {:04X}", self.pc.wrapping_sub(1));
                self.locked = true;
                self.locked_opcode = opcode;
            }
        }
    }

    fn execute_cb(&mut self, bus: &mut Bus, opcode: u8) {
        let idx = opcode & 0x07;
        match opcode {
            0x00..=0x3F => {
                let val = self.read_r8(bus, idx);
                let (res, carry) = match opcode >> 3 {
                    0 => (val.rotate_left(1), val & 0x80 != 0),
                    1 => (val.rotate_right(1), val & 0x01 != 0),
                    2 => (val << 1 | u8::from(self.flag(FLAG_C)), val & 0x80 != 0),
                    3 => (
                        val >> 1 | u8::from(self.flag(FLAG_C)) << 7,
                        val & 0x01 != 0,
                    ),
                    4 => (val << 1, val & 0x80 != 0),
                    5 => (val >> 1 | val & 0x80, val & 0x01 != 0),
                    6 => (val.rotate_left(4), false),
                    _ => (val >> 1, val & 0x01 != 0),
                };
                self.write_r8(bus, idx, res);
                self.set_flags(res == 0, false, false, carry);
            }
            0x40..=0x7F => {
                let bit = opcode >> 3 & 0x07;
                let val = self.read_r8(bus, idx);
                self.f = (self.f & FLAG_C)
                    | FLAG_H
                    | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = opcode >> 3 & 0x07;
                let val = self.read_r8(bus, idx);
                self.write_r8(bus, idx, val & !(1 << bit));
            }
            _ => {
                let bit = opcode >> 3 & 0x07;
                let val = self.read_r8(bus, idx);
                self.write_r8(bus, idx, val | 1 << bit);
            }
        }
    }
}

impl Cpu {
    pub(crate) fn save_state(&self, buf: &mut Vec<u8>) {
        use crate::snapshot::*;
        for r in [self.a, self.f, self.b, self.c, self.d, self.e, self.h, self.l] {
            put_u8(buf, r);
        }
        put_u16(buf, self.pc);
        put_u16(buf, self.sp);
        put_bool(buf, self.ime);
        put_bool(buf, self.halted);
        put_bool(buf, self.locked);
        put_bool(buf, self.halt_bug);
        put_u8(buf, self.ime_delay);
        put_u8(buf, self.locked_opcode);
    }

    pub(crate) fn load_state(
        &mut self,
        r: &mut crate::snapshot::Reader,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.a = r.u8()?;
        self.f = r.u8()?;
        self.b = r.u8()?;
        self.c = r.u8()?;
        self.d = r.u8()?;
        self.e = r.u8()?;
        self.h = r.u8()?;
        self.l = r.u8()?;
        self.pc = r.u16()?;
        self.sp = r.u16()?;
        self.ime = r.bool()?;
        self.halted = r.bool()?;
        self.locked = r.bool()?;
        self.halt_bug = r.bool()?;
        self.ime_delay = r.u8()?;
        self.locked_opcode = r.u8()?;
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
