use thiserror::Error;

const BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;

/// Nintendo logo bitmap at $0104-$0133. The boot ROM refuses carts without
/// it, so a dump missing these bytes is not a runnable image.
const NINTENDO_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D,
    0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99,
    0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];

#[derive(Debug, Error)]
pub enum RomError {
    #[error("ROM image too small to contain a header ({0} bytes)")]
    TooShort(usize),
    #[error("Nintendo logo missing from header")]
    BadLogo,
    #[error("ROM size mismatch: header declares {header} bytes, image has {actual}")]
    SizeMismatch { header: usize, actual: usize },
    #[error("unsupported mapper type {0:#04x}")]
    UnsupportedMapper(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    RomOnly,
    Mbc1,
    Mbc3,
    Mbc5,
}

#[derive(Debug)]
enum MbcState {
    RomOnly,
    Mbc1 {
        /// ROMB0: low five ROM-bank bits ($2000-$3FFF). Raw value; the 0->1
        /// remap happens at read time.
        low5: u8,
        /// ROMB1/RAMB: two upper bits ($4000-$5FFF).
        high2: u8,
        /// MODE ($6000-$7FFF): 0 = simple, 1 = RAM-banking / advanced.
        mode: u8,
        ram_enable: bool,
        multicart: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_armed: bool,
    },
    Mbc5 {
        /// 9-bit ROM bank; bank 0 is legal and maps bank 0.
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

/// MBC3 real-time clock, stepped from the machine clock rather than wall
/// time so savestates and test runs stay deterministic.
#[derive(Debug, Clone, Default)]
struct Rtc {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    day_carry: bool,
    latched: [u8; 5],
    subsecond: u32,
}

impl Rtc {
    fn latch(&mut self) {
        self.latched = [
            self.seconds & 0x3F,
            self.minutes & 0x3F,
            self.hours & 0x1F,
            (self.days & 0xFF) as u8,
            self.control(),
        ];
    }

    fn control(&self) -> u8 {
        ((self.days >> 8) as u8 & 0x01)
            | if self.halt { 0x40 } else { 0 }
            | if self.day_carry { 0x80 } else { 0 }
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08..=0x0C => self.latched[(reg - 0x08) as usize],
            _ => 0xFF,
        }
    }

    fn write(&mut self, reg: u8, val: u8) {
        match reg {
            0x08 => {
                self.seconds = val & 0x3F;
                self.subsecond = 0;
            }
            0x09 => self.minutes = val & 0x3F,
            0x0A => self.hours = val & 0x1F,
            0x0B => self.days = (self.days & 0x100) | u16::from(val),
            0x0C => {
                self.days = (self.days & 0xFF) | (u16::from(val & 0x01) << 8);
                self.halt = val & 0x40 != 0;
                self.day_carry = val & 0x80 != 0;
            }
            _ => {}
        }
    }

    fn step(&mut self, cycles: u32) {
        if self.halt {
            return;
        }
        self.subsecond += cycles;
        while self.subsecond >= crate::CPU_CLOCK_HZ {
            self.subsecond -= crate::CPU_CLOCK_HZ;
            self.tick_second();
        }
    }

    fn tick_second(&mut self) {
        self.seconds = (self.seconds + 1) & 0x3F;
        if self.seconds != 60 {
            return;
        }
        self.seconds = 0;
        self.minutes = (self.minutes + 1) & 0x3F;
        if self.minutes != 60 {
            return;
        }
        self.minutes = 0;
        self.hours = (self.hours + 1) & 0x1F;
        if self.hours != 24 {
            return;
        }
        self.hours = 0;
        if self.days == 0x1FF {
            self.days = 0;
            self.day_carry = true;
        } else {
            self.days += 1;
        }
    }
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    cart_type: u8,
    rom_banks: usize,
    state: MbcState,
}

impl Cartridge {
    /// Parse and validate a ROM image.
    pub fn load(data: Vec<u8>) -> Result<Self, RomError> {
        if data.len() < 0x150 {
            return Err(RomError::TooShort(data.len()));
        }
        if data[0x0104..0x0134] != NINTENDO_LOGO {
            return Err(RomError::BadLogo);
        }

        let declared = rom_size_from_code(data[0x0148]).ok_or(RomError::SizeMismatch {
            header: 0,
            actual: data.len(),
        })?;
        if declared != data.len() {
            return Err(RomError::SizeMismatch {
                header: declared,
                actual: data.len(),
            });
        }

        let cart_type = data[0x0147];
        let mbc = match cart_type {
            0x00 | 0x08 | 0x09 => MbcType::RomOnly,
            0x01..=0x03 => MbcType::Mbc1,
            0x0F..=0x13 => MbcType::Mbc3,
            0x19..=0x1E => MbcType::Mbc5,
            other => return Err(RomError::UnsupportedMapper(other)),
        };

        let mut ram_size = ram_size_from_code(data[0x0149]);
        if ram_size == 0 && declares_ram(cart_type) {
            ram_size = RAM_BANK_SIZE;
        }

        let rom_banks = declared / BANK_SIZE;
        let state = match mbc {
            MbcType::RomOnly => MbcState::RomOnly,
            MbcType::Mbc1 => MbcState::Mbc1 {
                low5: 1,
                high2: 0,
                mode: 0,
                ram_enable: false,
                multicart: rom_banks >= 64 && has_logo_at_bank(&data, 0x10),
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc(cart_type).then(Rtc::default),
                latch_armed: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        Ok(Self {
            title: title_from_header(&data),
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            cart_type,
            rom_banks,
            state,
        })
    }

    pub fn has_battery(&self) -> bool {
        matches!(self.cart_type, 0x03 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E)
    }

    /// Seed external RAM from a previously saved image (extra bytes ignored).
    pub fn load_ram(&mut self, bytes: &[u8]) {
        for (dst, src) in self.ram.iter_mut().zip(bytes) {
            *dst = *src;
        }
    }

    /// Advance the RTC, if this cartridge has one.
    pub fn step(&mut self, cycles: u32) {
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &mut self.state {
            rtc.step(cycles);
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => self.read_rom_low(addr),
            0x4000..=0x7FFF => self.read_rom_high(addr),
            0xA000..=0xBFFF => self.read_ram(addr),
            _ => 0xFF,
        }
    }

    fn rom_byte(&self, bank: usize, offset: usize) -> u8 {
        let bank = if self.rom_banks == 0 {
            0
        } else {
            bank % self.rom_banks
        };
        self.rom.get(bank * BANK_SIZE + offset).copied().unwrap_or(0xFF)
    }

    fn read_rom_low(&self, addr: u16) -> u8 {
        let offset = addr as usize;
        match &self.state {
            MbcState::Mbc1 {
                high2,
                mode: 1,
                multicart,
                ..
            } => {
                // Advanced mode maps the upper bits into $0000-$3FFF too.
                let shift = if *multicart { 4 } else { 5 };
                self.rom_byte((*high2 as usize) << shift, offset)
            }
            _ => self.rom_byte(0, offset),
        }
    }

    fn read_rom_high(&self, addr: u16) -> u8 {
        let offset = addr as usize - 0x4000;
        match &self.state {
            MbcState::RomOnly => self.rom_byte(1, offset),
            MbcState::Mbc1 {
                low5,
                high2,
                multicart,
                ..
            } => {
                let low = if *low5 == 0 { 1 } else { *low5 } as usize;
                let bank = if *multicart {
                    ((*high2 as usize) << 4) | (low & 0x0F)
                } else {
                    ((*high2 as usize) << 5) | low
                };
                self.rom_byte(bank, offset)
            }
            MbcState::Mbc3 { rom_bank, .. } => {
                let bank = if *rom_bank == 0 { 1 } else { *rom_bank } as usize;
                self.rom_byte(bank, offset)
            }
            MbcState::Mbc5 { rom_bank, .. } => self.rom_byte(*rom_bank as usize, offset),
        }
    }

    fn read_ram(&self, addr: u16) -> u8 {
        let offset = addr as usize - 0xA000;
        match &self.state {
            MbcState::RomOnly => self.ram.get(offset).copied().unwrap_or(0xFF),
            MbcState::Mbc1 {
                ram_enable: false, ..
            }
            | MbcState::Mbc3 {
                ram_enable: false, ..
            }
            | MbcState::Mbc5 {
                ram_enable: false, ..
            } => 0xFF,
            MbcState::Mbc1 {
                high2, mode, ..
            } => {
                let bank = if *mode == 1 { *high2 as usize } else { 0 };
                self.ram_byte(bank, offset)
            }
            MbcState::Mbc3 {
                ram_bank, rtc, ..
            } => match *ram_bank {
                0x00..=0x03 => self.ram_byte(*ram_bank as usize, offset),
                0x08..=0x0C => rtc.as_ref().map(|r| r.read(*ram_bank)).unwrap_or(0xFF),
                _ => 0xFF,
            },
            MbcState::Mbc5 { ram_bank, .. } => self.ram_byte(*ram_bank as usize, offset),
        }
    }

    fn ram_byte(&self, bank: usize, offset: usize) -> u8 {
        let banks = self.ram.len() / RAM_BANK_SIZE;
        if banks == 0 {
            // 2 KiB carts: single partial bank, mirrored.
            return self.ram.get(offset % self.ram.len().max(1)).copied().unwrap_or(0xFF);
        }
        self.ram
            .get((bank % banks) * RAM_BANK_SIZE + offset)
            .copied()
            .unwrap_or(0xFF)
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => self.write_control(addr, val),
            0xA000..=0xBFFF => self.write_ram(addr, val),
            _ => {}
        }
    }

    fn write_control(&mut self, addr: u16, val: u8) {
        match &mut self.state {
            MbcState::RomOnly => {}
            MbcState::Mbc1 {
                low5,
                high2,
                mode,
                ram_enable,
                ..
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *low5 = val & 0x1F,
                0x4000..=0x5FFF => *high2 = val & 0x03,
                _ => *mode = val & 0x01,
            },
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                rtc,
                latch_armed,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = val & 0x7F,
                0x4000..=0x5FFF => *ram_bank = val,
                _ => {
                    // RTC latch: writing 0 then 1 snapshots the live counters.
                    if val == 0x00 {
                        *latch_armed = true;
                    } else {
                        if val == 0x01
                            && *latch_armed
                            && let Some(rtc) = rtc
                        {
                            rtc.latch();
                        }
                        *latch_armed = false;
                    }
                }
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | u16::from(val),
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0xFF) | (u16::from(val & 0x01) << 8),
                0x4000..=0x5FFF => *ram_bank = val & 0x0F,
                _ => {}
            },
        }
    }

    fn write_ram(&mut self, addr: u16, val: u8) {
        let offset = addr as usize - 0xA000;
        let (bank, enabled) = match &mut self.state {
            MbcState::RomOnly => (0, !self.ram.is_empty()),
            MbcState::Mbc1 {
                high2,
                mode,
                ram_enable,
                ..
            } => (
                if *mode == 1 { *high2 as usize } else { 0 },
                *ram_enable,
            ),
            MbcState::Mbc3 {
                ram_bank,
                ram_enable,
                rtc,
                ..
            } => {
                if *ram_enable && (0x08..=0x0C).contains(ram_bank) {
                    if let Some(rtc) = rtc {
                        rtc.write(*ram_bank, val);
                    }
                    return;
                }
                if *ram_bank > 0x03 {
                    return;
                }
                (*ram_bank as usize, *ram_enable)
            }
            MbcState::Mbc5 {
                ram_bank,
                ram_enable,
                ..
            } => (*ram_bank as usize, *ram_enable),
        };

        if !enabled {
            return;
        }
        let banks = self.ram.len() / RAM_BANK_SIZE;
        let idx = if banks == 0 {
            if self.ram.is_empty() {
                return;
            }
            offset % self.ram.len()
        } else {
            (bank % banks) * RAM_BANK_SIZE + offset
        };
        if let Some(b) = self.ram.get_mut(idx) {
            *b = val;
        }
    }
}

impl Cartridge {
    pub(crate) fn save_state(&self, buf: &mut Vec<u8>) {
        use crate::snapshot::*;
        put_bytes(buf, &self.ram);
        match &self.state {
            MbcState::RomOnly => put_u8(buf, 0),
            MbcState::Mbc1 {
                low5,
                high2,
                mode,
                ram_enable,
                multicart: _,
            } => {
                put_u8(buf, 1);
                put_u8(buf, *low5);
                put_u8(buf, *high2);
                put_u8(buf, *mode);
                put_bool(buf, *ram_enable);
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                rtc,
                latch_armed,
            } => {
                put_u8(buf, 2);
                put_u8(buf, *rom_bank);
                put_u8(buf, *ram_bank);
                put_bool(buf, *ram_enable);
                put_bool(buf, *latch_armed);
                put_bool(buf, rtc.is_some());
                if let Some(rtc) = rtc {
                    put_u8(buf, rtc.seconds);
                    put_u8(buf, rtc.minutes);
                    put_u8(buf, rtc.hours);
                    put_u16(buf, rtc.days);
                    put_bool(buf, rtc.halt);
                    put_bool(buf, rtc.day_carry);
                    put_bytes(buf, &rtc.latched);
                    put_u32(buf, rtc.subsecond);
                }
            }
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => {
                put_u8(buf, 3);
                put_u16(buf, *rom_bank);
                put_u8(buf, *ram_bank);
                put_bool(buf, *ram_enable);
            }
        }
    }

    pub(crate) fn load_state(
        &mut self,
        r: &mut crate::snapshot::Reader,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        use crate::snapshot::SnapshotError;
        r.fill(&mut self.ram)?;
        let tag = r.u8()?;
        match (&mut self.state, tag) {
            (MbcState::RomOnly, 0) => {}
            (
                MbcState::Mbc1 {
                    low5,
                    high2,
                    mode,
                    ram_enable,
                    ..
                },
                1,
            ) => {
                *low5 = r.u8()?;
                *high2 = r.u8()?;
                *mode = r.u8()?;
                *ram_enable = r.bool()?;
            }
            (
                MbcState::Mbc3 {
                    rom_bank,
                    ram_bank,
                    ram_enable,
                    rtc,
                    latch_armed,
                },
                2,
            ) => {
                *rom_bank = r.u8()?;
                *ram_bank = r.u8()?;
                *ram_enable = r.bool()?;
                *latch_armed = r.bool()?;
                let has_rtc = r.bool()?;
                if has_rtc != rtc.is_some() {
                    return Err(SnapshotError::RomMismatch);
                }
                if let Some(rtc) = rtc {
                    rtc.seconds = r.u8()?;
                    rtc.minutes = r.u8()?;
                    rtc.hours = r.u8()?;
                    rtc.days = r.u16()?;
                    rtc.halt = r.bool()?;
                    rtc.day_carry = r.bool()?;
                    r.fill(&mut rtc.latched)?;
                    rtc.subsecond = r.u32()?;
                }
            }
            (
                MbcState::Mbc5 {
                    rom_bank,
                    ram_bank,
                    ram_enable,
                },
                3,
            ) => {
                *rom_bank = r.u16()?;
                *ram_bank = r.u8()?;
                *ram_enable = r.bool()?;
            }
            _ => return Err(SnapshotError::RomMismatch),
        }
        Ok(())
    }
}

fn rom_size_from_code(code: u8) -> Option<usize> {
    match code {
        0x00..=0x08 => Some((2 << code) * BANK_SIZE),
        _ => None,
    }
}

fn ram_size_from_code(code: u8) -> usize {
    match code {
        0x02 => 0x2000,
        0x03 => 0x8000,
        0x04 => 0x20000,
        0x05 => 0x10000,
        _ => 0,
    }
}

fn declares_ram(cart_type: u8) -> bool {
    matches!(
        cart_type,
        0x02 | 0x03 | 0x08 | 0x09 | 0x10 | 0x12 | 0x13 | 0x1A | 0x1B | 0x1D | 0x1E
    )
}

fn has_rtc(cart_type: u8) -> bool {
    matches!(cart_type, 0x0F | 0x10)
}

fn has_logo_at_bank(rom: &[u8], bank: usize) -> bool {
    let off = bank * BANK_SIZE + 0x0104;
    rom.get(off..off + NINTENDO_LOGO.len())
        .is_some_and(|s| s == NINTENDO_LOGO)
}

fn title_from_header(rom: &[u8]) -> String {
    let raw = &rom[0x0134..0x0144];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}
