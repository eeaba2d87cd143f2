use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio_queue::PcmConsumer;
use crate::bus::Bus;
use crate::cartridge::{Cartridge, RomError};
use crate::cpu::Cpu;
use crate::snapshot::{self, Reader, SnapshotError};
use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};

/// Why the machine stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashReason {
    /// The CPU fetched one of the undefined encodings and wedged itself.
    /// All machine state stays inspectable.
    IllegalOpcode { opcode: u8, pc: u16 },
}

/// The whole DMG wired together. The machine owns every component; the CPU
/// borrows the bus per instruction, and peripherals raise interrupts through
/// the IF register on the bus. Frontends only talk to this type.
pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
    stop: Arc<AtomicBool>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Parse, validate and insert a ROM image, resetting the machine to its
    /// post-boot state.
    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), RomError> {
        let cart = Cartridge::load(data)?;
        core_info!(target: "machine", "loaded \"{}\" ({:?}, {} KiB RAM)",
            cart.title, cart.mbc, cart.ram.len() / 1024);
        self.cpu = Cpu::new();
        self.bus = Bus::new();
        self.bus.load_cart(cart);
        Ok(())
    }

    /// Handle the frontend can flip from another thread to make
    /// [`run_frame`](Self::run_frame) return at the next instruction
    /// boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Replace the joypad state with a frontend bitmask (bit set = pressed;
    /// A=0, B=1, Select=2, Start=3, Right=4, Left=5, Up=6, Down=7).
    pub fn set_buttons(&mut self, mask: u8) {
        self.bus.joypad.set_buttons(mask, &mut self.bus.ints);
    }

    /// Run until the next VBlank entry and return the finished frame:
    /// 160x144 post-palette shades, row-major, one byte per pixel in 0-3.
    /// PCM produced along the way lands in the ring obtained from
    /// [`audio_output`](Self::audio_output).
    ///
    /// Returns the previous frame unchanged once the machine has crashed or
    /// been asked to stop.
    pub fn run_frame(&mut self) -> &[u8; SCREEN_WIDTH * SCREEN_HEIGHT] {
        while !self.stop.load(Ordering::Relaxed) && self.crash_reason().is_none() {
            self.cpu.step(&mut self.bus);
            if self.bus.ppu.take_frame_ready() {
                break;
            }
        }
        &self.bus.ppu.framebuffer
    }

    /// Execute a single instruction (or halted cycle).
    pub fn step(&mut self) {
        self.cpu.step(&mut self.bus);
    }

    pub fn crash_reason(&self) -> Option<CrashReason> {
        self.cpu.locked.then_some(CrashReason::IllegalOpcode {
            opcode: self.cpu.locked_opcode,
            pc: self.cpu.pc.wrapping_sub(1),
        })
    }

    /// Take the receive side of the PCM ring (valid once per machine).
    pub fn audio_output(&mut self) -> Option<PcmConsumer> {
        self.bus.apu.take_consumer()
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.bus.apu.set_sample_rate(rate);
    }

    /// Bytes the program pushed out the serial port since the last call.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.bus.serial.take_output()
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.bus.cart.as_ref()
    }

    pub fn cartridge_mut(&mut self) -> Option<&mut Cartridge> {
        self.bus.cart.as_mut()
    }

    /// Flat deterministic savestate of the whole machine.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(0x10000);
        snapshot::put_bytes(&mut buf, snapshot::MAGIC);
        snapshot::put_u8(&mut buf, snapshot::VERSION);
        let (rom_len, rom_check) = match &self.bus.cart {
            Some(cart) => (cart.rom.len() as u32, rom_checksum(&cart.rom)),
            None => (0, 0),
        };
        snapshot::put_u32(&mut buf, rom_len);
        snapshot::put_u16(&mut buf, rom_check);
        self.cpu.save_state(&mut buf);
        self.bus.save_state(&mut buf);
        buf
    }

    /// Restore a snapshot taken from a machine running the same ROM.
    pub fn restore(&mut self, blob: &[u8]) -> Result<(), SnapshotError> {
        let mut r = Reader::new(blob);
        let mut magic = [0u8; 4];
        r.fill(&mut magic)?;
        if &magic != snapshot::MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = r.u8()?;
        if version != snapshot::VERSION {
            return Err(SnapshotError::BadVersion(version));
        }
        let rom_len = r.u32()?;
        let rom_check = r.u16()?;
        let (cur_len, cur_check) = match &self.bus.cart {
            Some(cart) => (cart.rom.len() as u32, rom_checksum(&cart.rom)),
            None => (0, 0),
        };
        if rom_len != cur_len || rom_check != cur_check {
            return Err(SnapshotError::RomMismatch);
        }
        self.cpu.load_state(&mut r)?;
        self.bus.load_state(&mut r)?;
        if r.remaining() != 0 {
            return Err(SnapshotError::TrailingBytes(r.remaining()));
        }
        Ok(())
    }
}

/// Global checksum over the ROM image, used to refuse restoring a snapshot
/// into the wrong game.
fn rom_checksum(rom: &[u8]) -> u16 {
    rom.iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
