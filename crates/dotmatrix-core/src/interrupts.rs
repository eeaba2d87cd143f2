// Interrupt sources in priority order (gbdev.io/pandocs/Interrupts.html).
pub const INT_VBLANK: u8 = 0x01;
pub const INT_STAT: u8 = 0x02;
pub const INT_TIMER: u8 = 0x04;
pub const INT_SERIAL: u8 = 0x08;
pub const INT_JOYPAD: u8 = 0x10;

/// IF/IE register pair. Dispatch itself lives in the CPU; peripherals only
/// ever set bits here.
pub struct Interrupts {
    /// IF ($FF0F). Upper three bits are unimplemented and read back as 1.
    pub flags: u8,
    /// IE ($FFFF). All eight bits are writable.
    pub enable: u8,
}

impl Interrupts {
    pub fn new() -> Self {
        // Post-boot: VBLANK already latched by the boot ROM's last frame.
        Self {
            flags: 0xE1,
            enable: 0,
        }
    }

    #[inline]
    pub fn request(&mut self, mask: u8) {
        self.flags |= mask & 0x1F;
    }

    /// Pending = requested AND enabled, restricted to the five real sources.
    #[inline]
    pub fn pending(&self) -> u8 {
        self.flags & self.enable & 0x1F
    }

    pub fn read_flags(&self) -> u8 {
        self.flags | 0xE0
    }

    pub fn write_flags(&mut self, val: u8) {
        self.flags = val & 0x1F;
    }

    /// Service vector for the lowest-numbered pending bit.
    pub fn vector_for(bit: u8) -> u16 {
        match bit {
            INT_VBLANK => 0x0040,
            INT_STAT => 0x0048,
            INT_TIMER => 0x0050,
            INT_SERIAL => 0x0058,
            _ => 0x0060,
        }
    }

    /// Lowest-numbered (highest-priority) set bit of `pending`.
    pub fn highest_priority(pending: u8) -> u8 {
        pending & pending.wrapping_neg()
    }
}

impl Interrupts {
    pub(crate) fn save_state(&self, buf: &mut Vec<u8>) {
        crate::snapshot::put_u8(buf, self.flags);
        crate::snapshot::put_u8(buf, self.enable);
    }

    pub(crate) fn load_state(
        &mut self,
        r: &mut crate::snapshot::Reader,
    ) -> Result<(), crate::snapshot::SnapshotError> {
        self.flags = r.u8()?;
        self.enable = r.u8()?;
        Ok(())
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_picks_lowest_bit() {
        assert_eq!(Interrupts::highest_priority(0x12), INT_STAT);
        assert_eq!(Interrupts::highest_priority(0x10), INT_JOYPAD);
        assert_eq!(Interrupts::highest_priority(0x1F), INT_VBLANK);
    }

    #[test]
    fn flags_read_with_upper_bits_set() {
        let mut ints = Interrupts::new();
        ints.write_flags(0x05);
        assert_eq!(ints.read_flags(), 0xE5);
    }

    #[test]
    fn vectors() {
        assert_eq!(Interrupts::vector_for(INT_VBLANK), 0x0040);
        assert_eq!(Interrupts::vector_for(INT_JOYPAD), 0x0060);
    }
}
