use crate::targets::{SpiRegisters, Target};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07c6];

/// ESP32-S2 Target
pub struct Esp32s2;

impl Esp32s2 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32s2 {
    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3f40_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        }
    }

    fn supports_encrypted_flash(&self) -> bool {
        true
    }
}
