use crate::targets::{SpiRegisters, Target};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xfff0_c101];

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp8266 {
    fn spi_registers(&self) -> SpiRegisters {
        // The ESP8266 has no dedicated data-length registers; both lengths
        // are packed into USR1 instead.
        SpiRegisters {
            base: 0x6000_0200,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x40,
            mosi_length_offset: None,
            miso_length_offset: None,
        }
    }

    fn supports_encrypted_flash(&self) -> bool {
        false
    }
}
