//! Supported target devices
//!
//! Every device in the family boots the same ROM loader protocol, but the
//! chips differ in the magic word their ROM exposes for identification, in
//! the address layout of their SPI controller, and in whether their
//! `FLASH_BEGIN` variants carry the trailing `encrypted` word.

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::{ChipDetectError, Error};

use self::{esp32::Esp32, esp32c3::Esp32c3, esp32s2::Esp32s2, esp32s3::Esp32s3, esp8266::Esp8266};

mod esp32;
mod esp32c3;
mod esp32s2;
mod esp32s3;
mod esp8266;

/// Register that holds a per-family magic word, readable before the chip has
/// been identified
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP8266
    Esp8266,
    /// ESP32
    Esp32,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp32c3::has_magic_value(magic) {
            Ok(Chip::Esp32c3)
        } else if Esp32s2::has_magic_value(magic) {
            Ok(Chip::Esp32s2)
        } else if Esp32s3::has_magic_value(magic) {
            Ok(Chip::Esp32s3)
        } else {
            Err(Error::UnrecognizedChip(ChipDetectError::from(magic)))
        }
    }

    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp8266 => Box::new(Esp8266),
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32c3 => Box::new(Esp32c3),
            Chip::Esp32s2 => Box::new(Esp32s2),
            Chip::Esp32s3 => Box::new(Esp32s3),
        }
    }

    /// Number of trailing status bytes in responses from this chip's ROM
    pub fn status_len(&self) -> usize {
        match self {
            Chip::Esp8266 => 2,
            _ => 4,
        }
    }
}

/// SPI controller register addresses
#[derive(Debug)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Operations for interacting with supported target devices
pub trait Target {
    /// SPI controller register addresses for the chip
    fn spi_registers(&self) -> SpiRegisters;

    /// Whether the ROM's `FLASH_BEGIN` variants take the trailing `encrypted`
    /// word on this chip
    fn supports_encrypted_flash(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_value_dispatch() {
        assert_eq!(Chip::from_magic(0xfff0_c101).unwrap(), Chip::Esp8266);
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x6921_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1b31_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x0000_07c6).unwrap(), Chip::Esp32s2);
        assert_eq!(Chip::from_magic(0x9).unwrap(), Chip::Esp32s3);

        assert!(Chip::from_magic(0xdead_beef).is_err());
    }

    #[test]
    fn esp8266_has_no_data_length_registers() {
        let registers = Chip::Esp8266.into_target().spi_registers();
        assert!(registers.mosi_length().is_none());
        assert!(registers.miso_length().is_none());
        assert_eq!(registers.cmd(), 0x6000_0200);
        assert_eq!(registers.w0(), 0x6000_0240);
    }

    #[test]
    fn esp32_register_block() {
        let registers = Chip::Esp32.into_target().spi_registers();
        assert_eq!(registers.cmd(), 0x3ff4_2000);
        assert_eq!(registers.usr(), 0x3ff4_201c);
        assert_eq!(registers.usr2(), 0x3ff4_2024);
        assert_eq!(registers.mosi_length(), Some(0x3ff4_2028));
        assert_eq!(registers.miso_length(), Some(0x3ff4_202c));
        assert_eq!(registers.w0(), 0x3ff4_2080);
    }

    #[test]
    fn status_tail_length_per_chip() {
        assert_eq!(Chip::Esp8266.status_len(), 2);
        assert_eq!(Chip::Esp32.status_len(), 4);
        assert_eq!(Chip::Esp32s3.status_len(), 4);
    }

    #[test]
    fn encrypted_flash_capability() {
        assert!(!Chip::Esp8266.into_target().supports_encrypted_flash());
        assert!(!Chip::Esp32.into_target().supports_encrypted_flash());
        assert!(Chip::Esp32c3.into_target().supports_encrypted_flash());
        assert!(Chip::Esp32s2.into_target().supports_encrypted_flash());
        assert!(Chip::Esp32s3.into_target().supports_encrypted_flash());
    }
}
