//! Commands understood by the ROM loader
//!
//! Every request shares a common header: a direction byte (0x00 for
//! requests), the opcode, the little-endian length of the payload, and a
//! checksum word which is nonzero only for the data-bearing commands.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, SpiAttachParams, CHECKSUM_INIT};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const FLASH_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(10);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const LOAD_RAM_TIMEOUT_PER_MB: Duration = Duration::from_secs(2_000);
// A single compressed block can expand into many flash sectors, and there is
// no way to know the expansion factor up front.
const FLASH_DEFLATE_DATA_TIMEOUT: Duration = Duration::from_secs(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Opcodes implemented by the ROM loader
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
    SpiSetParams = 0x0b,
    SpiAttach = 0x0d,
    ChangeBaud = 0x0f,
    FlashDeflateBegin = 0x10,
    FlashDeflateData = 0x11,
    FlashDeflateEnd = 0x12,
    FlashMd5 = 0x13,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashDeflateData => FLASH_DEFLATE_DATA_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for an operation whose duration scales with the amount of
    /// flash or RAM it touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                FLASH_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflateBegin => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::MemBegin | CommandType::MemData => {
                calc_timeout(LOAD_RAM_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => calc_timeout(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A request to the ROM loader, borrowing any bulk data it carries
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        total_size: u32,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    ChangeBaud {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashDeflateBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflateData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflateEnd {
        reboot: bool,
    },
    FlashMd5 {
        address: u32,
        size: u32,
    },
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::MemData { .. } => CommandType::MemData,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
            Command::FlashDeflateBegin { .. } => CommandType::FlashDeflateBegin,
            Command::FlashDeflateData { .. } => CommandType::FlashDeflateData,
            Command::FlashDeflateEnd { .. } => CommandType::FlashDeflateEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
        }
    }

    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflateBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::FlashDeflateData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } | Command::FlashDeflateEnd { reboot } => {
                write_basic(writer, &[if reboot { 0 } else { 1 }], 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct MemBeginParams {
                    size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                }
                let params = MemBeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: if no_entry { 1 } else { 0 },
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { total_size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct SpiParams {
                    id: u32,
                    total_size: u32,
                    block_size: u32,
                    sector_size: u32,
                    page_size: u32,
                    status_mask: u32,
                }
                let params = SpiParams {
                    id: 0,
                    total_size,
                    block_size: 64 * 1024,
                    sector_size: 4 * 1024,
                    page_size: 0x100,
                    status_mask: 0xffff,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::SpiAttach { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::ChangeBaud {
                new_baud,
                prior_baud,
            } => {
                // length
                writer.write_all(&(8u16.to_le_bytes()))?;
                // checksum
                writer.write_all(&(0u32.to_le_bytes()))?;
                // data
                writer.write_all(&new_baud.to_le_bytes())?;
                writer.write_all(&prior_baud.to_le_bytes())?;
            }
            Command::FlashMd5 { address, size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct Md5Params {
                    address: u32,
                    size: u32,
                    reserved_0: u32,
                    reserved_1: u32,
                }
                let params = Md5Params {
                    address,
                    size,
                    reserved_0: 0,
                    reserved_1: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    mut writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };

    // Newer ROMs take a trailing `encrypted` word in addition to the common
    // four fields; the ESP8266 and ESP32 reject the longer form.
    let mut length = size_of::<BeginParams>();
    if supports_encryption {
        length += size_of::<u32>();
    }

    writer.write_all(&((length as u16).to_le_bytes()))?;
    writer.write_all(&(0u32.to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    if supports_encryption {
        writer.write_all(&(0u32.to_le_bytes()))?;
    }
    Ok(())
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: block_data.len() as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command) -> Vec<u8> {
        let mut encoded = Vec::new();
        command.write(&mut encoded).unwrap();
        encoded
    }

    #[test]
    fn sync_frame_layout() {
        let encoded = encode(Command::Sync);

        assert_eq!(&encoded[..2], &[0x00, 0x08]);
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 36);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 0]);
        assert_eq!(&encoded[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(encoded[12..].iter().all(|b| *b == 0x55));
        assert_eq!(encoded.len(), 8 + 36);
    }

    #[test]
    fn begin_payload_is_tagged_by_encryption_support() {
        let short = encode(Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0x10000,
            supports_encryption: false,
        });
        assert_eq!(u16::from_le_bytes([short[2], short[3]]), 16);
        assert_eq!(short.len(), 8 + 16);

        let long = encode(Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0x10000,
            supports_encryption: true,
        });
        assert_eq!(u16::from_le_bytes([long[2], long[3]]), 20);
        assert_eq!(long.len(), 8 + 20);
        assert_eq!(&long[24..28], &[0, 0, 0, 0]);

        // The common fields are identical in both forms
        assert_eq!(&short[8..24], &long[8..24]);
        assert_eq!(&short[8..12], &0x1000u32.to_le_bytes());
        assert_eq!(&short[20..24], &0x10000u32.to_le_bytes());
    }

    #[test]
    fn data_command_pads_and_checksums() {
        let data = [0xaau8; 10];
        let encoded = encode(Command::FlashData {
            data: &data,
            pad_to: 16,
            pad_byte: 0xff,
            sequence: 3,
        });

        // total payload: 16 byte header + 10 data + 6 padding
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 32);

        let mut expected = CHECKSUM_INIT;
        for byte in data.iter().chain([0xffu8; 6].iter()) {
            expected ^= *byte;
        }
        assert_eq!(
            u32::from_le_bytes(encoded[4..8].try_into().unwrap()),
            expected as u32
        );

        // data_size reflects the caller's bytes, not the padding
        assert_eq!(&encoded[8..12], &10u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &3u32.to_le_bytes());
        assert!(encoded[24..34].iter().all(|b| *b == 0xaa));
        assert!(encoded[34..40].iter().all(|b| *b == 0xff));
        assert_eq!(encoded.len(), 8 + 32);
    }

    #[test]
    fn checksum_is_zero_for_non_data_commands() {
        for command in [
            Command::Sync,
            Command::FlashEnd { reboot: true },
            Command::ReadReg { address: 0x4000_1000 },
            Command::SpiSetParams { total_size: 0x400000 },
            Command::ChangeBaud {
                new_baud: 921_600,
                prior_baud: 0,
            },
            Command::FlashMd5 {
                address: 0,
                size: 0x1000,
            },
        ] {
            let encoded = encode(command);
            assert_eq!(&encoded[4..8], &[0, 0, 0, 0], "{:?}", command);
        }
    }

    #[test]
    fn spi_set_params_layout() {
        let encoded = encode(Command::SpiSetParams {
            total_size: 0x80_0000,
        });

        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 24);
        assert_eq!(&encoded[8..12], &0u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &0x80_0000u32.to_le_bytes());
        assert_eq!(&encoded[16..20], &0x1_0000u32.to_le_bytes());
        assert_eq!(&encoded[20..24], &0x1000u32.to_le_bytes());
        assert_eq!(&encoded[24..28], &0x100u32.to_le_bytes());
        assert_eq!(&encoded[28..32], &0xffffu32.to_le_bytes());
    }

    #[test]
    fn mem_end_stays_in_loader_for_zero_entry() {
        let encoded = encode(Command::MemEnd {
            no_entry: true,
            entry: 0,
        });
        assert_eq!(&encoded[8..12], &1u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &0u32.to_le_bytes());
    }

    #[test]
    fn size_scaled_timeouts_never_undershoot_the_default() {
        let small = CommandType::FlashBegin.timeout_for_size(0x400);
        assert_eq!(small, FLASH_TIMEOUT);

        let large = CommandType::FlashBegin.timeout_for_size(8 * 1024 * 1024);
        assert!(large > FLASH_TIMEOUT);
        assert!(large >= Duration::from_secs(80));
    }
}
