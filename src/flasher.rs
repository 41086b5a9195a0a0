//! Write firmware to a target device
//!
//! The [Flasher] struct holds one session against a device's ROM loader:
//! the detected chip, the block size negotiated for the current streaming
//! operation, and the running digest used to verify what was written. It is
//! created by [Flasher::connect], which straps the chip into the loader and
//! synchronizes with it.

use std::{thread::sleep, time::Duration};

use log::debug;
use md5::{Digest, Md5};

use crate::{
    command::{Command, CommandType},
    connection::Connection,
    error::{ConnectionError, Error, FlashDetectError, ResultExt, TimedOutCommand},
    interface::Port,
    targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
};

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

/// Flash sector size of every supported device
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;
/// Default block size for flash streaming operations
pub const FLASH_WRITE_SIZE: u32 = 0x400;

const PADDING_PATTERN: u8 = 0xff;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// JEDEC read-identification opcode
const SPI_FLASH_READ_ID: u8 = 0x9f;
/// Bounded by host round-trips, not wall clock; each poll is a full
/// register-read command
const SPI_CMD_POLL_ATTEMPTS: u32 = 10;

const SPI_USR_CMD: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_CMD_LEN_SHIFT: u32 = 28;

/// Supported flash sizes, keyed by the JEDEC capacity byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum FlashSize {
    /// 256 KB
    #[strum(serialize = "256K")]
    Flash256Kb = 0x12,
    /// 512 KB
    #[strum(serialize = "512K")]
    Flash512Kb = 0x13,
    /// 1 MB
    #[strum(serialize = "1M")]
    Flash1Mb = 0x14,
    /// 2 MB
    #[strum(serialize = "2M")]
    Flash2Mb = 0x15,
    /// 4 MB
    #[strum(serialize = "4M")]
    Flash4Mb = 0x16,
    /// 8 MB
    #[strum(serialize = "8M")]
    Flash8Mb = 0x17,
    /// 16 MB
    #[strum(serialize = "16M")]
    Flash16Mb = 0x18,
}

impl FlashSize {
    fn from(value: u8) -> Result<FlashSize, Error> {
        match value {
            0x12 => Ok(FlashSize::Flash256Kb),
            0x13 => Ok(FlashSize::Flash512Kb),
            0x14 => Ok(FlashSize::Flash1Mb),
            0x15 => Ok(FlashSize::Flash2Mb),
            0x16 => Ok(FlashSize::Flash4Mb),
            0x17 => Ok(FlashSize::Flash8Mb),
            0x18 => Ok(FlashSize::Flash16Mb),
            _ => Err(Error::UnsupportedFlash(FlashDetectError::from(value))),
        }
    }

    /// Returns the flash size in bytes
    pub fn size(self) -> u32 {
        1 << (self as u32)
    }
}

/// Parameters for attaching to a target device's SPI flash
///
/// The all-zero default tells the ROM to use the pin assignment fused into
/// the chip, which is correct for almost every board.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    pub const fn esp32_pico_d4() -> Self {
        SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        }
    }

    /// Pack the pin assignment into the wire form the ROM expects: the pin
    /// configuration word followed by a zero word.
    pub fn encode(self) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();
        encoded.extend_from_slice(&0u32.to_le_bytes());

        encoded
    }
}

/// Knobs for the initial synchronization
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Deadline for a single sync probe
    pub sync_timeout: Duration,
    /// How many probes to send before giving up
    pub trials: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            sync_timeout: Duration::from_millis(100),
            trials: 10,
        }
    }
}

/// Running digest over the region a streaming operation writes
struct ImageDigest {
    context: Md5,
    start_address: u32,
    image_size: u32,
}

impl ImageDigest {
    fn new(start_address: u32, image_size: u32) -> Self {
        ImageDigest {
            context: Md5::new(),
            start_address,
            image_size,
        }
    }

    /// Absorb one payload, rounded up to the word boundary the device hashes
    /// in, with the flash padding pattern filling the gap
    fn update(&mut self, payload: &[u8]) {
        self.context.update(payload);

        let rounded = (payload.len() + 3) & !3;
        let padding = rounded - payload.len();
        if padding > 0 {
            self.context.update(&[PADDING_PATTERN; 3][..padding]);
        }
    }

    /// Render the digest as the 32 lowercase hex characters the device
    /// reports
    fn hex_digest(&self) -> String {
        hex_string(self.context.clone().finalize().as_slice())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Newer ROMs answer the digest request with 32 hex characters; older
/// revisions send the 16 raw bytes instead.
fn parse_md5_response(body: &[u8]) -> Result<String, Error> {
    match body.len() {
        n if n >= 32 => Ok(String::from_utf8_lossy(&body[..32]).into_owned()),
        n if n >= 16 => Ok(hex_string(&body[..16])),
        _ => Err(Error::InternalError),
    }
}

/// Connect to and flash a target device
pub struct Flasher<P: Port> {
    /// Connection for loader commands
    connection: Connection<P>,
    /// Detected chip
    chip: Chip,
    /// Configuration for SPI attached flash (0 to use fused values)
    spi_params: SpiAttachParams,
    /// Block size of the streaming operation in progress, 0 when none
    flash_write_size: u32,
    /// Sequence number of the next data packet
    sequence: u32,
    /// Digest state of the current or just-finished streaming operation
    digest: Option<ImageDigest>,
}

impl<P: Port> Flasher<P> {
    /// Strap the device into its ROM loader and synchronize with it
    pub fn connect(
        port: P,
        spi_params: SpiAttachParams,
        options: ConnectOptions,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(port);
        connection.enter_bootloader()?;

        let mut trials = options.trials.max(1);
        loop {
            match connection.with_timeout(options.sync_timeout, |connection| connection.sync()) {
                Ok(()) => break,
                Err(Error::Connection(ConnectionError::Timeout(_))) => {
                    trials -= 1;
                    if trials == 0 {
                        return Err(Error::Connection(ConnectionError::Timeout(
                            CommandType::Sync.into(),
                        )));
                    }
                    sleep(SYNC_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }

        // Detect which chip we are connected to
        let magic = connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)?;
        debug!("Detected chip: {}", chip);
        connection.set_status_len(chip.status_len());

        let mut flasher = Flasher {
            connection,
            chip,
            spi_params,
            flash_write_size: 0,
            sequence: 0,
            digest: None,
        };

        if chip == Chip::Esp8266 {
            // The ESP8266 ROM mis-times its first flash erase unless a
            // zero-length FLASH_BEGIN is issued up front.
            flasher
                .connection
                .with_timeout(CommandType::FlashBegin.timeout(), |connection| {
                    connection.command(Command::FlashBegin {
                        size: 0,
                        blocks: 0,
                        block_size: 0,
                        offset: 0,
                        supports_encryption: false,
                    })
                })?;
        } else {
            let spi_params = flasher.spi_params;
            flasher
                .connection
                .with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                    connection.command(Command::SpiAttach { spi_params })
                })?;
        }

        Ok(flasher)
    }

    /// The chip type that the flasher is connected to
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// The active connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.connection
    }

    /// Give the transport back to the caller
    pub fn into_port(self) -> P {
        self.connection.into_port()
    }

    /// Begin a raw streaming write to SPI flash
    pub fn flash_start(
        &mut self,
        offset: u32,
        image_size: u32,
        block_size: u32,
    ) -> Result<(), Error> {
        if block_size == 0 {
            return Err(Error::InvalidParam("block size must be nonzero"));
        }

        let blocks_to_write = image_size.div_ceil(block_size);
        let erase_size = block_size * blocks_to_write;

        self.start_flash_stream(offset, image_size, block_size, erase_size, blocks_to_write, false)
    }

    /// Begin a streaming write of pre-compressed data; `image_size` is the
    /// uncompressed length, `compressed_size` the byte count on the wire
    pub fn flash_defl_start(
        &mut self,
        offset: u32,
        image_size: u32,
        compressed_size: u32,
        block_size: u32,
    ) -> Result<(), Error> {
        if block_size == 0 {
            return Err(Error::InvalidParam("block size must be nonzero"));
        }

        let blocks_to_write = compressed_size.div_ceil(block_size);
        // The erase region is sized from what the image inflates to, not
        // from the byte count that travels on the wire.
        let erase_size = block_size * image_size.div_ceil(block_size);

        self.start_flash_stream(offset, image_size, block_size, erase_size, blocks_to_write, true)
    }

    fn start_flash_stream(
        &mut self,
        offset: u32,
        image_size: u32,
        block_size: u32,
        erase_size: u32,
        blocks_to_write: u32,
        deflated: bool,
    ) -> Result<(), Error> {
        match self.detect_flash_size() {
            Ok(flash_size) => {
                if offset as u64 + image_size as u64 > flash_size.size() as u64 {
                    return Err(Error::ImageSize {
                        offset,
                        image_size,
                        flash_size: flash_size.size(),
                    });
                }
                self.connection
                    .with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                        connection.command(Command::SpiSetParams {
                            total_size: flash_size.size(),
                        })
                    })?;
            }
            Err(err) => {
                debug!("Flash size detection failed, falling back to default: {err}")
            }
        }

        self.digest = Some(ImageDigest::new(offset, image_size));

        let supports_encryption = self.chip.into_target().supports_encrypted_flash();
        let command = if deflated {
            Command::FlashDeflateBegin {
                size: erase_size,
                blocks: blocks_to_write,
                block_size,
                offset,
                supports_encryption,
            }
        } else {
            Command::FlashBegin {
                size: erase_size,
                blocks: blocks_to_write,
                block_size,
                offset,
                supports_encryption,
            }
        };

        self.connection
            .with_timeout(command.timeout_for_size(erase_size), |connection| {
                connection.command(command)
            })
            .flashing()?;

        self.sequence = 0;
        self.flash_write_size = block_size;

        Ok(())
    }

    /// Stream one block of a raw flash write
    ///
    /// Payloads shorter than the negotiated block size are padded with 0xFF
    /// up to it; a payload larger than the block size is rejected.
    pub fn flash_write(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() as u32 > self.flash_write_size {
            return Err(Error::InvalidParam("payload exceeds the negotiated block size"));
        }

        if let Some(digest) = self.digest.as_mut() {
            digest.update(payload);
        }

        let sequence = self.sequence;
        self.sequence += 1;

        let pad_to = self.flash_write_size as usize;
        self.connection
            .with_timeout(CommandType::FlashData.timeout(), |connection| {
                connection.command(Command::FlashData {
                    data: payload,
                    pad_to,
                    pad_byte: PADDING_PATTERN,
                    sequence,
                })
            })
            .flashing()?;

        Ok(())
    }

    /// Stream one block of pre-compressed data, exactly as provided
    pub fn flash_defl_write(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() as u32 > self.flash_write_size {
            return Err(Error::InvalidParam("payload exceeds the negotiated block size"));
        }

        if let Some(digest) = self.digest.as_mut() {
            digest.update(payload);
        }

        let sequence = self.sequence;
        self.sequence += 1;

        self.connection
            .with_timeout(CommandType::FlashDeflateData.timeout(), |connection| {
                connection.command(Command::FlashDeflateData {
                    data: payload,
                    pad_to: 0,
                    pad_byte: PADDING_PATTERN,
                    sequence,
                })
            })
            .flashing()?;

        Ok(())
    }

    /// End a raw streaming write; the device reboots into the flashed image
    /// or stays in the loader
    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection
            .with_timeout(CommandType::FlashEnd.timeout(), |connection| {
                connection.command(Command::FlashEnd { reboot })
            })
            .flashing()?;

        self.flash_write_size = 0;

        Ok(())
    }

    /// End a compressed streaming write
    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection
            .with_timeout(CommandType::FlashDeflateEnd.timeout(), |connection| {
                connection.command(Command::FlashDeflateEnd { reboot })
            })
            .flashing()?;

        self.flash_write_size = 0;

        Ok(())
    }

    /// Begin a download into device RAM
    pub fn mem_start(&mut self, offset: u32, total_size: u32, block_size: u32) -> Result<(), Error> {
        if block_size == 0 {
            return Err(Error::InvalidParam("block size must be nonzero"));
        }

        let blocks = total_size.div_ceil(block_size);
        self.connection.with_timeout(
            CommandType::MemBegin.timeout_for_size(total_size),
            |connection| {
                connection.command(Command::MemBegin {
                    size: total_size,
                    blocks,
                    block_size,
                    offset,
                })
            },
        )?;

        self.sequence = 0;

        Ok(())
    }

    /// Stream one block into device RAM
    pub fn mem_write(&mut self, payload: &[u8]) -> Result<(), Error> {
        let sequence = self.sequence;
        self.sequence += 1;

        self.connection.with_timeout(
            CommandType::MemData.timeout_for_size(payload.len() as u32),
            |connection| {
                connection.command(Command::MemData {
                    data: payload,
                    pad_to: 4,
                    pad_byte: 0,
                    sequence,
                })
            },
        )?;

        Ok(())
    }

    /// End a RAM download; `entry == 0` keeps the loader running instead of
    /// jumping
    pub fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        self.connection
            .with_timeout(CommandType::MemEnd.timeout(), |connection| {
                connection.command(Command::MemEnd {
                    no_entry: entry == 0,
                    entry,
                })
            })?;

        Ok(())
    }

    /// Compare the digest of the last streaming write against what the
    /// device reads back from flash
    pub fn verify(&mut self) -> Result<(), Error> {
        if self.chip == Chip::Esp8266 {
            return Err(Error::UnsupportedFunction {
                chip: self.chip,
                command: CommandType::FlashMd5,
            });
        }

        let digest = self
            .digest
            .as_ref()
            .ok_or(Error::InvalidParam("no streaming write to verify"))?;
        let expected = digest.hex_digest();
        let (address, size) = (digest.start_address, digest.image_size);

        let response = self
            .connection
            .with_timeout(CommandType::FlashMd5.timeout_for_size(size), |connection| {
                connection.command(Command::FlashMd5 { address, size })
            })?;
        let received = parse_md5_response(&response.body)?;

        if expected != received {
            debug!("MD5 mismatch, expected {expected}, received {received}");
            return Err(Error::InvalidMd5 { expected, received });
        }

        Ok(())
    }

    /// Digest an arbitrary flash region on the device, returned as 32
    /// lowercase hex characters
    pub fn read_md5(&mut self, address: u32, size: u32) -> Result<String, Error> {
        if self.chip == Chip::Esp8266 {
            return Err(Error::UnsupportedFunction {
                chip: self.chip,
                command: CommandType::FlashMd5,
            });
        }

        if let Ok(flash_size) = self.detect_flash_size() {
            self.connection
                .with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                    connection.command(Command::SpiSetParams {
                        total_size: flash_size.size(),
                    })
                })?;
        }

        let response = self
            .connection
            .with_timeout(CommandType::FlashMd5.timeout_for_size(size), |connection| {
                connection.command(Command::FlashMd5 { address, size })
            })?;

        parse_md5_response(&response.body)
    }

    /// Read a register on the device
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.connection.read_reg(address)
    }

    /// Write a register on the device
    pub fn write_reg(
        &mut self,
        address: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.connection.write_reg(address, value, mask, delay_us)
    }

    /// Ask the ROM to switch to a new baud rate
    ///
    /// After the response arrives the caller must match the local side of
    /// the port, e.g. via [crate::interface::SerialInterface::set_baud_rate].
    pub fn change_baud(&mut self, speed: u32) -> Result<(), Error> {
        if self.chip == Chip::Esp8266 {
            return Err(Error::UnsupportedFunction {
                chip: self.chip,
                command: CommandType::ChangeBaud,
            });
        }

        debug!("Change baud to: {}", speed);
        self.connection
            .with_timeout(CommandType::ChangeBaud.timeout(), |connection| {
                connection.command(Command::ChangeBaud {
                    new_baud: speed,
                    prior_baud: 0,
                })
            })?;

        Ok(())
    }

    /// Probe the JEDEC id of the attached SPI flash and derive its capacity
    pub fn detect_flash_size(&mut self) -> Result<FlashSize, Error> {
        let flash_id = self.spi_command(SPI_FLASH_READ_ID, &[], 24)?;
        let size_id = (flash_id >> 16) as u8;

        FlashSize::from(size_id)
    }

    /// Run one command on the device's SPI controller by driving its
    /// registers, and read back up to one data word
    fn spi_command(&mut self, opcode: u8, data: &[u8], read_bits: u32) -> Result<u32, Error> {
        assert!(read_bits <= 32, "at most one data word can be read back");
        assert!(data.len() <= 64, "at most 64 bytes can be written per command");

        let spi_registers = self.chip.into_target().spi_registers();

        // Save the controller configuration; the loader needs it intact
        // afterwards
        let old_spi_usr = self.connection.read_reg(spi_registers.usr())?;
        let old_spi_usr2 = self.connection.read_reg(spi_registers.usr2())?;

        let mosi_bits = data.len() as u32 * 8;
        if let (Some(mosi_length), Some(miso_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if mosi_bits > 0 {
                self.connection.write_reg(mosi_length, mosi_bits - 1, None, 0)?;
            }
            if read_bits > 0 {
                self.connection.write_reg(miso_length, read_bits - 1, None, 0)?;
            }
        } else {
            // The ESP8266 packs both transfer lengths into USR1
            let mosi_mask = if mosi_bits == 0 { 0 } else { mosi_bits - 1 };
            let miso_mask = if read_bits == 0 { 0 } else { read_bits - 1 };
            self.connection.write_reg(
                spi_registers.usr1(),
                (miso_mask << 8) | (mosi_mask << 17),
                None,
                0,
            )?;
        }

        let mut usr = SPI_USR_CMD;
        if read_bits > 0 {
            usr |= SPI_USR_MISO;
        }
        if !data.is_empty() {
            usr |= SPI_USR_MOSI;
        }
        self.connection.write_reg(spi_registers.usr(), usr, None, 0)?;
        self.connection.write_reg(
            spi_registers.usr2(),
            (7 << SPI_CMD_LEN_SHIFT) | opcode as u32,
            None,
            0,
        )?;

        if data.is_empty() {
            // Clear the data register before reading it back
            self.connection.write_reg(spi_registers.w0(), 0, None, 0)?;
        } else {
            for (i, chunk) in data.chunks(4).enumerate() {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                self.connection.write_reg(
                    spi_registers.w0() + 4 * i as u32,
                    u32::from_le_bytes(word),
                    None,
                    0,
                )?;
            }
        }

        self.connection
            .write_reg(spi_registers.cmd(), SPI_CMD_USR, None, 0)?;

        let mut attempts = SPI_CMD_POLL_ATTEMPTS;
        loop {
            if self.connection.read_reg(spi_registers.cmd())? & SPI_CMD_USR == 0 {
                break;
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(Error::Connection(ConnectionError::Timeout(
                    TimedOutCommand::default(),
                )));
            }
        }

        let result = self.connection.read_reg(spi_registers.w0())?;

        self.connection
            .write_reg(spi_registers.usr(), old_spi_usr, None, 0)?;
        self.connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None, 0)?;

        Ok(result)
    }

    /// Hard-reset the target; the session is back to square one afterwards
    pub fn reset_target(&mut self) -> Result<(), Error> {
        self.connection.reset_target()
    }
}

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}
