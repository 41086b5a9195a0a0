//! Library errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use slip_codec::SlipError;
use thiserror::Error;

use crate::{command::CommandType, targets::Chip};

/// All errors surfaced by this library
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Chip not recognized, supported chip types are esp8266, esp32, esp32-c3, esp32-s2, and esp32-s3")]
    #[diagnostic(
        code(esploader::unrecognized_chip),
        help("If your chip is supported, try hard-resetting the device and try again")
    )]
    UnrecognizedChip(#[from] ChipDetectError),

    #[error("Flash chip not supported, flash sizes from 256 KB to 16 MB are supported")]
    #[diagnostic(code(esploader::unrecognized_flash))]
    UnsupportedFlash(#[from] FlashDetectError),

    #[error(
        "Image of {image_size:#x} bytes at offset {offset:#x} does not fit in {flash_size:#x} bytes of flash"
    )]
    #[diagnostic(code(esploader::image_size))]
    ImageSize {
        offset: u32,
        image_size: u32,
        flash_size: u32,
    },

    #[error("Flash content verification failed: expected {expected}, device reported {received}")]
    #[diagnostic(
        code(esploader::invalid_md5),
        help("The flash contents differ from what was written; try flashing again at a lower baud rate")
    )]
    InvalidMd5 { expected: String, received: String },

    #[error("Invalid parameter: {0}")]
    #[diagnostic(code(esploader::invalid_param))]
    InvalidParam(&'static str),

    #[error("The {command} command is not supported by the {chip}")]
    #[diagnostic(code(esploader::unsupported_func))]
    UnsupportedFunction { chip: Chip, command: CommandType },

    #[error("Malformed response received from device")]
    #[diagnostic(code(esploader::internal_error))]
    InternalError,
}

/// Transport-level errors
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esploader::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your rom might be corrupted")
    )]
    FramingError,

    #[error("Received packet too large for buffer")]
    #[diagnostic(
        code(esploader::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your rom might be corrupted")
    )]
    OverSizedPacket,
}

/// The command being run when a timeout elapsed, if known
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::FramingError,
        }
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// Error codes the ROM loader reports in the status tail of a response
#[derive(Copy, Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::invalid_crc))]
    InvalidCrc = 0x05,

    #[error("Received command is invalid")]
    #[diagnostic(code(esploader::rom::invalid_command))]
    InvalidCommand = 0x06,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::command_failed))]
    CommandFailed = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    ReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidCrc,
            0x06 => RomErrorKind::InvalidCommand,
            0x07 => RomErrorKind::CommandFailed,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::ReadLengthError,
            0x0b => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

/// A command acknowledged by the device with its failure flag set
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

#[derive(Debug, Error)]
#[error("Unrecognized magic value {0:#x}")]
pub struct ChipDetectError(u32);

impl From<u32> for ChipDetectError {
    fn from(err: u32) -> Self {
        ChipDetectError(err)
    }
}

#[derive(Debug, Error)]
#[error("Unrecognized flash id {0:#x}")]
pub struct FlashDetectError(u8);

impl From<u8> for FlashDetectError {
    fn from(err: u8) -> Self {
        FlashDetectError(err)
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
