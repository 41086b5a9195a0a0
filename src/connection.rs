//! Request/response dialogue with a target device
//!
//! The [Connection] struct owns the transport and implements the framed
//! command exchange: requests go out as single SLIP frames, replies are
//! reassembled, filtered against the outstanding opcode, and their trailing
//! status bytes are mapped onto the error taxonomy.

use std::{
    io::{BufWriter, Write},
    time::Duration,
};

use log::debug;
use slip_codec::SlipDecoder;

use self::encoder::SlipEncoder;
use crate::{
    command::{Command, CommandType},
    error::{Error, ResultExt, RomError, RomErrorKind},
    interface::Port,
};

/// Replies the ROM emits in response to a single sync probe
const SYNC_REPLY_COUNT: usize = 8;
/// Direction byte of a response frame
const READ_DIRECTION: u8 = 0x01;
/// Direction, opcode, length and value field of a response
const RESPONSE_HEADER_SIZE: usize = 8;

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub direction: u8,
    pub command: u8,
    pub size: u16,
    pub value: u32,
    /// Response body with the trailing status bytes stripped
    pub body: Vec<u8>,
    pub failed: u8,
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection<P: Port> {
    port: P,
    decoder: SlipDecoder,
    status_len: usize,
}

impl<P: Port> Connection<P> {
    pub fn new(port: P) -> Self {
        Connection {
            port,
            decoder: SlipDecoder::new(),
            status_len: 4,
        }
    }

    /// Number of trailing status bytes in responses, which differs between
    /// ROM revisions
    pub(crate) fn set_status_len(&mut self, status_len: usize) {
        self.status_len = status_len;
    }

    /// Strap the device into its ROM loader
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        self.port.enter_bootloader()?;
        Ok(())
    }

    /// Hard-reset the device out of the loader
    pub fn reset_target(&mut self) -> Result<(), Error> {
        self.port.reset_target()?;
        Ok(())
    }

    /// Send a single sync probe and consume the burst of replies it provokes
    ///
    /// The first matching reply decides the outcome; the remainder are
    /// drained so they do not linger in the receive path and shadow the
    /// response of the next command.
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.write_command(Command::Sync)
            .for_command(CommandType::Sync)?;
        self.read_command_response(CommandType::Sync)
            .for_command(CommandType::Sync)?;

        for _ in 1..SYNC_REPLY_COUNT {
            if self.read_command_response(CommandType::Sync).is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Run a closure against the connection under the given deadline
    ///
    /// Arming a deadline replaces the previous one; the prior value is
    /// restored once the closure returns.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection<P>) -> Result<T, Error>,
    {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let result = f(self);
        self.port.set_timeout(old_timeout)?;

        result
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;
        self.read_command_response(ty).for_command(ty)
    }

    /// Write a command to the serial port as one SLIP frame
    ///
    /// The header and any borrowed data buffer are streamed through the
    /// encoder back to back, so bulk payloads are never copied.
    pub fn write_command(&mut self, command: Command) -> Result<(), Error> {
        debug!("Writing command: {:?}", command);

        let mut writer = BufWriter::new(&mut self.port);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Read responses until one matches the outstanding command
    ///
    /// Frames with the wrong direction or opcode are stale replies from
    /// earlier retries, or noise emitted by the target while booting; they
    /// are dropped without comment.
    fn read_command_response(&mut self, ty: CommandType) -> Result<CommandResponse, Error> {
        loop {
            let response = match self.read_response()? {
                Some(response) => response,
                None => continue,
            };

            if response.direction != READ_DIRECTION || response.command != ty as u8 {
                continue;
            }

            if response.failed != 0 {
                let kind = RomErrorKind::from(response.error);
                debug!("Device returned error: {}", kind);
                return Err(Error::RomError(RomError::new(ty, kind)));
            }

            return Ok(response);
        }
    }

    /// Read and parse one SLIP frame, if it is large enough to be a response
    fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let mut frame = Vec::with_capacity(1024);
        self.decoder.decode(&mut self.port, &mut frame)?;

        if frame.len() < RESPONSE_HEADER_SIZE + 2 {
            return Ok(None);
        }

        let body = &frame[RESPONSE_HEADER_SIZE..];
        // The status tail is two or four bytes depending on the ROM
        // revision, but always sits at the end of the frame.
        let status_len = self.status_len.min(body.len());
        let status = &body[body.len() - status_len..];

        Ok(Some(CommandResponse {
            direction: frame[0],
            command: frame[1],
            size: u16::from_le_bytes(frame[2..4].try_into().unwrap()),
            value: u32::from_le_bytes(frame[4..8].try_into().unwrap()),
            body: body[..body.len() - status_len].to_vec(),
            failed: status[0],
            error: status[1],
        }))
    }

    /// Read a register with the default command deadline
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })
        .map(|response| response.value)
    }

    /// Write a register with the default command deadline
    pub fn write_reg(
        &mut self,
        addr: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
                delay_us,
            })
        })?;

        Ok(())
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;
        Ok(())
    }

    /// Give the transport back to the caller
    pub fn into_port(self) -> P {
        self.port
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<'a, W: Write> Write for SlipEncoder<'a, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}
