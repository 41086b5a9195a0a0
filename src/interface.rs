//! Transport abstraction
//!
//! The protocol engine only needs a byte stream with a deadline and control
//! over the reset straps; [Port] captures exactly that surface.
//! [SerialInterface] implements it on top of a host serial adapter, driving
//! the straps through the DTR and RTS lines the way USB-serial dev boards
//! wire them to EN and IO0.

use std::{
    io::{self, Read, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{FlowControl, SerialPort};

use crate::error::{ConnectionError, Error};

/// Time to hold the chip in reset while strapping the boot pin
const RESET_HOLD_DELAY: Duration = Duration::from_millis(100);
/// Time to wait before releasing the boot pin after a reset
const BOOT_HOLD_DELAY: Duration = Duration::from_millis(50);
/// Initial deadline; commands re-arm their own
const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// The transport a session runs over
///
/// Blocking reads and writes must honor the most recently armed deadline and
/// fail with [io::ErrorKind::TimedOut] once it expires.
pub trait Port: Read + Write {
    /// Strap the chip into its ROM bootloader
    fn enter_bootloader(&mut self) -> Result<(), ConnectionError>;

    /// Reset the chip into its regular boot path
    fn reset_target(&mut self) -> Result<(), ConnectionError>;

    /// Arm the deadline honored by subsequent blocking calls, replacing the
    /// previous one
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// The currently armed deadline
    fn timeout(&self) -> Duration;
}

/// [Port] implementation over a host serial adapter
pub struct SerialInterface {
    serial: Box<dyn SerialPort>,
}

impl SerialInterface {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        SerialInterface { serial }
    }

    /// Open a serial port by name, e.g. `/dev/ttyUSB0`
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, Error> {
        let serial = serialport::new(path, baud_rate)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_SERIAL_TIMEOUT)
            .open()?;

        Ok(SerialInterface { serial })
    }

    /// Change the local baud rate, after the device agreed to a new one
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error> {
        self.serial.set_baud_rate(baud_rate)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial.write_request_to_send(level)?;
        Ok(())
    }
}

impl Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.serial.read(buf)
    }
}

impl Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.serial.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.serial.flush()
    }
}

impl Port for SerialInterface {
    fn enter_bootloader(&mut self) -> Result<(), ConnectionError> {
        debug!("Entering bootloader with the classic DTR/RTS sequence");

        self.set_rts(false)?;
        self.set_dtr(false)?;

        self.set_rts(true)?; // EN = LOW, chip in reset
        self.set_dtr(false)?; // IO0 = HIGH

        sleep(RESET_HOLD_DELAY);

        self.set_rts(false)?; // EN = HIGH, chip out of reset
        self.set_dtr(true)?; // IO0 = LOW

        sleep(BOOT_HOLD_DELAY);

        self.set_rts(false)?;
        self.set_dtr(false)?; // IO0 = HIGH, done

        Ok(())
    }

    fn reset_target(&mut self) -> Result<(), ConnectionError> {
        debug!("Resetting target with an RTS pulse");

        self.set_rts(true)?; // EN = LOW, chip in reset

        sleep(RESET_HOLD_DELAY);

        self.set_rts(false)?;

        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.serial.timeout()
    }
}
