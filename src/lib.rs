//! A library for driving the serial ROM bootloader of Espressif devices
//!
//! The mask ROM of the ESP8266 and the ESP32 family accepts SLIP-framed
//! commands over a serial line and uses them to load firmware into RAM or
//! onto the external SPI flash. This crate implements the host side of that
//! dialogue:
//!
//! - [Port](interface::Port) is the transport boundary: byte I/O, an armed
//!   deadline, and the reset straps. [SerialInterface](interface::SerialInterface)
//!   implements it for host serial adapters.
//! - [Connection](connection::Connection) frames commands, filters replies,
//!   and maps the loader's status bytes onto [Error].
//! - [Flasher](flasher::Flasher) holds the session state: the detected chip,
//!   the negotiated block size, and the running digest used to verify
//!   writes.
//!
//! ```no_run
//! use esploader::{ConnectOptions, Flasher, SerialInterface, SpiAttachParams};
//!
//! # fn main() -> Result<(), esploader::Error> {
//! let port = SerialInterface::open("/dev/ttyUSB0", 115_200)?;
//! let mut flasher = Flasher::connect(port, SpiAttachParams::default(), ConnectOptions::default())?;
//!
//! let image = std::fs::read("app.bin").expect("firmware image");
//! flasher.flash_start(0x10000, image.len() as u32, 0x400)?;
//! for block in image.chunks(0x400) {
//!     flasher.flash_write(block)?;
//! }
//! flasher.flash_finish(false)?;
//! flasher.verify()?;
//! flasher.reset_target()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod targets;

pub use self::{
    error::Error,
    flasher::{ConnectOptions, FlashSize, Flasher, SpiAttachParams},
    interface::{Port, SerialInterface},
    targets::Chip,
};
