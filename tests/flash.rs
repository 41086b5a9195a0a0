//! End-to-end exercises of the loader dialogue against a scripted port
//!
//! [MockPort] records every SLIP frame the driver writes and lets a small
//! ROM simulation queue the replies, so entire sessions run without
//! hardware: strapping, sync, chip detection, streaming writes and digest
//! verification.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    time::Duration,
};

use flate2::{write::ZlibEncoder, Compression};
use md5::{Digest, Md5};

use esploader::{
    error::ConnectionError, Chip, ConnectOptions, Error, Flasher, Port, SpiAttachParams,
};

const END: u8 = 0xc0;
const ESC: u8 = 0xdb;
const ESC_END: u8 = 0xdc;
const ESC_ESC: u8 = 0xdd;

const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// A bare-bones ROM loader: answers sync probes, keeps a register file, and
/// acknowledges everything else
struct RomSim {
    chip_magic: u32,
    status_len: usize,
    /// Word returned from the SPI data register after a flash id probe
    flash_id: u32,
    spi_cmd_reg: u32,
    spi_w0_reg: u32,
    regs: HashMap<u32, u32>,
    /// Body of the reply to a digest request
    md5_body: Vec<u8>,
    /// Number of leading sync probes to leave unanswered
    sync_ignores: u32,
    /// Answer this opcode with a failure status carrying the given error code
    fail_op: Option<(u8, u8)>,
}

impl RomSim {
    fn esp32() -> Self {
        RomSim {
            chip_magic: 0x00f0_1d83,
            status_len: 4,
            flash_id: 0x0017_4016, // capacity byte 0x17, 8 MiB
            spi_cmd_reg: 0x3ff4_2000,
            spi_w0_reg: 0x3ff4_2080,
            regs: HashMap::new(),
            md5_body: Vec::new(),
            sync_ignores: 0,
            fail_op: None,
        }
    }

    fn esp32s3() -> Self {
        RomSim {
            chip_magic: 0x9,
            spi_cmd_reg: 0x6000_2000,
            spi_w0_reg: 0x6000_2058,
            ..RomSim::esp32()
        }
    }

    fn esp8266() -> Self {
        RomSim {
            chip_magic: 0xfff0_c101,
            status_len: 2,
            spi_cmd_reg: 0x6000_0200,
            spi_w0_reg: 0x6000_0240,
            ..RomSim::esp32()
        }
    }

    fn reply(&self, op: u8, value: u32, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x01, op];
        frame.extend_from_slice(&(((body.len() + self.status_len) as u16).to_le_bytes()));
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(body);
        frame.extend(std::iter::repeat(0u8).take(self.status_len));
        frame
    }

    fn failure(&self, op: u8, error: u8) -> Vec<u8> {
        let mut frame = self.reply(op, 0, &[]);
        let status_at = frame.len() - self.status_len;
        frame[status_at] = 1;
        frame[status_at + 1] = error;
        frame
    }

    fn respond(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let op = frame[1];
        let payload = &frame[8..];

        if let Some((fail_op, error)) = self.fail_op {
            if op == fail_op {
                return vec![self.failure(op, error)];
            }
        }

        match op {
            // sync: one probe provokes a burst of replies
            0x08 => {
                if self.sync_ignores > 0 {
                    self.sync_ignores -= 1;
                    return Vec::new();
                }
                (0..8).map(|_| self.reply(op, 0, &[])).collect()
            }
            // READ_REG
            0x0a => {
                let address = u32::from_le_bytes(payload[..4].try_into().unwrap());
                let value = if address == CHIP_DETECT_MAGIC_REG_ADDR {
                    self.chip_magic
                } else if address == self.spi_w0_reg {
                    self.flash_id
                } else {
                    *self.regs.get(&address).unwrap_or(&0)
                };
                vec![self.reply(op, value, &[])]
            }
            // WRITE_REG
            0x09 => {
                let address = u32::from_le_bytes(payload[..4].try_into().unwrap());
                let mut value = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                // pretend the user command finishes instantly
                if address == self.spi_cmd_reg {
                    value = 0;
                }
                self.regs.insert(address, value);
                vec![self.reply(op, 0, &[])]
            }
            // SPI_FLASH_MD5
            0x13 => {
                let body = self.md5_body.clone();
                vec![self.reply(op, 0, &body)]
            }
            _ => vec![self.reply(op, 0, &[])],
        }
    }
}

/// Serial port talking to a [RomSim] instead of a device
struct MockPort {
    rom: RomSim,
    rx: VecDeque<u8>,
    /// Decoded command frames, in the order the driver sent them
    frames: Vec<Vec<u8>>,
    partial: Vec<u8>,
    in_escape: bool,
    timeout: Duration,
}

impl MockPort {
    fn new(rom: RomSim) -> Self {
        MockPort {
            rom,
            rx: VecDeque::new(),
            frames: Vec::new(),
            partial: Vec::new(),
            in_escape: false,
            timeout: Duration::from_secs(1),
        }
    }

    fn queue_reply(&mut self, frame: &[u8]) {
        self.rx.push_back(END);
        for &byte in frame {
            match byte {
                END => self.rx.extend([ESC, ESC_END]),
                ESC => self.rx.extend([ESC, ESC_ESC]),
                _ => self.rx.push_back(byte),
            }
        }
        self.rx.push_back(END);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline expired"));
        }
        let mut count = 0;
        while count < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if self.in_escape {
                match byte {
                    ESC_END => self.partial.push(END),
                    ESC_ESC => self.partial.push(ESC),
                    other => self.partial.push(other),
                }
                self.in_escape = false;
                continue;
            }
            match byte {
                END => {
                    if !self.partial.is_empty() {
                        let frame = std::mem::take(&mut self.partial);
                        for reply in self.rom.respond(&frame) {
                            self.queue_reply(&reply);
                        }
                        self.frames.push(frame);
                    }
                }
                ESC => self.in_escape = true,
                other => self.partial.push(other),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn enter_bootloader(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn reset_target(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn connect(rom: RomSim) -> Flasher<MockPort> {
    Flasher::connect(
        MockPort::new(rom),
        SpiAttachParams::default(),
        ConnectOptions::default(),
    )
    .unwrap()
}

/// Payload word `index` of a decoded command frame
fn field(frame: &[u8], index: usize) -> u32 {
    u32::from_le_bytes(frame[8 + 4 * index..][..4].try_into().unwrap())
}

fn payload(frame: &[u8]) -> &[u8] {
    &frame[8..]
}

fn find_op<'a>(frames: &'a [Vec<u8>], op: u8) -> &'a [u8] {
    frames
        .iter()
        .find(|frame| frame[1] == op)
        .unwrap_or_else(|| panic!("no frame with op {op:#04x} was sent"))
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher
        .finalize()
        .as_slice()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[test]
fn connect_retries_sync_until_the_rom_answers() {
    let mut rom = RomSim::esp32();
    rom.sync_ignores = 2;

    let options = ConnectOptions {
        sync_timeout: Duration::from_millis(100),
        trials: 3,
    };
    let flasher = Flasher::connect(MockPort::new(rom), SpiAttachParams::default(), options).unwrap();
    assert_eq!(flasher.chip(), Chip::Esp32);

    let port = flasher.into_port();
    let syncs = port.frames.iter().filter(|frame| frame[1] == 0x08).count();
    assert_eq!(syncs, 3);
    // the whole reply burst was consumed before the next command went out
    assert!(port.rx.is_empty());
    // a non-8266 chip gets its flash attached during connect
    find_op(&port.frames, 0x0d);
}

#[test]
fn connect_gives_up_after_the_trial_budget() {
    let mut rom = RomSim::esp32();
    rom.sync_ignores = u32::MAX;

    let options = ConnectOptions {
        sync_timeout: Duration::from_millis(100),
        trials: 3,
    };
    match Flasher::connect(MockPort::new(rom), SpiAttachParams::default(), options) {
        Err(Error::Connection(ConnectionError::Timeout(_))) => {}
        Err(other) => panic!("expected timeout, got {other:?}"),
        Ok(_) => panic!("expected timeout, connect succeeded"),
    }
}

#[test]
fn raw_flash_stream_pads_and_erases_by_block() {
    let mut flasher = connect(RomSim::esp32());
    let image: Vec<u8> = (0u8..=255).cycle().take(400).collect();

    flasher.flash_start(0x10000, 400, 1024).unwrap();
    flasher.flash_write(&image).unwrap();
    flasher.flash_finish(false).unwrap();

    let port = flasher.into_port();

    let begin = find_op(&port.frames, 0x02);
    assert_eq!(payload(begin).len(), 16);
    assert_eq!(field(begin, 0), 1024); // erase region, one full block
    assert_eq!(field(begin, 1), 1); // packets
    assert_eq!(field(begin, 2), 1024); // packet size
    assert_eq!(field(begin, 3), 0x10000);

    // the flash driver was configured with the probed total size
    let params = find_op(&port.frames, 0x0b);
    assert_eq!(field(params, 1), 8 * 1024 * 1024);

    let data = find_op(&port.frames, 0x03);
    assert_eq!(payload(data).len(), 16 + 1024);
    assert_eq!(field(data, 0), 400);
    assert_eq!(field(data, 1), 0); // sequence
    assert_eq!(&payload(data)[16..16 + 400], &image[..]);
    assert!(payload(data)[16 + 400..].iter().all(|b| *b == 0xff));

    // checksum folds data and padding from the 0xEF seed
    let mut check = 0xefu8;
    for byte in &payload(data)[16..] {
        check ^= *byte;
    }
    assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), check as u32);

    let end = find_op(&port.frames, 0x04);
    assert_eq!(payload(end), &[1]); // stay in the loader
}

#[test]
fn data_packets_count_up_from_zero_at_full_block_size() {
    let mut flasher = connect(RomSim::esp32());
    let image = vec![0xa5u8; 4000];

    flasher.flash_start(0, 4000, 1024).unwrap();
    for block in image.chunks(1024) {
        flasher.flash_write(block).unwrap();
    }
    flasher.flash_finish(false).unwrap();

    let port = flasher.into_port();
    let data: Vec<_> = port
        .frames
        .iter()
        .filter(|frame| frame[1] == 0x03)
        .collect();

    assert_eq!(data.len(), 4);
    for (i, frame) in data.iter().enumerate() {
        assert_eq!(field(frame, 1), i as u32);
        // every emitted block is exactly the negotiated write size
        assert_eq!(payload(frame).len(), 16 + 1024);
    }
    // the final partial block is padded out with the flash pattern
    assert_eq!(field(data[3], 0), 4000 - 3 * 1024);
    assert!(payload(data[3])[16 + (4000 - 3 * 1024) as usize..]
        .iter()
        .all(|b| *b == 0xff));
}

#[test]
fn oversized_image_is_rejected_by_the_probed_flash_size() {
    let mut flasher = connect(RomSim::esp32());

    match flasher.flash_start(0, 9 * 1024 * 1024, 1024) {
        Err(Error::ImageSize { flash_size, .. }) => assert_eq!(flash_size, 8 * 1024 * 1024),
        Err(other) => panic!("expected image size error, got {other:?}"),
        Ok(_) => panic!("expected image size error"),
    }

    // neither the flash driver setup nor the erase were attempted
    let port = flasher.into_port();
    assert!(port.frames.iter().all(|frame| frame[1] != 0x0b));
    assert!(port.frames.iter().all(|frame| frame[1] != 0x02));
}

#[test]
fn verify_compares_the_streamed_digest_with_the_device() {
    let image: Vec<u8> = (0u8..=255).collect();

    let mut rom = RomSim::esp32();
    rom.md5_body = hex_digest(&image).into_bytes();
    let mut flasher = connect(rom);

    flasher.flash_start(0x1000, 256, 1024).unwrap();
    flasher.flash_write(&image).unwrap();
    flasher.flash_finish(false).unwrap();
    flasher.verify().unwrap();

    let port = flasher.into_port();
    let md5 = find_op(&port.frames, 0x13);
    assert_eq!(field(md5, 0), 0x1000);
    assert_eq!(field(md5, 1), 256);
}

#[test]
fn a_single_differing_digest_byte_fails_verification() {
    let image: Vec<u8> = (0u8..=255).collect();

    let mut reported = hex_digest(&image).into_bytes();
    reported[0] = if reported[0] == b'0' { b'1' } else { b'0' };

    let mut rom = RomSim::esp32();
    rom.md5_body = reported;
    let mut flasher = connect(rom);

    flasher.flash_start(0x1000, 256, 1024).unwrap();
    flasher.flash_write(&image).unwrap();
    flasher.flash_finish(false).unwrap();

    match flasher.verify() {
        Err(Error::InvalidMd5 { expected, received }) => {
            assert_eq!(expected, hex_digest(&image));
            assert_ne!(expected, received);
        }
        Err(other) => panic!("expected digest mismatch, got {other:?}"),
        Ok(_) => panic!("expected digest mismatch"),
    }
}

#[test]
fn esp8266_rejects_baud_change_without_touching_the_wire() {
    let mut flasher = connect(RomSim::esp8266());
    assert_eq!(flasher.chip(), Chip::Esp8266);

    match flasher.change_baud(230_400) {
        Err(Error::UnsupportedFunction { .. }) => {}
        Err(other) => panic!("expected unsupported function, got {other:?}"),
        Ok(_) => panic!("expected unsupported function"),
    }

    match flasher.verify() {
        Err(Error::UnsupportedFunction { .. }) => {}
        other => panic!("expected unsupported function, got {other:?}"),
    }

    let port = flasher.into_port();
    assert!(port.frames.iter().all(|frame| frame[1] != 0x0f));
    assert!(port.frames.iter().all(|frame| frame[1] != 0x13));

    // connecting to an ESP8266 issues the zero-length erase workaround
    // instead of attaching the flash
    let quirk = find_op(&port.frames, 0x02);
    assert!(payload(quirk).iter().all(|b| *b == 0));
    assert!(port.frames.iter().all(|frame| frame[1] != 0x0d));
}

#[test]
fn compressed_stream_is_sent_unpadded() {
    let mut flasher = connect(RomSim::esp32());

    let image = vec![0x42u8; 4096];
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&image).unwrap();
    let compressed = encoder.finish().unwrap();
    assert!(compressed.len() <= 1024);

    flasher
        .flash_defl_start(0, 4096, compressed.len() as u32, 1024)
        .unwrap();
    flasher.flash_defl_write(&compressed).unwrap();
    flasher.flash_defl_finish(true).unwrap();

    let port = flasher.into_port();

    let begin = find_op(&port.frames, 0x10);
    assert_eq!(field(begin, 0), 4096); // erase sized from the uncompressed image
    assert_eq!(field(begin, 1), 1);
    assert_eq!(field(begin, 2), 1024);
    assert_eq!(field(begin, 3), 0);

    let data = find_op(&port.frames, 0x11);
    assert_eq!(field(data, 0), compressed.len() as u32);
    assert_eq!(field(data, 1), 0);
    // compressed payloads travel exactly as provided
    assert_eq!(payload(data).len(), 16 + compressed.len());
    assert_eq!(&payload(data)[16..], &compressed[..]);

    let end = find_op(&port.frames, 0x12);
    assert_eq!(payload(end), &[0]); // reboot
}

#[test]
fn newer_chips_append_the_encrypted_word_to_begin() {
    let mut flasher = connect(RomSim::esp32s3());
    assert_eq!(flasher.chip(), Chip::Esp32s3);

    flasher.flash_start(0, 100, 1024).unwrap();

    let port = flasher.into_port();
    let begin = find_op(&port.frames, 0x02);
    assert_eq!(payload(begin).len(), 20);
    assert_eq!(&payload(begin)[16..], &[0, 0, 0, 0]);
}

#[test]
fn writes_larger_than_the_block_are_rejected() {
    let mut flasher = connect(RomSim::esp32());

    // before any stream is open the write size is zero, so everything is
    // over the limit
    assert!(matches!(
        flasher.flash_write(&[0u8; 1]),
        Err(Error::InvalidParam(_))
    ));

    flasher.flash_start(0, 2048, 1024).unwrap();
    assert!(matches!(
        flasher.flash_write(&[0u8; 2000]),
        Err(Error::InvalidParam(_))
    ));
}

#[test]
fn ram_download_mirrors_the_flash_path() {
    let mut flasher = connect(RomSim::esp32());
    let blob = vec![0x11u8; 6000];

    flasher.mem_start(0x4009_0000, 6000, 0x1800).unwrap();
    for block in blob.chunks(0x1800) {
        flasher.mem_write(block).unwrap();
    }
    flasher.mem_finish(0x4009_0000).unwrap();

    let port = flasher.into_port();

    let begin = find_op(&port.frames, 0x05);
    assert_eq!(field(begin, 0), 6000);
    assert_eq!(field(begin, 1), 1);
    assert_eq!(field(begin, 2), 0x1800);
    assert_eq!(field(begin, 3), 0x4009_0000);

    let data = find_op(&port.frames, 0x07);
    assert_eq!(field(data, 0), 6000);
    assert_eq!(field(data, 1), 0);

    let end = find_op(&port.frames, 0x06);
    assert_eq!(field(end, 0), 0); // jump to the entry point
    assert_eq!(field(end, 1), 0x4009_0000);
}

#[test]
fn read_md5_digests_an_arbitrary_region() {
    let mut rom = RomSim::esp32();
    rom.md5_body = b"00112233445566778899aabbccddeeff".to_vec();
    let mut flasher = connect(rom);

    let digest = flasher.read_md5(0x8000, 0x1000).unwrap();
    assert_eq!(digest, "00112233445566778899aabbccddeeff");

    // the flash driver is configured from a fresh probe first
    let port = flasher.into_port();
    find_op(&port.frames, 0x0b);
}

#[test]
fn a_failed_status_surfaces_as_a_rom_error() {
    let mut rom = RomSim::esp32();
    rom.fail_op = Some((0x02, 0x08));
    let mut flasher = connect(rom);

    match flasher.flash_start(0, 1024, 1024) {
        Err(Error::RomError(_)) => {}
        Err(other) => panic!("expected rom error, got {other:?}"),
        Ok(_) => panic!("expected rom error"),
    }
}
